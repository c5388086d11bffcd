//! Private instance launchers
//!
//! A launcher starts one instance per registration and hands back where it
//! listens plus a handle that stops it again. Two flavours exist: a plain
//! process started from a command line, and a container started through the
//! docker CLI.

pub mod bash;
pub mod docker;
pub mod error;
pub mod launcher;
pub mod port;
pub mod template;

pub use bash::BashLauncher;
pub use docker::DockerLauncher;
pub use error::LaunchError;
pub use launcher::{
    InstanceHandle, InstanceLauncher, LaunchedInstance, Launcher, LauncherConfig, LauncherKind,
};
pub use port::allocate_port;
pub use template::CommandTemplate;
