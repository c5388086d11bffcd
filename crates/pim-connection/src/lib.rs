//! Connection plumbing shared by the directory, registration and tunnel servers

pub mod listener;
pub mod notice;

pub use listener::{bind_with_retry, BindError};
pub use notice::{send_notice, Notifier};
