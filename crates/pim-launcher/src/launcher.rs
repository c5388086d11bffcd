//! Launcher capability and the configured launcher variants

use crate::bash::BashLauncher;
use crate::docker::DockerLauncher;
use crate::error::LaunchError;
use crate::template::CommandTemplate;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// A running instance owned by one registration session
///
/// Dropping a handle without calling [`terminate`](Self::terminate) still
/// stops the instance, but without waiting for it.
#[async_trait]
pub trait InstanceHandle: Send + fmt::Debug {
    /// Stop the instance and wait until it is gone
    async fn terminate(&mut self) -> Result<(), LaunchError>;
}

/// Where a freshly launched instance can be reached
#[derive(Debug)]
pub struct LaunchedInstance {
    pub address: String,
    pub port: u16,
    pub handle: Box<dyn InstanceHandle>,
}

/// Starts private instances
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<LaunchedInstance, LaunchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    Bash,
    Docker,
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LauncherKind::Bash => write!(f, "bash"),
            LauncherKind::Docker => write!(f, "docker"),
        }
    }
}

/// Launcher settings
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub kind: LauncherKind,
    pub command: String,
    /// Address registered in the directory for launched instances
    pub instance_address: String,
    /// Credentials for bash instances
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// How long a bash instance may take to announce its port
    pub launch_timeout: Duration,
}

impl LauncherConfig {
    pub fn new(kind: LauncherKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            instance_address: "127.0.0.1".to_string(),
            uid: None,
            gid: None,
            launch_timeout: Duration::from_secs(10),
        }
    }
}

/// The launcher selected by configuration
#[derive(Debug)]
pub enum InstanceLauncher {
    Bash(BashLauncher),
    Docker(DockerLauncher),
}

impl InstanceLauncher {
    pub fn from_config(config: LauncherConfig) -> Result<Self, LaunchError> {
        let template = CommandTemplate::parse(&config.command)?;

        Ok(match config.kind {
            LauncherKind::Bash => InstanceLauncher::Bash(
                BashLauncher::new(template, config.instance_address)
                    .with_credentials(config.uid, config.gid)
                    .with_launch_timeout(config.launch_timeout),
            ),
            LauncherKind::Docker => {
                InstanceLauncher::Docker(DockerLauncher::new(template, config.instance_address))
            }
        })
    }

    pub fn kind(&self) -> LauncherKind {
        match self {
            InstanceLauncher::Bash(_) => LauncherKind::Bash,
            InstanceLauncher::Docker(_) => LauncherKind::Docker,
        }
    }
}

#[async_trait]
impl Launcher for InstanceLauncher {
    async fn launch(&self) -> Result<LaunchedInstance, LaunchError> {
        match self {
            InstanceLauncher::Bash(launcher) => launcher.launch().await,
            InstanceLauncher::Docker(launcher) => launcher.launch().await,
        }
    }
}
