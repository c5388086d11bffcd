use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Launcher errors
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("No free port: {0}")]
    PortUnavailable(String),

    #[error("Invalid launch command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    CommandFailed { program: String, status: ExitStatus },

    #[error("Instance did not report its port within {0:?}")]
    Timeout(Duration),

    #[error("Failed to stop instance: {0}")]
    Terminate(String),
}

impl LaunchError {
    /// True when the launch failed for lack of a usable port
    pub fn is_port_failure(&self) -> bool {
        matches!(self, LaunchError::PortUnavailable(_))
    }
}
