//! Container launcher
//!
//! Each instance gets a free host port and a random container name, both
//! substituted into the configured command. The command runs to completion
//! (typically `docker run -d ...`); the container is stopped by name.

use crate::error::LaunchError;
use crate::launcher::{InstanceHandle, LaunchedInstance};
use crate::port::allocate_port;
use crate::template::CommandTemplate;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_DOCKER_PROGRAM: &str = "docker";

/// Launches instances as containers
#[derive(Debug, Clone)]
pub struct DockerLauncher {
    template: CommandTemplate,
    instance_address: String,
    docker_program: String,
}

impl DockerLauncher {
    pub fn new(template: CommandTemplate, instance_address: impl Into<String>) -> Self {
        Self {
            template,
            instance_address: instance_address.into(),
            docker_program: DEFAULT_DOCKER_PROGRAM.to_string(),
        }
    }

    /// Program invoked as `<program> stop <name>` to stop containers
    pub fn with_docker_program(mut self, program: impl Into<String>) -> Self {
        self.docker_program = program.into();
        self
    }

    pub async fn launch(&self) -> Result<LaunchedInstance, LaunchError> {
        let port = allocate_port()?;
        let name = container_name();
        let argv = self.template.render(port, &name);

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| LaunchError::Spawn {
                program: argv[0].clone(),
                source,
            })?;

        if !output.status.success() {
            warn!(
                container = %name,
                "Container command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(LaunchError::CommandFailed {
                program: argv[0].clone(),
                status: output.status,
            });
        }

        info!(container = %name, port, "Started container");

        Ok(LaunchedInstance {
            address: self.instance_address.clone(),
            port,
            handle: Box::new(ContainerHandle {
                docker_program: self.docker_program.clone(),
                name,
                stopped: false,
            }),
        })
    }
}

/// `pim-` followed by 32 lowercase hex digits
fn container_name() -> String {
    format!("pim-{}", Uuid::new_v4().simple())
}

/// Handle to a started container
#[derive(Debug)]
struct ContainerHandle {
    docker_program: String,
    name: String,
    stopped: bool,
}

#[async_trait]
impl InstanceHandle for ContainerHandle {
    async fn terminate(&mut self) -> Result<(), LaunchError> {
        let status = Command::new(&self.docker_program)
            .arg("stop")
            .arg(&self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| LaunchError::Terminate(e.to_string()))?;

        // A failed stop is not retried from Drop
        self.stopped = true;

        if !status.success() {
            return Err(LaunchError::Terminate(format!(
                "{} stop {} exited with {}",
                self.docker_program, self.name, status
            )));
        }

        debug!(container = %self.name, "Container stopped");
        Ok(())
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }

        warn!(container = %self.name, "Container handle dropped, stopping in background");
        let mut command = std::process::Command::new(&self.docker_program);
        command
            .arg("stop")
            .arg(&self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let mut command = Command::from(command);
                runtime.spawn(async move {
                    let _ = command.status().await;
                });
            }
            Err(_) => {
                let _ = command.spawn();
            }
        }
    }
}
