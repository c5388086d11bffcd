//! Process launcher
//!
//! The instance is spawned directly from the command template. If the
//! template has a port placeholder a free port is allocated up front;
//! otherwise the instance picks its own port and must announce it as its
//! first line of output, `Listening on port: <port>`.
//!
//! On unix every instance leads its own process group, and stopping it
//! kills the whole group, so helpers the instance forked go down with it.

use crate::error::LaunchError;
use crate::launcher::{InstanceHandle, LaunchedInstance};
use crate::port::allocate_port;
use crate::template::CommandTemplate;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, trace, warn};

/// Launches instances as child processes
#[derive(Debug, Clone)]
pub struct BashLauncher {
    template: CommandTemplate,
    instance_address: String,
    uid: Option<u32>,
    gid: Option<u32>,
    launch_timeout: Duration,
}

impl BashLauncher {
    pub fn new(template: CommandTemplate, instance_address: impl Into<String>) -> Self {
        Self {
            template,
            instance_address: instance_address.into(),
            uid: None,
            gid: None,
            launch_timeout: Duration::from_secs(10),
        }
    }

    /// Run instances under these ids instead of our own
    pub fn with_credentials(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub async fn launch(&self) -> Result<LaunchedInstance, LaunchError> {
        let assigned_port = if self.template.has_port_placeholder() {
            Some(allocate_port()?)
        } else {
            None
        };

        let argv = self.template.render(assigned_port.unwrap_or(0), "");
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        self.configure_process(&mut command);

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: argv[0].clone(),
            source,
        })?;
        let pid = child.id();
        let stdout = child.stdout.take();

        // From here on an early return drops `handle`, which kills the group
        let handle = ProcessHandle {
            child,
            pid,
            terminated: false,
        };
        let stdout = stdout
            .ok_or_else(|| LaunchError::InvalidCommand("stdout was not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let port = match assigned_port {
            Some(port) => port,
            None => self.read_announced_port(&mut lines).await?,
        };
        spawn_output_drain(lines, pid);

        info!(
            pid = pid.unwrap_or_default(),
            port,
            "Started instance: {}",
            self.template
        );

        Ok(LaunchedInstance {
            address: self.instance_address.clone(),
            port,
            handle: Box::new(handle),
        })
    }

    async fn read_announced_port(
        &self,
        lines: &mut Lines<BufReader<ChildStdout>>,
    ) -> Result<u16, LaunchError> {
        let line = tokio::time::timeout(self.launch_timeout, lines.next_line())
            .await
            .map_err(|_| LaunchError::Timeout(self.launch_timeout))?
            .map_err(|e| LaunchError::PortUnavailable(e.to_string()))?
            .ok_or_else(|| {
                LaunchError::PortUnavailable("instance exited before announcing a port".to_string())
            })?;

        parse_announced_port(&line).ok_or_else(|| {
            LaunchError::PortUnavailable(format!("unexpected announcement {:?}", line))
        })
    }

    #[cfg(unix)]
    fn configure_process(&self, command: &mut Command) {
        command.process_group(0);
        if let Some(gid) = self.gid {
            command.gid(gid);
        }
        if let Some(uid) = self.uid {
            command.uid(uid);
        }
    }

    #[cfg(not(unix))]
    fn configure_process(&self, _command: &mut Command) {
        if self.uid.is_some() || self.gid.is_some() {
            warn!("Dropping privileges is only supported on unix, ignoring uid/gid");
        }
    }
}

/// Port from a `Listening on port: <port>` line
fn parse_announced_port(line: &str) -> Option<u16> {
    line.split_whitespace()
        .nth(3)
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
}

/// Keep reading the instance's stdout so it never blocks on a full pipe
fn spawn_output_drain(mut lines: Lines<BufReader<ChildStdout>>, pid: Option<u32>) {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            trace!(pid = pid.unwrap_or_default(), "instance: {}", line);
        }
    });
}

/// Handle to a spawned instance process
#[derive(Debug)]
struct ProcessHandle {
    child: Child,
    /// Also the process group id on unix
    pid: Option<u32>,
    terminated: bool,
}

impl ProcessHandle {
    /// SIGKILL every process in the instance's group
    #[cfg(unix)]
    fn kill_group(&mut self) -> Result<(), LaunchError> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pgid = i32::try_from(pid).map_err(|e| LaunchError::Terminate(e.to_string()))?;

        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            // Nothing left in the group
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(LaunchError::Terminate(format!(
                "failed to signal process group {}: {}",
                pgid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) -> Result<(), LaunchError> {
        let _ = self.child.start_kill();
        Ok(())
    }
}

#[async_trait]
impl InstanceHandle for ProcessHandle {
    async fn terminate(&mut self) -> Result<(), LaunchError> {
        if self.terminated {
            return Ok(());
        }
        let pid = self.pid.unwrap_or_default();

        self.kill_group()?;
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| LaunchError::Terminate(e.to_string()))?;
        self.terminated = true;

        debug!(pid, "Instance stopped ({})", status);
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        debug!(pid = self.pid.unwrap_or_default(), "Killing instance process group on drop");
        if let Err(e) = self.kill_group() {
            warn!("{}", e);
        }
    }
}
