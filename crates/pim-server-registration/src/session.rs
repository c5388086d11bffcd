//! Per-client registration flow
//!
//! ```text
//! Start -> LaunchInstance -> RegisterWithDirectory -> ReportToClient -> Armed
//!                |                   |                                   |
//!                v                   v                                   v
//!              Done      (terminate instance) Done          Teardown -> Done
//! ```
//!
//! Once an instance is launched, every path to `Done` goes through a
//! terminate call on its handle. Client writes are best effort: a client that
//! hangs up early never stops the teardown.

use pim_connection::Notifier;
use pim_directory::DirectoryClient;
use pim_launcher::{LaunchedInstance, Launcher};
use pim_proto::Token;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tracing::{debug, error, info, warn};

const MSG_INITIALIZING: &str = "Initializing private instance...";
const MSG_NO_FREE_PORT: &str = "Failed to obtain a free port";
const MSG_LAUNCH_FAILED: &str = "Failed to start the private instance";
const MSG_ADD_SERVICE_FAILED: &str = "Failed to add a service!";
const MSG_TERMINATING: &str = "Terminating the instance...";
const MSG_STOP_FAILED: &str = "Failed to stop the instance";

/// Connection instructions shown to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHint {
    pub address: String,
    pub port: String,
    /// Tell the client to wrap the connection in TLS
    pub ssl: bool,
}

impl fmt::Display for ConnectionHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ncat ")?;
        if self.ssl {
            write!(f, "--ssl ")?;
        }
        write!(f, "{} {}", self.address, self.port)
    }
}

/// Settings shared by all sessions of one server
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Lifetime of a launched instance
    pub instance_ttl: Duration,
    pub hint: ConnectionHint,
    /// Tear the instance down as soon as the client hangs up
    pub terminate_on_disconnect: bool,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    LaunchFailed,
    RegistrationFailed,
    Expired,
    ClientDisconnected,
}

#[derive(Debug, Clone, Copy)]
enum TeardownReason {
    Expired,
    ClientDisconnected,
}

impl From<TeardownReason> for SessionOutcome {
    fn from(reason: TeardownReason) -> Self {
        match reason {
            TeardownReason::Expired => SessionOutcome::Expired,
            TeardownReason::ClientDisconnected => SessionOutcome::ClientDisconnected,
        }
    }
}

enum SessionState {
    Start,
    LaunchInstance,
    RegisterWithDirectory(LaunchedInstance),
    ReportToClient {
        instance: LaunchedInstance,
        token: Token,
    },
    Armed(LaunchedInstance),
    Teardown {
        instance: LaunchedInstance,
        reason: TeardownReason,
    },
    Done(SessionOutcome),
}

/// One client's registration
pub struct RegistrationSession<S> {
    peer: SocketAddr,
    reader: ReadHalf<S>,
    notifier: Notifier<WriteHalf<S>>,
    launcher: Arc<dyn Launcher>,
    directory: DirectoryClient,
    settings: Arc<SessionSettings>,
}

impl<S> RegistrationSession<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        launcher: Arc<dyn Launcher>,
        directory: DirectoryClient,
        settings: Arc<SessionSettings>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            peer,
            reader,
            notifier: Notifier::new(writer),
            launcher,
            directory,
            settings,
        }
    }

    /// Drive the session to completion; the client socket is closed on return
    pub async fn run(mut self) -> SessionOutcome {
        let mut state = SessionState::Start;

        loop {
            state = match state {
                SessionState::Start => {
                    self.notifier.line(MSG_INITIALIZING).await;
                    SessionState::LaunchInstance
                }
                SessionState::LaunchInstance => self.launch().await,
                SessionState::RegisterWithDirectory(instance) => self.register(instance).await,
                SessionState::ReportToClient { instance, token } => {
                    self.notifier
                        .line(&format!(
                            "Initialized private instance with token: {}",
                            token
                        ))
                        .await;
                    self.notifier
                        .line(&format!("Use it at: {}", self.settings.hint))
                        .await;
                    SessionState::Armed(instance)
                }
                SessionState::Armed(instance) => {
                    let reason = self.wait_armed().await;
                    SessionState::Teardown { instance, reason }
                }
                SessionState::Teardown { instance, reason } => {
                    self.teardown(instance, reason).await
                }
                SessionState::Done(outcome) => {
                    self.notifier.close().await;
                    debug!(peer = %self.peer, ?outcome, "Registration session finished");
                    return outcome;
                }
            };
        }
    }

    async fn launch(&mut self) -> SessionState {
        match self.launcher.launch().await {
            Ok(instance) => {
                debug!(
                    peer = %self.peer,
                    address = %instance.address,
                    port = instance.port,
                    "Instance launched"
                );
                SessionState::RegisterWithDirectory(instance)
            }
            Err(e) => {
                warn!(peer = %self.peer, "Failed to launch instance: {}", e);
                let message = if e.is_port_failure() {
                    MSG_NO_FREE_PORT
                } else {
                    MSG_LAUNCH_FAILED
                };
                self.notifier.line(message).await;
                SessionState::Done(SessionOutcome::LaunchFailed)
            }
        }
    }

    async fn register(&mut self, mut instance: LaunchedInstance) -> SessionState {
        match self
            .directory
            .add_service(&instance.address, instance.port)
            .await
        {
            Ok(token) => {
                info!(
                    peer = %self.peer,
                    %token,
                    address = %instance.address,
                    port = instance.port,
                    "Private instance registered"
                );
                SessionState::ReportToClient { instance, token }
            }
            Err(e) => {
                warn!(peer = %self.peer, "Failed to register instance: {}", e);
                // No instance may outlive a failed registration
                if let Err(e) = instance.handle.terminate().await {
                    error!(peer = %self.peer, "Failed to stop unregistered instance: {}", e);
                }
                self.notifier.line(MSG_ADD_SERVICE_FAILED).await;
                SessionState::Done(SessionOutcome::RegistrationFailed)
            }
        }
    }

    async fn wait_armed(&mut self) -> TeardownReason {
        let expiry = tokio::time::sleep(self.settings.instance_ttl);

        if !self.settings.terminate_on_disconnect {
            expiry.await;
            return TeardownReason::Expired;
        }

        tokio::select! {
            _ = expiry => TeardownReason::Expired,
            _ = wait_for_hangup(&mut self.reader) => {
                debug!(peer = %self.peer, "Client disconnected");
                TeardownReason::ClientDisconnected
            }
        }
    }

    async fn teardown(
        &mut self,
        mut instance: LaunchedInstance,
        reason: TeardownReason,
    ) -> SessionState {
        match instance.handle.terminate().await {
            Ok(()) => {
                info!(peer = %self.peer, ?reason, port = instance.port, "Instance terminated");
                self.notifier.line(MSG_TERMINATING).await;
            }
            Err(e) => {
                error!(peer = %self.peer, "Failed to terminate instance: {}", e);
                self.notifier.line(MSG_STOP_FAILED).await;
            }
        }
        SessionState::Done(reason.into())
    }
}

/// Resolve once the peer closes its side or the socket fails; input is discarded
async fn wait_for_hangup<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
