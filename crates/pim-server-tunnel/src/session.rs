//! Per-client tunnel flow
//!
//! `Start -> ReadToken -> ResolveViaDirectory -> ConnectInstance -> Forwarding -> Closed`
//!
//! Every failure before `Forwarding` answers the client with exactly one
//! line and closes the connection. After the connect notice the tunnel is
//! transparent.

use crate::relay::{relay, RelayStats};
use bytes::Bytes;
use futures::StreamExt;
use pim_connection::send_notice;
use pim_directory::{DirectoryClient, DirectoryClientError};
use pim_proto::{ServiceInfo, Token, MAX_LINE_LENGTH};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

const PROMPT: &str = "Token: ";
const MSG_INVALID_TOKEN: &str = "Invalid token\n";
const MSG_TOKEN_TIMEOUT: &str = "Timed out waiting for token\n";
const MSG_EXPIRED: &str = "Token has expired!\n";
const MSG_DIRECTORY_UNAVAILABLE: &str = "Directory service unavailable, try again later\n";
const MSG_CONNECTING: &str = "Token is correct. Connecting to private instance...\n";
const MSG_CONNECT_FAILED: &str = "Failed to connect to private instance\n";

/// Settings shared by all sessions of one server
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// How long a client may take to send its token; `None` waits forever
    pub token_timeout: Option<Duration>,
    /// Dial this host instead of the service name from the directory
    pub instance_host: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            token_timeout: None,
            instance_host: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client left before sending a token
    NoToken,
    /// No token line arrived within the configured limit
    TokenTimeout,
    InvalidToken,
    Expired,
    DirectoryUnavailable,
    ConnectFailed,
    Relayed(RelayStats),
}

enum SessionState {
    Start,
    ReadToken,
    ResolveViaDirectory(Token),
    ConnectInstance(ServiceInfo),
    Forwarding(TcpStream),
    Closed(SessionOutcome),
}

/// Outcome of reading the token line
enum TokenLine {
    Line(String),
    Malformed,
    Missing,
}

/// One client's tunnel
pub struct TunnelSession<S> {
    peer: SocketAddr,
    client: S,
    /// Bytes the client sent after its token line
    pending: Bytes,
    directory: DirectoryClient,
    settings: Arc<TunnelSettings>,
}

impl<S> TunnelSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        client: S,
        peer: SocketAddr,
        directory: DirectoryClient,
        settings: Arc<TunnelSettings>,
    ) -> Self {
        Self {
            peer,
            client,
            pending: Bytes::new(),
            directory,
            settings,
        }
    }

    /// Drive the session to completion; all sockets are closed on return
    pub async fn run(mut self) -> SessionOutcome {
        let mut state = SessionState::Start;

        loop {
            state = match state {
                SessionState::Start => {
                    if send_notice(&mut self.client, PROMPT).await {
                        SessionState::ReadToken
                    } else {
                        SessionState::Closed(SessionOutcome::NoToken)
                    }
                }
                SessionState::ReadToken => self.read_token().await,
                SessionState::ResolveViaDirectory(token) => self.resolve(token).await,
                SessionState::ConnectInstance(info) => self.connect(info).await,
                SessionState::Forwarding(instance) => {
                    return self.forward(instance).await;
                }
                SessionState::Closed(outcome) => {
                    let _ = self.client.shutdown().await;
                    debug!(peer = %self.peer, ?outcome, "Tunnel session closed");
                    return outcome;
                }
            };
        }
    }

    async fn read_token(&mut self) -> SessionState {
        let line = match self.settings.token_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.read_line()).await {
                Ok(line) => line,
                Err(_) => {
                    debug!(peer = %self.peer, "No token within {:?}", limit);
                    return self
                        .fail(MSG_TOKEN_TIMEOUT, SessionOutcome::TokenTimeout)
                        .await;
                }
            },
            None => self.read_line().await,
        };

        match line {
            TokenLine::Line(line) => match Token::parse(&line) {
                Ok(token) => SessionState::ResolveViaDirectory(token),
                Err(e) => {
                    debug!(peer = %self.peer, "{}", e);
                    self.fail(MSG_INVALID_TOKEN, SessionOutcome::InvalidToken)
                        .await
                }
            },
            TokenLine::Malformed => {
                self.fail(MSG_INVALID_TOKEN, SessionOutcome::InvalidToken)
                    .await
            }
            TokenLine::Missing => SessionState::Closed(SessionOutcome::NoToken),
        }
    }

    /// Read one line, keeping whatever arrived after it in `pending`
    async fn read_line(&mut self) -> TokenLine {
        let mut framed = FramedRead::new(
            &mut self.client,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );

        let line = match framed.next().await {
            Some(Ok(line)) => TokenLine::Line(line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => TokenLine::Malformed,
            Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                TokenLine::Malformed
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!("Failed to read token: {}", e);
                TokenLine::Missing
            }
            None => TokenLine::Missing,
        };

        self.pending = Bytes::copy_from_slice(framed.read_buffer());
        line
    }

    async fn resolve(&mut self, token: Token) -> SessionState {
        match self.directory.get_info(&token).await {
            Ok(info) => {
                debug!(
                    peer = %self.peer,
                    %token,
                    service = %info.service_name,
                    port = info.port,
                    remaining = info.time_remaining,
                    "Token resolved"
                );
                SessionState::ConnectInstance(info)
            }
            Err(DirectoryClientError::Expired) => {
                debug!(peer = %self.peer, %token, "Token expired");
                self.fail(MSG_EXPIRED, SessionOutcome::Expired).await
            }
            Err(e) if !e.is_unavailable() => {
                debug!(peer = %self.peer, %token, "Token rejected: {}", e);
                self.fail(MSG_INVALID_TOKEN, SessionOutcome::InvalidToken)
                    .await
            }
            Err(e) => {
                warn!(peer = %self.peer, "Directory lookup failed: {}", e);
                self.fail(
                    MSG_DIRECTORY_UNAVAILABLE,
                    SessionOutcome::DirectoryUnavailable,
                )
                .await
            }
        }
    }

    async fn connect(&mut self, info: ServiceInfo) -> SessionState {
        if !send_notice(&mut self.client, MSG_CONNECTING).await {
            return SessionState::Closed(SessionOutcome::NoToken);
        }

        let host = self
            .settings
            .instance_host
            .clone()
            .unwrap_or(info.service_name);
        let connect = TcpStream::connect((host.as_str(), info.port));

        match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Ok(Ok(instance)) => {
                let _ = instance.set_nodelay(true);
                SessionState::Forwarding(instance)
            }
            Ok(Err(e)) => {
                warn!(peer = %self.peer, "Failed to connect to {}:{}: {}", host, info.port, e);
                self.fail(MSG_CONNECT_FAILED, SessionOutcome::ConnectFailed)
                    .await
            }
            Err(_) => {
                warn!(peer = %self.peer, "Timed out connecting to {}:{}", host, info.port);
                self.fail(MSG_CONNECT_FAILED, SessionOutcome::ConnectFailed)
                    .await
            }
        }
    }

    async fn forward(self, mut instance: TcpStream) -> SessionOutcome {
        let peer = self.peer;

        if !self.pending.is_empty() {
            if let Err(e) = instance.write_all(&self.pending).await {
                debug!(peer = %peer, "Failed to forward buffered client bytes: {}", e);
            }
        }
        let pending = self.pending.len() as u64;

        info!(peer = %peer, "Relaying to private instance");
        let mut stats = relay(self.client, instance).await;
        stats.client_to_instance += pending;

        info!(
            peer = %peer,
            bytes_to_instance = stats.client_to_instance,
            bytes_to_client = stats.instance_to_client,
            closed_by = %stats.closed_by,
            "Tunnel closed"
        );
        SessionOutcome::Relayed(stats)
    }

    async fn fail(&mut self, message: &str, outcome: SessionOutcome) -> SessionState {
        send_notice(&mut self.client, message).await;
        SessionState::Closed(outcome)
    }
}
