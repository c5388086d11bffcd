//! Directory TCP server
//!
//! One request per connection: read a line, answer a line, close.

use crate::handler::handle_request;
use futures::{SinkExt, StreamExt};
use pim_connection::{bind_with_retry, BindError};
use pim_proto::{DirectoryResponse, RequestError, MAX_LINE_LENGTH};
use pim_registry::{spawn_sweeper, Registry, DEFAULT_SWEEP_INTERVAL_SECS};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Directory server errors
#[derive(Debug, Error)]
pub enum DirectoryServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Line codec error: {0}")]
    Codec(#[from] LinesCodecError),
}

/// Directory server configuration
#[derive(Debug, Clone)]
pub struct DirectoryServerConfig {
    pub bind_addr: SocketAddr,
    /// Interval of the background sweep of expired records
    pub sweep_interval: Duration,
    /// How long a client may take to send its request line
    pub request_timeout: Duration,
}

impl Default for DirectoryServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4001)),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Aborts the sweeper when the server loop goes away
struct SweeperGuard(JoinHandle<()>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Directory server bound to its listening socket
pub struct DirectoryServer {
    config: DirectoryServerConfig,
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl DirectoryServer {
    pub async fn bind(
        config: DirectoryServerConfig,
        registry: Arc<Registry>,
    ) -> Result<Self, DirectoryServerError> {
        let listener = bind_with_retry(config.bind_addr).await?;
        Ok(Self {
            config,
            listener,
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DirectoryServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the future is dropped
    pub async fn run(self) -> Result<(), DirectoryServerError> {
        let _sweeper = SweeperGuard(spawn_sweeper(
            self.registry.clone(),
            self.config.sweep_interval,
        ));

        info!(
            "Directory listening on {} (token ttl {:?})",
            self.listener.local_addr()?,
            self.registry.ttl()
        );

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let registry = self.registry.clone();
                    let request_timeout = self.config.request_timeout;
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(socket, peer_addr, registry, request_timeout)
                                .await
                        {
                            warn!("Directory request from {} failed: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept directory connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        socket: TcpStream,
        peer_addr: SocketAddr,
        registry: Arc<Registry>,
        request_timeout: Duration,
    ) -> Result<(), DirectoryServerError> {
        let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let response = match tokio::time::timeout(request_timeout, framed.next()).await {
            Ok(Some(Ok(line))) => handle_request(&registry, &line),
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                debug!("Oversized request line from {}", peer_addr);
                DirectoryResponse::bad_request(&RequestError::InvalidCommand)
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => return Err(e.into()),
            Ok(None) => {
                debug!("{} closed without sending a request", peer_addr);
                return Ok(());
            }
            Err(_) => {
                debug!("{} sent no request within {:?}", peer_addr, request_timeout);
                return Ok(());
            }
        };

        debug!(peer = %peer_addr, status = %response.status(), "Directory response");
        framed.send(response.to_string()).await?;
        framed.get_mut().shutdown().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_server_config_default() {
        let config = DirectoryServerConfig::default();
        assert_eq!(config.bind_addr.port(), 4001);
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
    }
}
