//! Tunnel TCP server

use crate::session::{TunnelSession, TunnelSettings};
use pim_connection::{bind_with_retry, BindError};
use pim_directory::DirectoryClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Tunnel server errors
#[derive(Debug, Error)]
pub enum TunnelServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Tunnel server configuration
#[derive(Debug, Clone)]
pub struct TunnelServerConfig {
    pub bind_addr: SocketAddr,
    /// Directory service, `host:port`
    pub directory_addr: String,
    pub directory_timeout: Duration,
    pub settings: TunnelSettings,
}

impl Default for TunnelServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4002)),
            directory_addr: "127.0.0.1:4001".to_string(),
            directory_timeout: DirectoryClient::DEFAULT_TIMEOUT,
            settings: TunnelSettings::default(),
        }
    }
}

/// Tunnel server bound to its listening socket
pub struct TunnelServer {
    listener: TcpListener,
    directory: DirectoryClient,
    settings: Arc<TunnelSettings>,
}

impl TunnelServer {
    pub async fn bind(config: TunnelServerConfig) -> Result<Self, TunnelServerError> {
        let listener = bind_with_retry(config.bind_addr).await?;
        Ok(Self {
            listener,
            directory: DirectoryClient::new(config.directory_addr)
                .with_timeout(config.directory_timeout),
            settings: Arc::new(config.settings),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the future is dropped
    pub async fn run(self) -> Result<(), TunnelServerError> {
        info!(
            "Tunnel server listening on {} (directory {})",
            self.listener.local_addr()?,
            self.directory.address()
        );
        if let Some(host) = &self.settings.instance_host {
            info!("Instances are dialed at {}", host);
        }

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("New tunnel connection from {}", peer_addr);
                    let _ = socket.set_nodelay(true);
                    let session = TunnelSession::new(
                        socket,
                        peer_addr,
                        self.directory.clone(),
                        self.settings.clone(),
                    );
                    tokio::spawn(session.run());
                }
                Err(e) => {
                    error!("Failed to accept tunnel connection: {}", e);
                }
            }
        }
    }
}
