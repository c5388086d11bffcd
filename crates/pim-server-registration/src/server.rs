//! Registration TCP server

use crate::session::{ConnectionHint, RegistrationSession, SessionSettings};
use pim_connection::{bind_with_retry, BindError};
use pim_directory::DirectoryClient;
use pim_launcher::Launcher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Registration server errors
#[derive(Debug, Error)]
pub enum RegistrationServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Registration server configuration
#[derive(Debug, Clone)]
pub struct RegistrationServerConfig {
    pub bind_addr: SocketAddr,
    /// Directory service, `host:port`
    pub directory_addr: String,
    /// Bound on each directory request
    pub directory_timeout: Duration,
    pub instance_ttl: Duration,
    pub hint: ConnectionHint,
    pub terminate_on_disconnect: bool,
}

impl Default for RegistrationServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            directory_addr: "127.0.0.1:4001".to_string(),
            directory_timeout: DirectoryClient::DEFAULT_TIMEOUT,
            instance_ttl: Duration::from_secs(30),
            hint: ConnectionHint {
                address: "127.0.0.1".to_string(),
                port: "8080".to_string(),
                ssl: false,
            },
            terminate_on_disconnect: false,
        }
    }
}

/// Registration server bound to its listening socket
pub struct RegistrationServer {
    listener: TcpListener,
    launcher: Arc<dyn Launcher>,
    directory: DirectoryClient,
    settings: Arc<SessionSettings>,
}

impl RegistrationServer {
    pub async fn bind(
        config: RegistrationServerConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, RegistrationServerError> {
        let listener = bind_with_retry(config.bind_addr).await?;
        let directory =
            DirectoryClient::new(config.directory_addr).with_timeout(config.directory_timeout);
        let settings = Arc::new(SessionSettings {
            instance_ttl: config.instance_ttl,
            hint: config.hint,
            terminate_on_disconnect: config.terminate_on_disconnect,
        });

        Ok(Self {
            listener,
            launcher,
            directory,
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RegistrationServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the future is dropped
    pub async fn run(self) -> Result<(), RegistrationServerError> {
        info!(
            "Registration server listening on {} (directory {}, instance ttl {:?})",
            self.listener.local_addr()?,
            self.directory.address(),
            self.settings.instance_ttl
        );

        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("New registration connection from {}", peer_addr);
                    let session = RegistrationSession::new(
                        socket,
                        peer_addr,
                        self.launcher.clone(),
                        self.directory.clone(),
                        self.settings.clone(),
                    );
                    tokio::spawn(session.run());
                }
                Err(e) => {
                    error!("Failed to accept registration connection: {}", e);
                }
            }
        }
    }
}
