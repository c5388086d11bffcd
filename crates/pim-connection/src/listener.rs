//! Listener binding

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
pub struct BindError {
    pub address: String,
    pub port: u16,
    pub reason: String,
}

impl BindError {
    fn new(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: reason.into(),
        }
    }
}

/// Bind a TCP listener, retrying while the address is still in use
/// (e.g. sockets of a previous run lingering in TIME_WAIT)
pub async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, BindError> {
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/{}",
                        addr, attempt, BIND_ATTEMPTS
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying in {:?}...",
                    addr.port(),
                    attempt,
                    BIND_ATTEMPTS,
                    BIND_RETRY_DELAY
                );
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => return Err(BindError::new(addr, e.to_string())),
        }
    }

    Err(BindError::new(
        addr,
        format!("Address in use after {} retry attempts", BIND_ATTEMPTS),
    ))
}
