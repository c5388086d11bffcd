//! Free port discovery

use crate::error::LaunchError;
use std::net::{SocketAddr, TcpListener};

/// Ask the OS for a currently unused TCP port
///
/// The probe socket is closed before returning, so the port is only free at
/// the time of the call; the instance binds it shortly after.
pub fn allocate_port() -> Result<u16, LaunchError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], 0));
    let listener =
        TcpListener::bind(addr).map_err(|e| LaunchError::PortUnavailable(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| LaunchError::PortUnavailable(e.to_string()))?
        .port();
    Ok(port)
}
