//! Tunnel server
//!
//! Clients present a token, the token is resolved through the directory and
//! the client connection is spliced onto a fresh connection to the private
//! instance behind it.

pub mod relay;
pub mod server;
pub mod session;

pub use relay::{relay, Direction, RelayStats, CHUNK_SIZE};
pub use server::{TunnelServer, TunnelServerConfig, TunnelServerError};
pub use session::{SessionOutcome, TunnelSession, TunnelSettings};
