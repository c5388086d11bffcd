//! Directory service
//!
//! Serves the line protocol from `pim-proto` on top of a `Registry`, and
//! provides the small dial-write-read-disconnect client used by the
//! registration and tunnel servers.

pub mod client;
pub mod handler;
pub mod server;

pub use client::{DirectoryClient, DirectoryClientError};
pub use handler::handle_request;
pub use server::{DirectoryServer, DirectoryServerConfig, DirectoryServerError};
