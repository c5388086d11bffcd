//! Registration server
//!
//! Every client that connects gets its own private instance: the instance is
//! launched, published in the directory under a fresh token, reported to the
//! client and torn down again once its lifetime is over.

pub mod server;
pub mod session;

pub use server::{RegistrationServer, RegistrationServerConfig, RegistrationServerError};
pub use session::{ConnectionHint, RegistrationSession, SessionOutcome, SessionSettings};
