//! Directory Protocol Definitions
//!
//! This crate defines the token type and the line-oriented request/response
//! messages spoken between the directory service and its clients.

pub mod messages;
pub mod status;
pub mod token;

pub use messages::{
    DirectoryRequest, DirectoryResponse, RequestError, ResponseError, ResponseLine, ServiceInfo,
};
pub use status::StatusCode;
pub use token::{Token, TokenError};

/// Maximum length of a single protocol line, excluding the terminator
pub const MAX_LINE_LENGTH: usize = 1024;

/// Maximum length of a service address accepted by `ADD_SERVICE`
pub const MAX_ADDRESS_LENGTH: usize = 253;
