//! Directory request and response lines
//!
//! Every message is a single ASCII line; the `\n` terminator is added and
//! stripped by the transport framing, never by these types.
//!
//! Requests:
//! - `PING`
//! - `ADD_SERVICE <address> <port>`
//! - `GET_INFO <token>`
//!
//! Responses are `<status> <body>` where the body depends on the request.

use crate::status::StatusCode;
use crate::token::Token;
use crate::MAX_ADDRESS_LENGTH;
use std::fmt;
use thiserror::Error;

/// Reasons a request line is rejected with `400`
///
/// The `Display` output is the exact reason text sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Invalid command")]
    InvalidCommand,

    #[error("Missing service name")]
    MissingServiceName,

    #[error("Invalid service name")]
    InvalidServiceName,

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Missing UUID")]
    MissingToken,

    #[error("Invalid UUID")]
    InvalidToken,
}

/// Errors raised while interpreting a response line on the client side
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("Directory answered {status}: {reason}")]
    Status { status: StatusCode, reason: String },

    #[error("Unknown status in response: {0:?}")]
    UnknownStatus(String),

    #[error("Malformed response line: {0:?}")]
    Malformed(String),
}

/// A request sent to the directory service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryRequest {
    /// Liveness probe
    Ping,
    /// Register a service location and obtain a fresh token
    AddService { address: String, port: u16 },
    /// Resolve a token to its service location
    GetInfo { token: Token },
}

impl DirectoryRequest {
    /// Parse a request line (without terminator)
    ///
    /// Fields are separated by any amount of whitespace. Trailing fields
    /// beyond the ones a verb needs are ignored.
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let mut fields = line.split_whitespace();
        let verb = fields.next().ok_or(RequestError::InvalidCommand)?;

        match verb {
            "PING" => Ok(DirectoryRequest::Ping),
            "ADD_SERVICE" => {
                let address = fields.next().ok_or(RequestError::MissingServiceName)?;
                if !is_valid_address(address) {
                    return Err(RequestError::InvalidServiceName);
                }
                let port = fields
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                    .filter(|p| *p != 0)
                    .ok_or(RequestError::InvalidPort)?;
                Ok(DirectoryRequest::AddService {
                    address: address.to_string(),
                    port,
                })
            }
            "GET_INFO" => {
                let raw = fields.next().ok_or(RequestError::MissingToken)?;
                let token = Token::parse(raw).map_err(|_| RequestError::InvalidToken)?;
                Ok(DirectoryRequest::GetInfo { token })
            }
            _ => Err(RequestError::InvalidCommand),
        }
    }
}

impl fmt::Display for DirectoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryRequest::Ping => write!(f, "PING"),
            DirectoryRequest::AddService { address, port } => {
                write!(f, "ADD_SERVICE {} {}", address, port)
            }
            DirectoryRequest::GetInfo { token } => write!(f, "GET_INFO {}", token),
        }
    }
}

/// Hostnames, IPv4 and IPv6 literals only
fn is_valid_address(address: &str) -> bool {
    !address.is_empty()
        && address.len() <= MAX_ADDRESS_LENGTH
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
}

/// Location of a registered service as reported by `GET_INFO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub port: u16,
    /// Whole seconds left before the record expires (always >= 1)
    pub time_remaining: u64,
    pub service_name: String,
}

/// A response produced by the directory service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryResponse {
    Pong,
    ServiceAdded(Token),
    Info(ServiceInfo),
    Error { status: StatusCode, reason: String },
}

impl DirectoryResponse {
    pub fn bad_request(err: &RequestError) -> Self {
        DirectoryResponse::Error {
            status: StatusCode::BadRequest,
            reason: err.to_string(),
        }
    }

    pub fn not_found() -> Self {
        DirectoryResponse::Error {
            status: StatusCode::NotFound,
            reason: "UUID not found".to_string(),
        }
    }

    pub fn expired() -> Self {
        DirectoryResponse::Error {
            status: StatusCode::Gone,
            reason: "UUID has expired".to_string(),
        }
    }

    pub fn internal_error(reason: impl Into<String>) -> Self {
        DirectoryResponse::Error {
            status: StatusCode::InternalServerError,
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DirectoryResponse::Error { status, .. } => *status,
            _ => StatusCode::Ok,
        }
    }
}

impl fmt::Display for DirectoryResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryResponse::Pong => write!(f, "{} PONG", StatusCode::Ok),
            DirectoryResponse::ServiceAdded(token) => write!(f, "{} {}", StatusCode::Ok, token),
            DirectoryResponse::Info(info) => write!(
                f,
                "{} Port: {} - TimeRemaining: {} - ServiceName: {}",
                StatusCode::Ok,
                info.port,
                info.time_remaining,
                info.service_name
            ),
            DirectoryResponse::Error { status, reason } => write!(f, "{} {}", status, reason),
        }
    }
}

/// A response line split into its status and body, before the body is
/// interpreted for a specific request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub status: StatusCode,
    pub body: String,
}

impl ResponseLine {
    pub fn parse(line: &str) -> Result<Self, ResponseError> {
        let line = line.trim();
        let (code, body) = line.split_once(' ').unwrap_or((line, ""));
        let status = code
            .parse::<u16>()
            .ok()
            .and_then(StatusCode::from_u16)
            .ok_or_else(|| ResponseError::UnknownStatus(line.to_string()))?;

        Ok(Self {
            status,
            body: body.trim().to_string(),
        })
    }

    fn require_success(self) -> Result<String, ResponseError> {
        if self.status.is_success() {
            Ok(self.body)
        } else {
            Err(ResponseError::Status {
                status: self.status,
                reason: self.body,
            })
        }
    }

    /// Interpret as the answer to `PING`
    pub fn into_pong(self) -> Result<(), ResponseError> {
        let body = self.require_success()?;
        if body == "PONG" {
            Ok(())
        } else {
            Err(ResponseError::Malformed(body))
        }
    }

    /// Interpret as the answer to `ADD_SERVICE`
    pub fn into_token(self) -> Result<Token, ResponseError> {
        let body = self.require_success()?;
        Token::parse(&body).map_err(|_| ResponseError::Malformed(body))
    }

    /// Interpret as the answer to `GET_INFO`
    pub fn into_service_info(self) -> Result<ServiceInfo, ResponseError> {
        let body = self.require_success()?;
        let fields: Vec<&str> = body.split_whitespace().collect();

        match fields.as_slice() {
            ["Port:", port, "-", "TimeRemaining:", remaining, "-", "ServiceName:", name] => {
                let port = port.parse::<u16>().ok();
                let time_remaining = remaining.parse::<u64>().ok();
                match (port, time_remaining) {
                    (Some(port), Some(time_remaining)) => Ok(ServiceInfo {
                        port,
                        time_remaining,
                        service_name: name.to_string(),
                    }),
                    _ => Err(ResponseError::Malformed(body)),
                }
            }
            _ => Err(ResponseError::Malformed(body)),
        }
    }
}
