//! Directory client
//!
//! Each call dials a fresh connection, writes one request line, reads one
//! response line and disconnects.

use futures::{SinkExt, StreamExt};
use pim_proto::{
    DirectoryRequest, ResponseError, ResponseLine, ServiceInfo, StatusCode, Token, MAX_LINE_LENGTH,
};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info};

/// Errors returned by directory calls
#[derive(Debug, Error)]
pub enum DirectoryClientError {
    #[error("Failed to connect to directory at {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error talking to directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Directory closed the connection without answering")]
    NoResponse,

    #[error("Token not found")]
    NotFound,

    #[error("Token has expired")]
    Expired,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error("Line codec error: {0}")]
    Codec(#[from] LinesCodecError),
}

impl DirectoryClientError {
    /// True when the directory could not be reached or did not behave,
    /// as opposed to answering with a definite status
    pub fn is_unavailable(&self) -> bool {
        !matches!(
            self,
            DirectoryClientError::NotFound
                | DirectoryClientError::Expired
                | DirectoryClientError::Rejected(_)
        )
    }
}

fn classify(err: ResponseError) -> DirectoryClientError {
    match err {
        ResponseError::Status {
            status: StatusCode::NotFound,
            ..
        } => DirectoryClientError::NotFound,
        ResponseError::Status {
            status: StatusCode::Gone,
            ..
        } => DirectoryClientError::Expired,
        ResponseError::Status {
            status: StatusCode::BadRequest,
            reason,
        } => DirectoryClientError::Rejected(reason),
        other => DirectoryClientError::Response(other),
    }
}

/// Client for the directory line protocol
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    address: String,
    timeout: Duration,
}

impl DirectoryClient {
    /// Default bound on one request/response exchange
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// `address` is anything `TcpStream::connect` resolves, e.g. `"127.0.0.1:4001"`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn ping(&self) -> Result<(), DirectoryClientError> {
        self.request(&DirectoryRequest::Ping)
            .await?
            .into_pong()
            .map_err(classify)
    }

    pub async fn add_service(
        &self,
        address: &str,
        port: u16,
    ) -> Result<Token, DirectoryClientError> {
        let request = DirectoryRequest::AddService {
            address: address.to_string(),
            port,
        };
        self.request(&request).await?.into_token().map_err(classify)
    }

    pub async fn get_info(&self, token: &Token) -> Result<ServiceInfo, DirectoryClientError> {
        let request = DirectoryRequest::GetInfo { token: *token };
        self.request(&request)
            .await?
            .into_service_info()
            .map_err(classify)
    }

    /// Ping until the directory answers
    ///
    /// Gives up after `max_attempts` failed pings when a limit is given.
    pub async fn wait_until_ready(
        &self,
        interval: Duration,
        max_attempts: Option<usize>,
    ) -> Result<(), DirectoryClientError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if max_attempts.is_some_and(|max| attempt >= max) => return Err(e),
                Err(e) => {
                    info!("Waiting for directory at {} to start ({})", self.address, e);
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    async fn request(
        &self,
        request: &DirectoryRequest,
    ) -> Result<ResponseLine, DirectoryClientError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| DirectoryClientError::Timeout(self.timeout))?
    }

    async fn exchange(
        &self,
        request: &DirectoryRequest,
    ) -> Result<ResponseLine, DirectoryClientError> {
        let stream = TcpStream::connect(&self.address).await.map_err(|source| {
            DirectoryClientError::ConnectionFailed {
                address: self.address.clone(),
                source,
            }
        })?;

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        framed.send(request.to_string()).await?;

        let line = framed
            .next()
            .await
            .ok_or(DirectoryClientError::NoResponse)??;
        debug!(directory = %self.address, "{} -> {}", request, line);

        Ok(ResponseLine::parse(&line)?)
    }
}
