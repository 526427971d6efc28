//! Correlator trait for request/response exchanges

use async_trait::async_trait;
use termlink_proto::{EndpointId, Request, Response, Token};
use thiserror::Error;

/// Correlator errors
#[derive(Debug, Error)]
pub enum CorrelatorError {
    /// The codec rejected the request before anything reached the wire
    #[error("failed to encode request: {0}")]
    Encode(String),

    /// Bytes came back but did not decode into a valid response
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The exchange produced no (or an empty) response
    #[error("no response from endpoint {0}")]
    NoResponse(EndpointId),

    /// The transport underneath is gone
    #[error("transport closed")]
    Closed,
}

impl CorrelatorError {
    /// Failures local to the attempt (codec), as opposed to the terminus
    /// not answering.
    pub fn is_local(&self) -> bool {
        matches!(self, CorrelatorError::Encode(_) | CorrelatorError::Decode(_))
    }
}

/// Sends one encoded request and resolves with the matching response.
///
/// Implementations own the wire codec and the transport. The contract the
/// engine relies on: exactly one completion per call, and at most one request
/// outstanding per (endpoint, token) pair — the caller guarantees the latter
/// by reserving the token first.
#[async_trait]
pub trait Correlator: Send + Sync {
    async fn transfer(
        &self,
        endpoint: EndpointId,
        token: Token,
        request: Request,
    ) -> Result<Response, CorrelatorError>;
}
