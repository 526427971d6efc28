//! Per-endpoint request-correlation token pool
//!
//! Every request to a terminus carries a token identifying it among the
//! endpoint's in-flight exchanges. The space is small (32 values per
//! endpoint) and a token must never be issued twice concurrently; callers
//! free the token on every exit path, including encode failures where no
//! request ever reached the wire.

use std::collections::HashMap;
use std::sync::Mutex;

use termlink_proto::{EndpointId, Token, TOKENS_PER_ENDPOINT};
use thiserror::Error;

/// Token pool errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("all tokens outstanding for endpoint {0}")]
    Exhausted(EndpointId),

    #[error("token {token} was not outstanding for endpoint {endpoint}")]
    NotOutstanding { endpoint: EndpointId, token: Token },
}

/// Issues and recycles tokens independently per endpoint
pub struct TokenPool {
    outstanding: Mutex<HashMap<EndpointId, u32>>,
}

impl TokenPool {
    pub fn new() -> Self {
        Self {
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve an unused token for `endpoint`.
    ///
    /// Fails when the endpoint's entire token space is outstanding; callers
    /// must not send a request without a reserved token.
    pub fn next(&self, endpoint: EndpointId) -> Result<Token, TokenError> {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        let mask = outstanding.entry(endpoint).or_insert(0);
        for token in 0..TOKENS_PER_ENDPOINT {
            let bit = 1u32 << token;
            if *mask & bit == 0 {
                *mask |= bit;
                return Ok(token);
            }
        }
        tracing::warn!(endpoint, "token space exhausted");
        Err(TokenError::Exhausted(endpoint))
    }

    /// Return `token` to the endpoint's available set.
    ///
    /// Must be called exactly once per successful [`next`](Self::next);
    /// freeing a token that is not outstanding is reported so the imbalance
    /// is visible.
    pub fn free(&self, endpoint: EndpointId, token: Token) -> Result<(), TokenError> {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        let bit = 1u32 << token;
        match outstanding.get_mut(&endpoint) {
            Some(mask) if *mask & bit != 0 => {
                *mask &= !bit;
                Ok(())
            }
            _ => {
                tracing::warn!(endpoint, token, "freeing token that was not outstanding");
                Err(TokenError::NotOutstanding { endpoint, token })
            }
        }
    }

    /// Number of tokens currently outstanding for `endpoint`
    pub fn outstanding(&self, endpoint: EndpointId) -> u32 {
        let outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        outstanding.get(&endpoint).map_or(0, |m| m.count_ones())
    }
}

impl Default for TokenPool {
    fn default() -> Self {
        Self::new()
    }
}
