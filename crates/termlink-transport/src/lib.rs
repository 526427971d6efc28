//! Request-correlation boundary between the engine and the wire
//!
//! The engine never touches the transport directly. It draws a [`Token`] from
//! the per-endpoint [`TokenPool`], hands a typed request to a [`Correlator`]
//! implementation, and awaits the matching response. The correlator owns the
//! codec and the actual transport; exactly one request may be outstanding per
//! (endpoint, token) pair.

pub mod correlator;
pub mod tokens;

pub use correlator::{Correlator, CorrelatorError};
pub use tokens::{TokenError, TokenPool};
