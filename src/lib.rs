//! Umbrella crate for the termlink controller engine.
//!
//! Re-exports the three workspace crates so embedding applications depend on
//! a single name:
//!
//! - [`proto`]: message and description-record model
//! - [`transport`]: token pool and the correlator seam to the wire
//! - [`engine`]: discovery, event polling, classification, and endpoint
//!   lifecycle management

pub use termlink_engine as engine;
pub use termlink_proto as proto;
pub use termlink_transport as transport;

pub use termlink_engine::{EndpointManager, EngineConfig};
pub use termlink_transport::Correlator;
