//! Management Protocol Definitions
//!
//! This crate defines the typed request/response messages, sentinels, and
//! description-record model for the controller-side management engine. The
//! byte-exact wire layout of each command is owned by the external codec that
//! backs the request correlator; everything here is the structured form those
//! exchanges decode into.

pub mod messages;
pub mod records;

pub use messages::*;
pub use records::{
    record_type, AssociationRecord, CompactSensorRecord, DescriptionRecord, Entity, LocatorRecord,
    NameTableRecord, NumericEffecterRecord, RecordError, RecordHeader,
};

/// Protocol format version carried in poll requests
pub const FORMAT_VERSION: u8 = 1;

/// Event id answer meaning "no event pending"
pub const EVENT_ID_NONE: EventId = 0x0000;

/// Reserved event id, must be ignored
pub const EVENT_ID_INVALID: EventId = 0xFFFF;

/// Record handle value that terminates the description-record fetch loop
pub const RECORD_HANDLE_END: u32 = 0;

/// Number of request-correlation tokens available per endpoint
pub const TOKENS_PER_ENDPOINT: u8 = 32;
