//! Protocol message types
//!
//! Typed forms of the command exchanges the engine issues toward a terminus.
//! The external codec encodes/decodes these; the engine only ever sees the
//! structured variants below.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport address of a terminus
pub type EndpointId = u8;

/// Logical terminus identifier, independent of transport address
pub type Tid = u8;

/// Identifier of a queued asynchronous event
pub type EventId = u16;

/// Per-endpoint request-correlation value
pub type Token = u8;

/// TID value a terminus reports before one has been assigned
pub const TID_UNASSIGNED: Tid = 0xFF;

/// Completion code for a successful exchange
pub const COMPLETION_SUCCESS: u8 = 0;

/// Protocol types a terminus can support
pub mod protocol_type {
    pub const BASE: u8 = 0;
    pub const PLATFORM: u8 = 2;
    pub const CONFIG: u8 = 3;
    pub const FRU: u8 = 4;
    pub const MAX: u8 = 6;
}

/// Event classes carried in poll responses and notifications
pub mod event_class {
    pub const SENSOR: u8 = 0x00;
    pub const MESSAGE_POLL: u8 = 0x05;
    pub const OEM: u8 = 0xFA;
}

/// Position of a fragment within a multi-part transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferFlag {
    Start = 0x1,
    Middle = 0x2,
    End = 0x4,
    StartAndEnd = 0x5,
}

impl TryFrom<u8> for TransferFlag {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(TransferFlag::Start),
            0x2 => Ok(TransferFlag::Middle),
            0x4 => Ok(TransferFlag::End),
            0x5 => Ok(TransferFlag::StartAndEnd),
            _ => Err(MessageError::InvalidTransferFlag(value)),
        }
    }
}

impl TransferFlag {
    /// Whether this fragment completes the transfer
    pub fn is_final(&self) -> bool {
        matches!(self, TransferFlag::End | TransferFlag::StartAndEnd)
    }
}

/// Operation requested from the terminus for a fragmented pull
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferOperation {
    FirstPart = 0x0,
    NextPart = 0x1,
    AcknowledgementOnly = 0x2,
}

/// Bitmap of supported protocol types (one bit per type, 64 types)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeBitmap(pub [u8; 8]);

impl TypeBitmap {
    pub fn supports(&self, protocol_type: u8) -> bool {
        let idx = usize::from(protocol_type);
        idx / 8 < self.0.len() && self.0[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn with_types(types: &[u8]) -> Self {
        let mut map = TypeBitmap::default();
        for &t in types {
            let idx = usize::from(t);
            if idx / 8 < map.0.len() {
                map.0[idx / 8] |= 1 << (idx % 8);
            }
        }
        map
    }
}

/// Bitmap of supported commands within one protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBitmap(#[serde(with = "serde_big_array")] pub [u8; 32]);

impl Default for CommandBitmap {
    fn default() -> Self {
        CommandBitmap([0; 32])
    }
}

impl CommandBitmap {
    pub fn supports(&self, command: u8) -> bool {
        self.0[usize::from(command) / 8] & (1 << (command % 8)) != 0
    }
}

// serde's derive stops at arrays of 32; serialize the command bitmap as a
// plain byte sequence instead.
mod serde_big_array {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let v: Vec<u8> = Deserialize::deserialize(de)?;
        v.try_into()
            .map_err(|_| D::Error::custom("command bitmap must be 32 bytes"))
    }
}

/// BCD-coded wall-clock time pushed to a terminus during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BcdTime {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,
}

impl BcdTime {
    /// Convert seconds-since-epoch into BCD-coded calendar fields (UTC).
    pub fn from_epoch_seconds(epoch: u64) -> Self {
        // Civil-from-days conversion, Howard Hinnant's algorithm.
        let days = (epoch / 86_400) as i64;
        let secs_of_day = epoch % 86_400;
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let y = yoe + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let d = (doy - (153 * mp + 2) / 5 + 1) as u8;
        let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
        let year = (if m <= 2 { y + 1 } else { y }) as u16;

        BcdTime {
            seconds: to_bcd((secs_of_day % 60) as u8),
            minutes: to_bcd(((secs_of_day / 60) % 60) as u8),
            hours: to_bcd((secs_of_day / 3600) as u8),
            day: to_bcd(d),
            month: to_bcd(m),
            year: to_bcd_u16(year),
        }
    }
}

fn to_bcd(dec: u8) -> u8 {
    (dec / 10) << 4 | (dec % 10)
}

fn to_bcd_u16(dec: u16) -> u16 {
    let mut out = 0u16;
    let mut v = dec;
    let mut shift = 0;
    while v > 0 {
        out |= (v % 10) << shift;
        v /= 10;
        shift += 4;
    }
    out
}

/// Requests the engine issues toward a terminus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Request {
    /// Which protocol types does the terminus speak
    QuerySupportedTypes,
    /// Which commands within one protocol type
    QuerySupportedCommands { protocol_type: u8 },
    /// Logical terminus identifier
    QueryTerminusId,
    /// Push controller wall-clock time
    SetDateTime { time: BcdTime },
    /// FRU table size and record count
    QueryFruTableMetadata,
    /// Pull the FRU record table
    FetchFruTable {
        transfer_handle: u32,
        operation: TransferOperation,
    },
    /// Register this controller as the terminus's event receiver
    RegisterEventReceiver {
        receiver_endpoint: EndpointId,
        heartbeat_decisecs: u16,
    },
    /// Pull the next page of description records
    FetchDescriptionRecord {
        record_handle: u32,
        transfer_handle: u32,
        operation: TransferOperation,
    },
    /// Pull one fragment of a pending event (or acknowledge it)
    PollEvent {
        format_version: u8,
        operation: TransferOperation,
        transfer_handle: u32,
        event_id_to_ack: EventId,
    },
}

/// Responses matching [`Request`] variants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Response {
    SupportedTypes {
        completion: u8,
        types: TypeBitmap,
    },
    SupportedCommands {
        completion: u8,
        commands: CommandBitmap,
    },
    TerminusId {
        completion: u8,
        tid: Tid,
    },
    DateTimeSet {
        completion: u8,
    },
    FruTableMetadata {
        completion: u8,
        total_records: u16,
    },
    FruTable {
        completion: u8,
        next_transfer_handle: u32,
        transfer_flag: TransferFlag,
        table: Bytes,
    },
    EventReceiverRegistered {
        completion: u8,
    },
    DescriptionRecord {
        completion: u8,
        next_record_handle: u32,
        next_transfer_handle: u32,
        transfer_flag: TransferFlag,
        record: Bytes,
    },
    PollEvent(PollEventResponse),
}

/// One fragment of a pulled event payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollEventResponse {
    pub completion: u8,
    pub tid: Tid,
    pub event_id: EventId,
    pub next_transfer_handle: u32,
    pub transfer_flag: TransferFlag,
    pub event_class: u8,
    pub data: Bytes,
    /// CRC32 over the whole reassembled payload; meaningful only on the
    /// final fragment of a multi-part transfer.
    pub checksum: u32,
}

/// An asynchronous notification pushed by a terminus, already decoded by the
/// delivery channel that carried it.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A payload is queued on the terminus and must be pulled
    MessagePoll {
        tid: Tid,
        format_version: u8,
        event_id: EventId,
    },
    /// A numeric sensor crossed a state boundary
    NumericSensor {
        tid: Tid,
        sensor_id: u16,
        event_state: u8,
        previous_state: u8,
        present_reading: u32,
    },
}

/// Message-level errors
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid transfer flag: {0:#x}")]
    InvalidTransferFlag(u8),

    #[error("invalid transfer operation: {0:#x}")]
    InvalidTransferOperation(u8),

    #[error("response kind does not match request")]
    ResponseMismatch,
}
