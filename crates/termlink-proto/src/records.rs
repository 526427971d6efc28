//! Description record model
//!
//! A terminus describes its entities, sensors, effecters, and their
//! associations through typed binary records pulled during discovery. This
//! module decodes a raw record page into a tagged [`DescriptionRecord`],
//! with truncation reported separately from malformed content so callers can
//! tell a short read from a corrupt one.

use bytes::{Buf, Bytes};
use thiserror::Error;

use crate::messages::Tid;

/// Record type tags
pub mod record_type {
    pub const TERMINUS_LOCATOR: u8 = 1;
    pub const NUMERIC_EFFECTER: u8 = 9;
    pub const ASSOCIATION: u8 = 15;
    pub const NAME_TABLE: u8 = 16;
    pub const COMPACT_SENSOR: u8 = 21;
}

/// Common header carried by every description record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_handle: u32,
    pub version: u8,
    pub record_type: u8,
    pub change_number: u16,
    pub data_length: u16,
}

impl RecordHeader {
    pub const SIZE: usize = 10;
}

/// An entity referenced by association and sensor records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entity {
    pub kind: u16,
    pub instance: u16,
    pub container: u16,
}

/// Maps a terminus handle to its transport address and validity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorRecord {
    pub terminus_handle: u16,
    pub valid: bool,
    pub tid: Tid,
    pub endpoint: u8,
}

/// Parent/children containment edge for the shared entity tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRecord {
    pub terminus_handle: u16,
    pub association_kind: u8,
    pub container: Entity,
    pub children: Vec<Entity>,
}

/// Compact numeric sensor description
#[derive(Debug, Clone, PartialEq)]
pub struct CompactSensorRecord {
    pub terminus_handle: u16,
    pub sensor_id: u16,
    pub entity: Entity,
    pub base_unit: u8,
    pub unit_modifier: i8,
    pub occurrence_rate: u8,
    /// Bit n set means threshold n below is meaningful
    pub range_support: u8,
    pub warning_high: i32,
    pub warning_low: i32,
    pub critical_high: i32,
    pub critical_low: i32,
    pub name: Option<String>,
}

/// Numeric effecter description
#[derive(Debug, Clone, PartialEq)]
pub struct NumericEffecterRecord {
    pub terminus_handle: u16,
    pub effecter_id: u16,
    pub entity: Entity,
    pub base_unit: u8,
    pub unit_modifier: i8,
    pub offset: i32,
    pub resolution: i32,
}

/// Auxiliary display names for one effecter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTableRecord {
    pub terminus_handle: u16,
    pub effecter_id: u16,
    /// Per effecter index, a list of (language tag, display name)
    pub names: Vec<Vec<(String, String)>>,
}

/// A decoded description record, tagged by type
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptionRecord {
    TerminusLocator(LocatorRecord),
    Association(AssociationRecord),
    CompactSensor(CompactSensorRecord),
    NumericEffecter(NumericEffecterRecord),
    NameTable(NameTableRecord),
    /// Recognized header but a type this engine does not model; kept opaque
    /// so it can still be committed to the repository verbatim.
    Other { record_type: u8, body: Bytes },
}

impl DescriptionRecord {
    /// Decode a raw record page.
    pub fn decode(mut buf: Bytes) -> Result<(RecordHeader, DescriptionRecord), RecordError> {
        let header = decode_header(&mut buf)?;
        let body_len = usize::from(header.data_length);
        if buf.remaining() < body_len {
            return Err(RecordError::Truncated {
                need: body_len,
                have: buf.remaining(),
            });
        }
        let mut body = buf.split_to(body_len);

        let record = match header.record_type {
            record_type::TERMINUS_LOCATOR => {
                DescriptionRecord::TerminusLocator(decode_locator(&mut body)?)
            }
            record_type::ASSOCIATION => DescriptionRecord::Association(decode_association(&mut body)?),
            record_type::COMPACT_SENSOR => {
                DescriptionRecord::CompactSensor(decode_compact_sensor(&mut body)?)
            }
            record_type::NUMERIC_EFFECTER => {
                DescriptionRecord::NumericEffecter(decode_numeric_effecter(&mut body)?)
            }
            record_type::NAME_TABLE => DescriptionRecord::NameTable(decode_name_table(&mut body)?),
            other => DescriptionRecord::Other {
                record_type: other,
                body,
            },
        };

        Ok((header, record))
    }
}

fn need(buf: &impl Buf, bytes: usize) -> Result<(), RecordError> {
    if buf.remaining() < bytes {
        Err(RecordError::Truncated {
            need: bytes,
            have: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn decode_header(buf: &mut Bytes) -> Result<RecordHeader, RecordError> {
    need(buf, RecordHeader::SIZE)?;
    Ok(RecordHeader {
        record_handle: buf.get_u32_le(),
        version: buf.get_u8(),
        record_type: buf.get_u8(),
        change_number: buf.get_u16_le(),
        data_length: buf.get_u16_le(),
    })
}

fn decode_entity(buf: &mut Bytes) -> Result<Entity, RecordError> {
    need(buf, 6)?;
    Ok(Entity {
        kind: buf.get_u16_le(),
        instance: buf.get_u16_le(),
        container: buf.get_u16_le(),
    })
}

fn decode_locator(buf: &mut Bytes) -> Result<LocatorRecord, RecordError> {
    need(buf, 5)?;
    Ok(LocatorRecord {
        terminus_handle: buf.get_u16_le(),
        valid: buf.get_u8() != 0,
        tid: buf.get_u8(),
        endpoint: buf.get_u8(),
    })
}

fn decode_association(buf: &mut Bytes) -> Result<AssociationRecord, RecordError> {
    need(buf, 3)?;
    let terminus_handle = buf.get_u16_le();
    let association_kind = buf.get_u8();
    let container = decode_entity(buf)?;
    need(buf, 1)?;
    let count = usize::from(buf.get_u8());
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        children.push(decode_entity(buf)?);
    }
    Ok(AssociationRecord {
        terminus_handle,
        association_kind,
        container,
        children,
    })
}

fn decode_compact_sensor(buf: &mut Bytes) -> Result<CompactSensorRecord, RecordError> {
    need(buf, 4)?;
    let terminus_handle = buf.get_u16_le();
    let sensor_id = buf.get_u16_le();
    let entity = decode_entity(buf)?;
    need(buf, 20)?;
    let base_unit = buf.get_u8();
    let unit_modifier = buf.get_i8();
    let occurrence_rate = buf.get_u8();
    let range_support = buf.get_u8();
    let warning_high = buf.get_i32_le();
    let warning_low = buf.get_i32_le();
    let critical_high = buf.get_i32_le();
    let critical_low = buf.get_i32_le();
    need(buf, 1)?;
    let name_len = usize::from(buf.get_u8());
    let name = if name_len == 0 {
        None
    } else {
        need(buf, name_len)?;
        let raw = buf.split_to(name_len);
        Some(
            std::str::from_utf8(&raw)
                .map_err(|_| RecordError::MalformedName)?
                .trim_end_matches('\0')
                .to_string(),
        )
    };
    Ok(CompactSensorRecord {
        terminus_handle,
        sensor_id,
        entity,
        base_unit,
        unit_modifier,
        occurrence_rate,
        range_support,
        warning_high,
        warning_low,
        critical_high,
        critical_low,
        name,
    })
}

fn decode_numeric_effecter(buf: &mut Bytes) -> Result<NumericEffecterRecord, RecordError> {
    need(buf, 4)?;
    let terminus_handle = buf.get_u16_le();
    let effecter_id = buf.get_u16_le();
    let entity = decode_entity(buf)?;
    need(buf, 10)?;
    Ok(NumericEffecterRecord {
        terminus_handle,
        effecter_id,
        entity,
        base_unit: buf.get_u8(),
        unit_modifier: buf.get_i8(),
        offset: buf.get_i32_le(),
        resolution: buf.get_i32_le(),
    })
}

fn decode_name_table(buf: &mut Bytes) -> Result<NameTableRecord, RecordError> {
    need(buf, 5)?;
    let terminus_handle = buf.get_u16_le();
    let effecter_id = buf.get_u16_le();
    let effecter_count = usize::from(buf.get_u8());

    let mut names = Vec::with_capacity(effecter_count);
    for _ in 0..effecter_count {
        need(buf, 1)?;
        let string_count = usize::from(buf.get_u8());
        let mut entry = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            let tag = read_ascii_nul(buf)?;
            let name = read_utf16_nul(buf)?;
            entry.push((tag, name));
        }
        names.push(entry);
    }

    Ok(NameTableRecord {
        terminus_handle,
        effecter_id,
        names,
    })
}

/// NUL-terminated ASCII string (language tag)
fn read_ascii_nul(buf: &mut Bytes) -> Result<String, RecordError> {
    let mut out = String::new();
    loop {
        need(buf, 1)?;
        match buf.get_u8() {
            0 => return Ok(out),
            b if b.is_ascii() => out.push(char::from(b)),
            _ => return Err(RecordError::MalformedName),
        }
    }
}

/// NUL-terminated UTF-16LE string (display name)
fn read_utf16_nul(buf: &mut Bytes) -> Result<String, RecordError> {
    let mut units = Vec::new();
    loop {
        need(buf, 2)?;
        match buf.get_u16_le() {
            0 => break,
            unit => units.push(unit),
        }
    }
    String::from_utf16(&units).map_err(|_| RecordError::MalformedName)
}

/// Errors from description-record decoding
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The buffer ended before the record did
    #[error("record truncated: need {need} more bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// A name field was not valid text
    #[error("malformed name string")]
    MalformedName,
}
