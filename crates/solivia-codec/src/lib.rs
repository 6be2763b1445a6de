//! Request/response framing for the Delta Solivia RS-485 protocol
//! (Public Solar Inverter Communication Protocol, version 1.2).
//!
//! Everything here is pure: no I/O, no clocks.

use std::collections::BTreeMap;

use crc::{Crc, CRC_16_ARC};
use thiserror::Error;
use tracing::debug;
use types::{FieldValue, PointValue};

pub mod registry;

pub use registry::{
    family_for, fields_for, Encoding, Family, FieldDescriptor, FieldKind, Scale, MAX_VARIANT,
    MIN_VARIANT,
};

// protocol characters (page 7)
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

pub const CMD_READ: u8 = 0x60;
pub const SUBCMD_TELEMETRY: u8 = 0x01;

/// Header bytes before the payload: STX, ACK/ENQ, address, length, command, subcommand.
pub const HEADER_LEN: usize = 6;
/// CRC (2) plus ETX.
pub const TRAILER_LEN: usize = 3;
/// Smallest valid frame: header plus trailer with an empty payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;
/// Largest frame the length byte can describe.
pub const MAX_FRAME_LEN: usize = 4 + u8::MAX as usize + TRAILER_LEN;
pub const REQUEST_LEN: usize = 9;

const SOLIVIA_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

pub type FieldMap = BTreeMap<&'static str, FieldValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated ({actual} of {expected} bytes)")]
    Truncated { expected: usize, actual: usize },
    #[error("frame longer than declared ({actual} bytes, expected {expected})")]
    Oversized { expected: usize, actual: usize },
    #[error("bad {what} marker 0x{found:02x}")]
    BadMarker { what: &'static str, found: u8 },
    #[error("inverter {address} answered with NAK")]
    Nak { address: u8 },
    #[error("response from address {actual}, polled {expected}")]
    AddressMismatch { expected: u8, actual: u8 },
    #[error("unexpected command 0x{command:02x}/0x{subcommand:02x}")]
    UnexpectedCommand { command: u8, subcommand: u8 },
    #[error("CRC mismatch (frame 0x{received:04x}, calculated 0x{calculated:04x})")]
    ChecksumMismatch { received: u16, calculated: u16 },
    #[error("payload of {actual} bytes too short for {family:?} ({needed} needed)")]
    PayloadTooShort {
        family: Family,
        needed: usize,
        actual: usize,
    },
    #[error("variant {0} has no known frame layout")]
    UnsupportedVariant(u8),
}

/// CRC-16/ARC as used on the Solivia bus (reflected 0xA001, init 0).
pub fn checksum(bytes: &[u8]) -> u16 {
    SOLIVIA_CRC.checksum(bytes)
}

/// Builds the "read telemetry" enquiry for one inverter. The layout is the same
/// for every family.
pub fn encode_request(address: u8) -> [u8; REQUEST_LEN] {
    let mut frame = [STX, ENQ, address, 0x02, CMD_READ, SUBCMD_TELEMETRY, 0, 0, ETX];
    let crc = checksum(&frame[1..6]).to_le_bytes();
    frame[6] = crc[0];
    frame[7] = crc[1];
    frame
}

/// Builds an ACK response carrying `payload`. Used by the bus simulator and tests.
pub fn encode_response(address: u8, payload: &[u8]) -> Vec<u8> {
    let data_len = u8::try_from(payload.len() + 2).unwrap_or(u8::MAX);
    let payload = &payload[..usize::from(data_len) - 2];

    let mut frame = Vec::with_capacity(payload.len() + MIN_FRAME_LEN);
    frame.extend_from_slice(&[STX, ACK, address, data_len, CMD_READ, SUBCMD_TELEMETRY]);
    frame.extend_from_slice(payload);
    let crc = checksum(&frame[1..]);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.push(ETX);
    frame
}

/// Total frame length announced by a frame prefix, once its length byte has
/// been received.
pub fn expected_frame_len(prefix: &[u8]) -> Option<usize> {
    prefix.get(3).map(|len| 4 + usize::from(*len) + TRAILER_LEN)
}

/// Whether the first six bytes of `prefix` can start a telemetry frame:
/// STX, an ENQ/ACK/NAK code, a nonzero address, a length covering the command
/// bytes and the read command itself. `None` until six bytes are present.
pub fn is_frame_header(prefix: &[u8]) -> Option<bool> {
    let header = prefix.get(..HEADER_LEN)?;
    Some(
        header[0] == STX
            && matches!(header[1], ENQ | ACK | NAK)
            && header[2] != 0
            && header[3] >= 2
            && header[4] == CMD_READ
            && header[5] == SUBCMD_TELEMETRY,
    )
}

/// Validates a response to a poll of `polled_address` and decodes its payload
/// with the layout of `variant`.
///
/// Checks run in order: minimum length, start marker, address echo, declared
/// length, end marker, command, checksum, payload size. Nothing is decoded
/// unless every check passes.
pub fn decode_response(variant: u8, frame: &[u8], polled_address: u8) -> Result<FieldMap, FrameError> {
    let family = family_for(variant).ok_or(FrameError::UnsupportedVariant(variant))?;
    let payload = validate_frame(frame, polled_address)?;
    decode_payload(family, payload)
}

/// Checks framing, addressing and CRC of a response; returns its payload.
pub fn validate_frame(frame: &[u8], polled_address: u8) -> Result<&[u8], FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated {
            expected: MIN_FRAME_LEN,
            actual: frame.len(),
        });
    }

    if frame[0] != STX {
        return Err(FrameError::BadMarker {
            what: "start",
            found: frame[0],
        });
    }
    match frame[1] {
        ACK => {}
        NAK => return Err(FrameError::Nak { address: frame[2] }),
        other => {
            return Err(FrameError::BadMarker {
                what: "acknowledge",
                found: other,
            })
        }
    }

    if frame[2] != polled_address {
        return Err(FrameError::AddressMismatch {
            expected: polled_address,
            actual: frame[2],
        });
    }

    let expected = 4 + usize::from(frame[3]) + TRAILER_LEN;
    if frame.len() < expected {
        return Err(FrameError::Truncated {
            expected,
            actual: frame.len(),
        });
    }
    if frame.len() > expected {
        return Err(FrameError::Oversized {
            expected,
            actual: frame.len(),
        });
    }

    let end = frame[expected - 1];
    if end != ETX {
        return Err(FrameError::BadMarker {
            what: "end",
            found: end,
        });
    }

    if frame[3] < 2 || frame[4] != CMD_READ || frame[5] != SUBCMD_TELEMETRY {
        return Err(FrameError::UnexpectedCommand {
            command: frame[4],
            subcommand: frame[5],
        });
    }

    let end_of_data = expected - TRAILER_LEN;
    let received = u16::from_le_bytes([frame[end_of_data], frame[end_of_data + 1]]);
    let calculated = checksum(&frame[1..end_of_data]);
    if received != calculated {
        return Err(FrameError::ChecksumMismatch {
            received,
            calculated,
        });
    }

    Ok(&frame[HEADER_LEN..end_of_data])
}

/// Decodes every field of the family table from a validated payload.
pub fn decode_payload(family: Family, payload: &[u8]) -> Result<FieldMap, FrameError> {
    let needed = family.payload_len();
    if payload.len() < needed {
        return Err(FrameError::PayloadTooShort {
            family,
            needed,
            actual: payload.len(),
        });
    }
    if payload.len() > needed {
        debug!(
            family = family.name(),
            extra = payload.len() - needed,
            "ignoring trailing payload bytes"
        );
    }

    Ok(family
        .fields()
        .iter()
        .map(|field| (field.name, read_field(field, payload)))
        .collect())
}

/// Serialises a field mapping into a payload of the family layout. Fields
/// absent from `values` are left zeroed.
pub fn encode_payload(family: Family, values: &FieldMap) -> Vec<u8> {
    let mut payload = vec![0u8; family.payload_len()];
    for field in family.fields() {
        if let Some(value) = values.get(field.name) {
            write_field(field, value, &mut payload);
        }
    }
    payload
}

pub fn read_raw(encoding: Encoding, bytes: &[u8]) -> Option<PointValue> {
    match encoding {
        Encoding::U8 => bytes.first().copied().map(PointValue::U8),
        Encoding::U16 => Some(PointValue::U16(u16::from_be_bytes(bytes.get(..2)?.try_into().ok()?))),
        Encoding::I16 => Some(PointValue::I16(i16::from_be_bytes(bytes.get(..2)?.try_into().ok()?))),
        Encoding::U32 => Some(PointValue::U32(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))),
        Encoding::Ascii(_) => None,
    }
}

fn read_field(field: &FieldDescriptor, payload: &[u8]) -> FieldValue {
    let bytes = &payload[field.offset..field.end()];
    match field.encoding {
        Encoding::Ascii(_) => FieldValue::Text(parse_string(bytes)),
        encoding => {
            let raw = read_raw(encoding, bytes).map(PointValue::as_f64).unwrap_or_default();
            FieldValue::Number(field.scale.apply(raw))
        }
    }
}

fn write_field(field: &FieldDescriptor, value: &FieldValue, payload: &mut [u8]) {
    let slot = &mut payload[field.offset..field.end()];
    match (field.encoding, value) {
        (Encoding::Ascii(len), FieldValue::Text(text)) => {
            slot.fill(b' ');
            let bytes = text.as_bytes();
            let n = bytes.len().min(len);
            slot[..n].copy_from_slice(&bytes[..n]);
        }
        (encoding, FieldValue::Number(value)) => {
            let raw = field.scale.unapply(*value);
            match encoding {
                Encoding::U8 => slot[0] = raw as u8,
                Encoding::U16 => slot.copy_from_slice(&(raw as u16).to_be_bytes()),
                Encoding::I16 => slot.copy_from_slice(&(raw as i16).to_be_bytes()),
                Encoding::U32 => slot.copy_from_slice(&(raw as u32).to_be_bytes()),
                Encoding::Ascii(_) => {}
            }
        }
        _ => {}
    }
}

fn parse_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|ch: char| ch == '\0' || ch.is_whitespace())
        .to_string()
}
