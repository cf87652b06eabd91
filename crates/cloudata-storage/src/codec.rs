//! Byte encoding for [`Value`].
//!
//! Layout: `version(1) ++ tag(1) ++ body`
//!
//! | tag    | body                         |
//! |--------|------------------------------|
//! | `0x01` | `len_be_u32(4) ++ bytes`     |
//! | `0x02` | `i64_be(8)`                  |
//!
//! Readers accept every version up to [`CURRENT_VERSION`]. Schema changes are
//! additive only: a new tag or a new version, never a reinterpretation of an
//! existing one.

use cloudata_types::{CodecError, Value};

pub const CURRENT_VERSION: u8 = 1;

const TAG_BYTES: u8 = 0x01;
const TAG_INT: u8 = 0x02;

const HEADER_LEN: usize = 2;

pub fn encode(value: &Value) -> Vec<u8> {
    match value {
        Value::Bytes(b) => {
            let mut buf = Vec::with_capacity(HEADER_LEN + 4 + b.len());
            buf.push(CURRENT_VERSION);
            buf.push(TAG_BYTES);
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
            buf
        }
        Value::Int(n) => {
            let mut buf = Vec::with_capacity(HEADER_LEN + 8);
            buf.push(CURRENT_VERSION);
            buf.push(TAG_INT);
            buf.extend_from_slice(&n.to_be_bytes());
            buf
        }
    }
}

/// Decode exactly one value; trailing bytes are corruption.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let (value, used) = decode_prefix(bytes)?;
    if used != bytes.len() {
        return Err(CodecError::CorruptValue(format!(
            "{} trailing bytes after value",
            bytes.len() - used
        )));
    }
    Ok(value)
}

/// Decode one value from the front of `bytes`, returning it and the number of
/// bytes it occupied.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Value, usize), CodecError> {
    require(bytes, HEADER_LEN)?;
    match bytes[0] {
        0 => return Err(CodecError::CorruptValue("version 0 is not a valid version".into())),
        v if v > CURRENT_VERSION => return Err(CodecError::UnknownVersion(v)),
        _ => {}
    }

    match bytes[1] {
        TAG_BYTES => {
            require(bytes, HEADER_LEN + 4)?;
            let len = u32::from_be_bytes(read4(&bytes[HEADER_LEN..])) as usize;
            let start = HEADER_LEN + 4;
            require(bytes, start + len)?;
            Ok((Value::Bytes(bytes[start..start + len].to_vec()), start + len))
        }
        TAG_INT => {
            require(bytes, HEADER_LEN + 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + 8]);
            Ok((Value::Int(i64::from_be_bytes(raw)), HEADER_LEN + 8))
        }
        tag => Err(CodecError::CorruptValue(format!("unknown value tag {tag:#04x}"))),
    }
}

pub(crate) fn require(bytes: &[u8], needed: usize) -> Result<(), CodecError> {
    if bytes.len() < needed {
        Err(CodecError::TruncatedValue { needed, available: bytes.len() })
    } else {
        Ok(())
    }
}

/// Caller must have checked the length.
pub(crate) fn read4(bytes: &[u8]) -> [u8; 4] {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    raw
}
