//! Durable log entry format.
//!
//! `LogEntry` framing: `action(1) ++ payload_len_be_u32(4) ++ payload`.
//!
//! A `LogRecord` is what the engine stores in the operation log partition
//! under `keyspace(4) ++ seq(8)`: `key_len_be_u32(4) ++ key ++ LogEntry`.
//! The action tags are an on-disk contract and must never be renumbered.

use cloudata_types::CodecError;

use crate::codec::{read4, require};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogAction {
    Set = 1,
    Delete = 2,
    Cas = 3,
    Incr = 4,
    SetNx = 5,
    Append = 6,
}

impl LogAction {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            1 => Ok(LogAction::Set),
            2 => Ok(LogAction::Delete),
            3 => Ok(LogAction::Cas),
            4 => Ok(LogAction::Incr),
            5 => Ok(LogAction::SetNx),
            6 => Ok(LogAction::Append),
            other => Err(CodecError::UnknownAction(other)),
        }
    }
}

/// Serialized form of an applied operation. Write-once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub action: LogAction,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.action.tag());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        require(bytes, 5)?;
        let action = LogAction::from_tag(bytes[0])?;
        let len = u32::from_be_bytes(read4(&bytes[1..])) as usize;
        require(bytes, 5 + len)?;
        if bytes.len() != 5 + len {
            return Err(CodecError::CorruptValue(format!(
                "{} trailing bytes after log entry",
                bytes.len() - 5 - len
            )));
        }
        Ok(LogEntry { action, payload: bytes[5..].to_vec() })
    }
}

/// A log entry together with the user key it was applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub entry: LogEntry,
}

impl LogRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.key.len() + 5 + self.entry.payload.len());
        buf.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        self.entry.encode_into(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        require(bytes, 4)?;
        let key_len = u32::from_be_bytes(read4(bytes)) as usize;
        require(bytes, 4 + key_len)?;
        let key = bytes[4..4 + key_len].to_vec();
        let entry = LogEntry::decode(&bytes[4 + key_len..])?;
        Ok(LogRecord { key, entry })
    }
}
