use cloudata_types::{CodecError, RejectReason, Value};

use crate::codec::{self, read4, require};
use crate::log::{LogAction, LogEntry};

/// A request to transform the value stored at one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Set(Value),
    Delete,
    CompareAndSet { expected: Value, new: Value },
    /// Absent counts as zero. Overflow is rejected, never wrapped.
    Increment(i64),
    SetIfAbsent(Value),
    Append(Vec<u8>),
}

/// What an operation does to the current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    Write(Value),
    Remove,
    Reject(RejectReason),
}

impl Operation {
    /// Pure function of the current value; no clock, no I/O.
    pub fn transform(&self, current: Option<&Value>) -> Transform {
        match self {
            Operation::Set(v) => Transform::Write(v.clone()),
            Operation::Delete => Transform::Remove,
            Operation::CompareAndSet { expected, new } => match current {
                Some(cur) if cur == expected => Transform::Write(new.clone()),
                _ => Transform::Reject(RejectReason::PreconditionFailed),
            },
            Operation::Increment(delta) => {
                let base = match current {
                    None => 0,
                    Some(Value::Int(n)) => *n,
                    Some(Value::Bytes(b)) => match parse_decimal(b) {
                        Some(n) => n,
                        None => return Transform::Reject(RejectReason::WrongType),
                    },
                };
                match base.checked_add(*delta) {
                    Some(n) => Transform::Write(Value::Int(n)),
                    None => Transform::Reject(RejectReason::Overflow),
                }
            }
            Operation::SetIfAbsent(v) => match current {
                None => Transform::Write(v.clone()),
                Some(_) => Transform::Reject(RejectReason::PreconditionFailed),
            },
            Operation::Append(suffix) => match current {
                None => Transform::Write(Value::Bytes(suffix.clone())),
                Some(Value::Bytes(b)) => {
                    let mut joined = Vec::with_capacity(b.len() + suffix.len());
                    joined.extend_from_slice(b);
                    joined.extend_from_slice(suffix);
                    Transform::Write(Value::Bytes(joined))
                }
                Some(Value::Int(_)) => Transform::Reject(RejectReason::WrongType),
            },
        }
    }

    pub fn serialize(&self) -> LogEntry {
        match self {
            Operation::Set(v) => LogEntry { action: LogAction::Set, payload: codec::encode(v) },
            Operation::Delete => LogEntry { action: LogAction::Delete, payload: Vec::new() },
            Operation::CompareAndSet { expected, new } => {
                let expected = codec::encode(expected);
                let new = codec::encode(new);
                let mut payload = Vec::with_capacity(expected.len() + 4 + new.len());
                payload.extend_from_slice(&expected);
                payload.extend_from_slice(&(new.len() as u32).to_be_bytes());
                payload.extend_from_slice(&new);
                LogEntry { action: LogAction::Cas, payload }
            }
            Operation::Increment(delta) => {
                LogEntry { action: LogAction::Incr, payload: delta.to_be_bytes().to_vec() }
            }
            Operation::SetIfAbsent(v) => {
                LogEntry { action: LogAction::SetNx, payload: codec::encode(v) }
            }
            Operation::Append(suffix) => {
                LogEntry { action: LogAction::Append, payload: suffix.clone() }
            }
        }
    }

    pub fn from_entry(entry: &LogEntry) -> Result<Self, CodecError> {
        let payload = entry.payload.as_slice();
        match entry.action {
            LogAction::Set => Ok(Operation::Set(codec::decode(payload)?)),
            LogAction::Delete => {
                if payload.is_empty() {
                    Ok(Operation::Delete)
                } else {
                    Err(CodecError::CorruptValue("DELETE entry carries a payload".into()))
                }
            }
            LogAction::Cas => {
                let (expected, used) = codec::decode_prefix(payload)?;
                let rest = &payload[used..];
                require(rest, 4)?;
                let len = u32::from_be_bytes(read4(rest)) as usize;
                require(rest, 4 + len)?;
                if rest.len() != 4 + len {
                    return Err(CodecError::CorruptValue("trailing bytes after CAS payload".into()));
                }
                let new = codec::decode(&rest[4..])?;
                Ok(Operation::CompareAndSet { expected, new })
            }
            LogAction::Incr => {
                if payload.len() != 8 {
                    return Err(CodecError::CorruptValue(format!(
                        "INCR payload must be 8 bytes, got {}",
                        payload.len()
                    )));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(payload);
                Ok(Operation::Increment(i64::from_be_bytes(raw)))
            }
            LogAction::SetNx => Ok(Operation::SetIfAbsent(codec::decode(payload)?)),
            LogAction::Append => Ok(Operation::Append(payload.to_vec())),
        }
    }
}

/// Rebuild a key's value by reapplying its log from empty state.
///
/// Rejected transforms are skipped: only committed operations are ever logged,
/// and a rejection leaves the value unchanged either way.
pub fn replay<'a, I>(entries: I) -> Result<Option<Value>, CodecError>
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut state: Option<Value> = None;
    for entry in entries {
        let op = Operation::from_entry(entry)?;
        match op.transform(state.as_ref()) {
            Transform::Write(v) => state = Some(v),
            Transform::Remove => state = None,
            Transform::Reject(_) => {}
        }
    }
    Ok(state)
}

/// Redis stores counters as text; accept a plain ASCII `i64`.
/// Parse `bytes` as an `i64` written in canonical decimal: an optional `-`,
/// no `+`, no leading zeros and no `-0`. Exactly the strings `i64::to_string`
/// produces.
pub fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(bytes).ok()?;
    let n: i64 = text.parse().ok()?;
    (n.to_string() == text).then_some(n)
}
