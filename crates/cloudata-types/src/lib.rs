use std::fmt;

/// Numeric namespace for keys that share the one physical ordered store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct KeyspaceId(pub u32);

impl KeyspaceId {
    /// Reserved keyspace, pre-registered as `"system"` when a store is initialised.
    pub const SYSTEM: KeyspaceId = KeyspaceId(0);

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored value. Carries no key or keyspace information of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
}

impl Value {
    /// Byte rendering as a Redis client expects it: integers become ASCII decimal.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bytes(b) => b.clone(),
            Value::Int(n) => n.to_string().into_bytes(),
        }
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

/// Why an operation was refused. These are ordinary outcomes, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Compare-and-set mismatch, or set-if-absent on a present key.
    PreconditionFailed,
    /// Increment would leave the `i64` range.
    Overflow,
    /// The stored value cannot take part in the operation (e.g. incrementing text).
    WrongType,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::PreconditionFailed => f.write_str("precondition failed"),
            RejectReason::Overflow => f.write_str("increment or decrement would overflow"),
            RejectReason::WrongType => f.write_str("operation against a value of the wrong type"),
        }
    }
}

/// Outcome of applying one operation to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// The operation committed; carries the new value, `None` after a deletion.
    Applied(Option<Value>),
    Rejected(RejectReason),
}

impl ApplyResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyResult::Applied(_))
    }
}

/// Failure to decode a value, a log entry or a log record.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("corrupt value: {0}")]
    CorruptValue(String),
    #[error("truncated value: needed {needed} bytes, {available} available")]
    TruncatedValue { needed: usize, available: usize },
    #[error("unknown value version {0}")]
    UnknownVersion(u8),
    #[error("unknown log action {0}")]
    UnknownAction(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum CloudataError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("keyspace '{0}' not found")]
    KeyspaceNotFound(String),
    #[error("keyspace id {0} not found")]
    KeyspaceIdNotFound(KeyspaceId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
