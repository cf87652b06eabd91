use cloudata_types::KeyspaceId;

/// Physical partitions of the shared store. Every backend keeps these apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    /// Current values: `keyspace(4) ++ key` → `codec::encode(value)`
    Data,
    /// Operation log: `keyspace(4) ++ seq(8)` → `LogRecord::encode()`
    Oplog,
    /// Keyspace names and IDs, both directions.
    Registry,
    /// Store-wide counters such as the keyspace ID high-water mark.
    Meta,
}

impl Partition {
    pub const ALL: [Partition; 4] =
        [Partition::Data, Partition::Oplog, Partition::Registry, Partition::Meta];

    pub fn name(self) -> &'static str {
        match self {
            Partition::Data => "data",
            Partition::Oplog => "oplog",
            Partition::Registry => "registry",
            Partition::Meta => "meta",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Insert { partition: Partition, key: Vec<u8>, value: Vec<u8> },
    Remove { partition: Partition, key: Vec<u8> },
}

/// Mutations that become visible together or not at all.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition: Partition, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.ops.push(BatchOp::Insert { partition, key: key.into(), value });
    }

    pub fn remove(&mut self, partition: Partition, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Remove { partition, key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Reverse-mapping record in the registry partition (bincode).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct KeyspaceRecord {
    pub id: KeyspaceId,
    pub name: String,
}
