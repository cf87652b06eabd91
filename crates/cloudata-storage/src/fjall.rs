use std::path::Path;
use std::sync::Arc;

use cloudata_types::CloudataError;

use crate::traits::Backend;
use crate::types::{BatchOp, Partition, WriteBatch};

fn fjall_err(e: fjall::Error) -> CloudataError {
    CloudataError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallBackend: one fjall keyspace per partition
// ---------------------------------------------------------------------------

/// Persistent `Backend`.
///
/// All four partitions live in a single fjall `Database` so that a batch
/// touching `data` and `oplog` together is atomic.
pub struct FjallBackend {
    pub db: fjall::Database,
    /// `keyspace(4) ++ key` → encoded value
    pub data: fjall::Keyspace,
    /// `keyspace(4) ++ seq(8)` → encoded log record
    pub oplog: fjall::Keyspace,
    /// `n ++ name` → bincode(id), `i ++ id(4)` → bincode(record)
    pub registry: fjall::Keyspace,
    /// `label_utf8` → bincode(value)
    pub meta: fjall::Keyspace,
}

impl FjallBackend {
    /// Open (or create) a backend at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, CloudataError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let open = |p: Partition| {
            db.keyspace(p.name(), fjall::KeyspaceCreateOptions::default).map_err(fjall_err)
        };
        let data = open(Partition::Data)?;
        let oplog = open(Partition::Oplog)?;
        let registry = open(Partition::Registry)?;
        let meta = open(Partition::Meta)?;
        tracing::debug!(path = %path.display(), "fjall backend opened");
        Ok(Arc::new(FjallBackend { db, data, oplog, registry, meta }))
    }

    fn partition(&self, partition: Partition) -> &fjall::Keyspace {
        match partition {
            Partition::Data => &self.data,
            Partition::Oplog => &self.oplog,
            Partition::Registry => &self.registry,
            Partition::Meta => &self.meta,
        }
    }
}

impl Backend for FjallBackend {
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, CloudataError> {
        Ok(self.partition(partition).get(key).map_err(fjall_err)?.map(|v| v.to_vec()))
    }

    fn scan_prefix(
        &self,
        partition: Partition,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CloudataError> {
        self.partition(partition)
            .prefix(prefix)
            .map(|g| g.into_inner().map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(fjall_err))
            .collect()
    }

    fn last_key(
        &self,
        partition: Partition,
        prefix: &[u8],
    ) -> Result<Option<Vec<u8>>, CloudataError> {
        match self.partition(partition).prefix(prefix).next_back() {
            None => Ok(None),
            Some(g) => {
                let (k, _) = g.into_inner().map_err(fjall_err)?;
                Ok(Some(k.to_vec()))
            }
        }
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), CloudataError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut b = self.db.batch();
        for op in batch.ops {
            match op {
                BatchOp::Insert { partition, key, value } => {
                    b.insert(self.partition(partition), key, value);
                }
                BatchOp::Remove { partition, key } => {
                    b.remove(self.partition(partition), key);
                }
            }
        }
        b.commit().map_err(fjall_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
