use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use cloudata_types::CloudataError;

use crate::traits::Backend;
use crate::types::{BatchOp, Partition, WriteBatch};

/// In-memory `Backend` backed by one `BTreeMap` per partition.
///
/// Intended for unit tests; not persisted across restarts. A commit holds the
/// write lock for the whole batch, which is what makes it atomic.
pub struct MemBackend {
    partitions: RwLock<HashMap<Partition, BTreeMap<Vec<u8>, Vec<u8>>>>,
    fail_next_commit: AtomicBool,
}

impl MemBackend {
    pub fn new() -> Self {
        MemBackend {
            partitions: RwLock::new(
                Partition::ALL.iter().map(|p| (*p, BTreeMap::new())).collect(),
            ),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    /// Make the next `commit` fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of entries in `partition`.
    pub fn len(&self, partition: Partition) -> usize {
        self.partitions.read().get(&partition).map(BTreeMap::len).unwrap_or(0)
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemBackend {
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, CloudataError> {
        Ok(self.partitions.read().get(&partition).and_then(|m| m.get(key).cloned()))
    }

    fn scan_prefix(
        &self,
        partition: Partition,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CloudataError> {
        let g = self.partitions.read();
        let Some(map) = g.get(&partition) else {
            return Ok(Vec::new());
        };
        Ok(map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn last_key(
        &self,
        partition: Partition,
        prefix: &[u8],
    ) -> Result<Option<Vec<u8>>, CloudataError> {
        let g = self.partitions.read();
        let Some(map) = g.get(&partition) else {
            return Ok(None);
        };
        Ok(map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .last()
            .map(|(k, _)| k.clone()))
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), CloudataError> {
        let mut g = self.partitions.write();
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(CloudataError::Storage("injected commit failure".into()));
        }
        for op in batch.ops {
            match op {
                BatchOp::Insert { partition, key, value } => {
                    g.entry(partition).or_default().insert(key, value);
                }
                BatchOp::Remove { partition, key } => {
                    if let Some(map) = g.get_mut(&partition) {
                        map.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
