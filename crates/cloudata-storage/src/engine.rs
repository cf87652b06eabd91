//! Applies operations to keys and appends them to the operation log.
//!
//! `apply` runs read → transform → write under a per-key latch, so at most
//! one operation per `(keyspace, key)` is in that window at a time while
//! different keys proceed in parallel. The latch is awaited before the
//! blocking section starts, so queued callers hold no blocking thread. The data mutation and the log record
//! go to the backend in one batch: that commit is the only point at which an
//! `apply` becomes visible, and an `apply` dropped before it leaves no trace.
//!
//! Multi-key transactions are not provided here; callers that need them must
//! build them on top.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use cloudata_types::{ApplyResult, CloudataError, KeyspaceId, Value};

use crate::codec;
use crate::keys::{data_key, keyspace_prefix, oplog_key, oplog_seq, user_key};
use crate::latch::KeyLatches;
use crate::log::{LogEntry, LogRecord};
use crate::operation::{self, Operation, Transform};
use crate::registry::KeyspaceRegistry;
use crate::traits::{Backend, OperationStore};
use crate::types::{Partition, WriteBatch};

struct Shared<B> {
    backend: Arc<B>,
    registry: KeyspaceRegistry<B>,
    latches: KeyLatches,
    /// Next log sequence number per keyspace, loaded lazily from the log tail.
    sequences: DashMap<KeyspaceId, Arc<AtomicU64>>,
}

/// Cheap to clone; clones share one engine.
pub struct Engine<B> {
    inner: Arc<Shared<B>>,
}

impl<B> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Engine { inner: self.inner.clone() }
    }
}

fn join_err(e: tokio::task::JoinError) -> CloudataError {
    CloudataError::Storage(e.to_string())
}

impl<B: Backend> Engine<B> {
    /// Open an engine over `backend`, initialising the keyspace registry.
    pub fn open(backend: Arc<B>) -> Result<Self, CloudataError> {
        let registry = KeyspaceRegistry::open(backend.clone())?;
        Ok(Engine {
            inner: Arc::new(Shared {
                backend,
                registry,
                latches: KeyLatches::new(),
                sequences: DashMap::new(),
            }),
        })
    }

    pub fn registry(&self) -> &KeyspaceRegistry<B> {
        &self.inner.registry
    }

    pub fn keyspace_name(&self, keyspace: KeyspaceId) -> Result<String, CloudataError> {
        self.inner.registry.id_to_name(keyspace)
    }

    /// Every log entry recorded for `key`, in commit order, with its sequence number.
    ///
    /// Walks the keyspace's whole log; meant for recovery and diagnostics.
    pub async fn log_for_key(
        &self,
        keyspace: KeyspaceId,
        key: &[u8],
    ) -> Result<Vec<(u64, LogEntry)>, CloudataError> {
        let inner = self.inner.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<(u64, LogEntry)>, CloudataError> {
            let records = inner.log_records(keyspace)?;
            Ok(records
                .into_iter()
                .filter(|(_, r)| r.key == key)
                .map(|(seq, r)| (seq, r.entry))
                .collect())
        })
        .await
        .map_err(join_err)?
    }

    /// Reconstruct one key's value from its log alone.
    pub async fn replay_key(
        &self,
        keyspace: KeyspaceId,
        key: &[u8],
    ) -> Result<Option<Value>, CloudataError> {
        let entries = self.log_for_key(keyspace, key).await?;
        Ok(operation::replay(entries.iter().map(|(_, e)| e))?)
    }

    /// Reconstruct every live key of a keyspace from its log alone.
    pub async fn replay_keyspace(
        &self,
        keyspace: KeyspaceId,
    ) -> Result<BTreeMap<Vec<u8>, Value>, CloudataError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<BTreeMap<Vec<u8>, Value>, CloudataError> {
            let mut per_key: BTreeMap<Vec<u8>, Vec<LogEntry>> = BTreeMap::new();
            for (_, record) in inner.log_records(keyspace)? {
                per_key.entry(record.key).or_default().push(record.entry);
            }
            let mut state = BTreeMap::new();
            for (key, entries) in per_key {
                if let Some(value) = operation::replay(&entries)? {
                    state.insert(key, value);
                }
            }
            Ok(state)
        })
        .await
        .map_err(join_err)?
    }

    /// Current contents of a keyspace, ordered by key bytes.
    pub async fn scan_keyspace(
        &self,
        keyspace: KeyspaceId,
    ) -> Result<Vec<(Vec<u8>, Value)>, CloudataError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(Vec<u8>, Value)>, CloudataError> {
            inner
                .backend
                .scan_prefix(Partition::Data, &keyspace_prefix(keyspace))?
                .into_iter()
                .map(|(k, v)| -> Result<(Vec<u8>, Value), CloudataError> {
                    Ok((user_key(&k).to_vec(), codec::decode(&v)?))
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }
}

/// What one locked apply did. `existed` tells whether a value was present
/// before the operation ran.
struct Outcome {
    result: ApplyResult,
    existed: bool,
}

impl<B: Backend> Engine<B> {
    /// Take the key's latch, then run the read, transform and commit on a
    /// blocking thread that owns the latch until it finishes.
    async fn apply_outcome(
        &self,
        keyspace: KeyspaceId,
        key: &[u8],
        op: Operation,
    ) -> Result<Outcome, CloudataError> {
        if !self.inner.registry.contains(keyspace) {
            return Err(CloudataError::KeyspaceIdNotFound(keyspace));
        }
        let physical = data_key(keyspace, key);
        let latch = self.inner.latches.lock(physical.clone()).await;

        let inner = self.inner.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Outcome, CloudataError> {
            let _latch = latch;
            inner.apply_locked(keyspace, &key, physical, op)
        })
        .await
        .map_err(join_err)?
    }
}

impl<B: Backend> Shared<B> {
    /// Caller holds the latch for `physical`.
    fn apply_locked(
        &self,
        keyspace: KeyspaceId,
        key: &[u8],
        physical: Vec<u8>,
        op: Operation,
    ) -> Result<Outcome, CloudataError> {
        let current = self.read(&physical)?;
        let existed = current.is_some();
        let new = match op.transform(current.as_ref()) {
            Transform::Reject(reason) => {
                tracing::debug!(keyspace = keyspace.0, ?reason, "operation rejected");
                return Ok(Outcome { result: ApplyResult::Rejected(reason), existed });
            }
            // Nothing to remove: no write and no log entry.
            Transform::Remove if !existed => {
                return Ok(Outcome { result: ApplyResult::Applied(None), existed });
            }
            Transform::Write(v) => Some(v),
            Transform::Remove => None,
        };

        let seq = self.next_seq(keyspace)?;
        let record = LogRecord { key: key.to_vec(), entry: op.serialize() };

        let mut batch = WriteBatch::new();
        match &new {
            Some(v) => batch.insert(Partition::Data, physical, codec::encode(v)),
            None => batch.remove(Partition::Data, physical),
        }
        batch.insert(Partition::Oplog, oplog_key(keyspace, seq), record.encode());
        self.backend.commit(batch)?;

        tracing::debug!(keyspace = keyspace.0, seq, action = ?record.entry.action, "operation applied");
        Ok(Outcome { result: ApplyResult::Applied(new), existed })
    }

    fn read(&self, physical: &[u8]) -> Result<Option<Value>, CloudataError> {
        match self.backend.get(Partition::Data, physical)? {
            Some(raw) => Ok(Some(codec::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn next_seq(&self, keyspace: KeyspaceId) -> Result<u64, CloudataError> {
        let counter = self
            .sequences
            .entry(keyspace)
            .or_try_insert_with(|| {
                let last = self
                    .backend
                    .last_key(Partition::Oplog, &keyspace_prefix(keyspace))?
                    .and_then(|k| oplog_seq(&k))
                    .unwrap_or(0);
                Ok::<_, CloudataError>(Arc::new(AtomicU64::new(last + 1)))
            })?
            .clone();
        Ok(counter.fetch_add(1, Ordering::SeqCst))
    }

    fn log_records(&self, keyspace: KeyspaceId) -> Result<Vec<(u64, LogRecord)>, CloudataError> {
        self.backend
            .scan_prefix(Partition::Oplog, &keyspace_prefix(keyspace))?
            .into_iter()
            .map(|(k, v)| -> Result<(u64, LogRecord), CloudataError> {
                let seq = oplog_seq(&k)
                    .ok_or_else(|| CloudataError::Storage("malformed oplog key".into()))?;
                Ok((seq, LogRecord::decode(&v)?))
            })
            .collect()
    }
}

impl<B: Backend> OperationStore for Engine<B> {
    async fn apply(
        &self,
        keyspace: KeyspaceId,
        key: &[u8],
        op: Operation,
    ) -> Result<ApplyResult, CloudataError> {
        Ok(self.apply_outcome(keyspace, key, op).await?.result)
    }

    async fn remove(&self, keyspace: KeyspaceId, key: &[u8]) -> Result<bool, CloudataError> {
        Ok(self.apply_outcome(keyspace, key, Operation::Delete).await?.existed)
    }

    async fn get(&self, keyspace: KeyspaceId, key: &[u8]) -> Result<Option<Value>, CloudataError> {
        let inner = self.inner.clone();
        let physical = data_key(keyspace, key);
        tokio::task::spawn_blocking(move || inner.read(&physical)).await.map_err(join_err)?
    }

    async fn register_keyspace(&self, name: &str) -> Result<KeyspaceId, CloudataError> {
        // Fast path never touches the allocator.
        if let Ok(id) = self.inner.registry.resolve(name) {
            return Ok(id);
        }
        let inner = self.inner.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || inner.registry.register(&name))
            .await
            .map_err(join_err)?
    }

    fn resolve_keyspace(&self, name: &str) -> Result<KeyspaceId, CloudataError> {
        self.inner.registry.resolve(name)
    }
}
