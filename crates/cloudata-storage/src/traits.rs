use std::future::Future;

use cloudata_types::{ApplyResult, CloudataError, KeyspaceId, Value};

use crate::operation::Operation;
use crate::types::{Partition, WriteBatch};

/// An ordered byte store with atomic multi-partition batches.
///
/// Methods are blocking; async callers go through `spawn_blocking`. The
/// engine is the only writer: nothing else may call [`Backend::commit`] on
/// the `Data` or `Oplog` partitions.
pub trait Backend: Send + Sync + 'static {
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, CloudataError>;

    /// All entries whose key starts with `prefix`, ascending.
    fn scan_prefix(
        &self,
        partition: Partition,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CloudataError>;

    /// Largest key starting with `prefix`, or `None` if there is none.
    fn last_key(&self, partition: Partition, prefix: &[u8])
        -> Result<Option<Vec<u8>>, CloudataError>;

    /// Apply every mutation in `batch` atomically.
    fn commit(&self, batch: WriteBatch) -> Result<(), CloudataError>;
}

/// What protocol front-ends need from the storage engine.
///
/// Futures are `Send`; front-ends spawn them onto a multi-threaded runtime.
pub trait OperationStore: Send + Sync + 'static {
    /// Apply `op` to the value at `(keyspace, key)` atomically with its log append.
    fn apply(&self, keyspace: KeyspaceId, key: &[u8], op: Operation)
        -> impl Future<Output = Result<ApplyResult, CloudataError>> + Send;

    /// Delete the value at `(keyspace, key)` and report whether there was one.
    ///
    /// Presence is decided under the same latch as the removal, so of two
    /// concurrent removes of one key only one sees `true`. An absent key is
    /// left alone and nothing is logged.
    fn remove(&self, keyspace: KeyspaceId, key: &[u8])
        -> impl Future<Output = Result<bool, CloudataError>> + Send;

    fn get(&self, keyspace: KeyspaceId, key: &[u8])
        -> impl Future<Output = Result<Option<Value>, CloudataError>> + Send;

    /// Idempotent; allocates a new ID only for an unseen name.
    fn register_keyspace(&self, name: &str)
        -> impl Future<Output = Result<KeyspaceId, CloudataError>> + Send;

    /// Lock-free lookup. Never allocates.
    fn resolve_keyspace(&self, name: &str) -> Result<KeyspaceId, CloudataError>;
}
