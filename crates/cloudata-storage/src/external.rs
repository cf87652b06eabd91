//! Interfaces to collaborators outside the storage core.
//!
//! The object store holds git blobs. Record stores and the SQL connector see
//! keyspaces through [`DataStore`] and [`TableCatalog`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use cloudata_types::{CloudataError, KeyspaceId};

use crate::registry::user_keyspace_name;
use crate::traits::{Backend, OperationStore};
use crate::Engine;

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

/// Content-addressed blob storage.
pub trait ObjectStore: Send + Sync + 'static {
    fn get(&self, key: &str)
        -> impl Future<Output = Result<Option<Vec<u8>>, CloudataError>> + Send;

    fn put(&self, key: &str, bytes: Vec<u8>)
        -> impl Future<Output = Result<(), CloudataError>> + Send;
}

/// Where the object store lives. Only `s3://bucket[/prefix]` is supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreLocation {
    S3 { bucket: String, prefix: String },
}

impl ObjectStoreLocation {
    pub fn parse(uri: &str) -> Result<Self, CloudataError> {
        if uri.trim().is_empty() {
            return Err(CloudataError::Config("object store URI is not set".into()));
        }
        let parsed = url::Url::parse(uri)
            .map_err(|e| CloudataError::Config(format!("invalid object store URI '{uri}': {e}")))?;
        match parsed.scheme() {
            "s3" => {
                let bucket = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
                    CloudataError::Config(format!("object store URI '{uri}' has no bucket"))
                })?;
                Ok(ObjectStoreLocation::S3 {
                    bucket: bucket.to_string(),
                    prefix: parsed.path().trim_start_matches('/').to_string(),
                })
            }
            other => Err(CloudataError::Config(format!("unknown object store scheme: {other}"))),
        }
    }
}

/// In-memory `ObjectStore`. Intended for unit tests.
#[derive(Default)]
pub struct MemObjectStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CloudataError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CloudataError> {
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DataStore
// ---------------------------------------------------------------------------

/// A record type and the secondary indices kept for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMapping {
    pub record: String,
    pub indices: Vec<String>,
}

impl RecordMapping {
    pub fn new(record: impl Into<String>) -> Self {
        RecordMapping { record: record.into(), indices: Vec::new() }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.indices.push(index.into());
        self
    }

    /// Keyspace name holding the entries of one index.
    pub fn index_keyspace_name(&self, index: &str) -> String {
        format!("{}#{}", self.record, index)
    }
}

/// Typed-record storage that needs its keyspaces registered before first use.
pub trait DataStore: Send + Sync + 'static {
    /// Register the record's keyspace and one keyspace per index. Idempotent.
    fn add_mappings(&self, mapping: &RecordMapping)
        -> impl Future<Output = Result<(), CloudataError>> + Send;

    fn find_keyspace_id(&self, name: &str) -> Option<KeyspaceId>;
}

impl<B: Backend> DataStore for Engine<B> {
    async fn add_mappings(&self, mapping: &RecordMapping) -> Result<(), CloudataError> {
        self.register_keyspace(&mapping.record).await?;
        for index in &mapping.indices {
            self.register_keyspace(&mapping.index_keyspace_name(index)).await?;
        }
        tracing::debug!(record = %mapping.record, indices = mapping.indices.len(), "mappings added");
        Ok(())
    }

    fn find_keyspace_id(&self, name: &str) -> Option<KeyspaceId> {
        self.resolve_keyspace(name).ok()
    }
}

// ---------------------------------------------------------------------------
// Connector metadata
// ---------------------------------------------------------------------------

pub const DEFAULT_SCHEMA: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Varbinary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnHandle {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub ordinal: usize,
}

/// Every table exposes the same two columns: the key bytes and the value bytes.
pub const KV_COLUMNS: [ColumnHandle; 2] = [
    ColumnHandle { name: "key", column_type: ColumnType::Varbinary, ordinal: 0 },
    ColumnHandle { name: "value", column_type: ColumnType::Varbinary, ordinal: 1 },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub connector_id: String,
    pub schema: String,
    pub table: String,
    pub keyspace: KeyspaceId,
}

/// Read-only view of user keyspaces as SQL tables, consumed by the SQL
/// connector.
pub struct TableCatalog<S> {
    connector_id: String,
    store: Arc<S>,
}

impl<S: OperationStore> TableCatalog<S> {
    pub fn new(connector_id: impl Into<String>, store: Arc<S>) -> Self {
        TableCatalog { connector_id: connector_id.into(), store }
    }

    pub fn list_schema_names(&self) -> Vec<String> {
        vec![DEFAULT_SCHEMA.to_string()]
    }

    /// `None` for an unknown schema or a table with no keyspace behind it.
    pub fn table_handle(&self, schema: &str, table: &str) -> Option<TableHandle> {
        if schema != DEFAULT_SCHEMA {
            return None;
        }
        let keyspace = self.store.resolve_keyspace(&user_keyspace_name(table)).ok()?;
        Some(TableHandle {
            connector_id: self.connector_id.clone(),
            schema: schema.to_string(),
            table: table.to_string(),
            keyspace,
        })
    }

    pub fn can_handle(&self, handle: &TableHandle) -> bool {
        handle.connector_id == self.connector_id
    }

    pub fn column_handles(&self, handle: &TableHandle) -> Result<Vec<ColumnHandle>, CloudataError> {
        if !self.can_handle(handle) {
            return Err(CloudataError::InvalidArgument(format!(
                "table handle belongs to connector '{}'",
                handle.connector_id
            )));
        }
        Ok(KV_COLUMNS.to_vec())
    }

    pub fn column_handle(
        &self,
        handle: &TableHandle,
        column: &str,
    ) -> Result<Option<ColumnHandle>, CloudataError> {
        Ok(self.column_handles(handle)?.into_iter().find(|c| c.name == column))
    }
}
