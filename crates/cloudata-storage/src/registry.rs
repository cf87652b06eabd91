//! Name → ID table for keyspaces.
//!
//! Lookups read two insert-only concurrent maps and never lock. Allocating an
//! ID for an unseen name is the one serialized path: the allocator mutex is
//! held while the forward mapping, the reverse mapping and the new high-water
//! mark are committed in a single backend batch, and only then are the maps
//! updated. IDs are never handed out twice, even after a restart, because the
//! high-water mark is persisted with every allocation.
//!
//! On open the name index is loaded from the forward records and the ID index
//! from the reverse records. The two are written together, so any
//! disagreement between them is reported as corruption.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use cloudata_types::{CloudataError, KeyspaceId};

use crate::keys::{
    meta_key, registry_id_key, registry_name_key, REGISTRY_ID_PREFIX, REGISTRY_NAME_PREFIX,
};
use crate::traits::Backend;
use crate::types::{KeyspaceRecord, Partition, WriteBatch};

pub const SYSTEM_KEYSPACE_NAME: &str = "system";

const NEXT_ID_LABEL: &str = "next_keyspace_id";

/// Keyspace name under which a user table's rows are stored.
pub fn user_keyspace_name(table: &str) -> String {
    format!("user:{table}")
}

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, CloudataError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| CloudataError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, CloudataError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| CloudataError::Storage(e.to_string()))
}

fn corrupt(detail: &str) -> CloudataError {
    CloudataError::Storage(format!("keyspace registry is inconsistent: {detail}"))
}

pub struct KeyspaceRegistry<B> {
    backend: Arc<B>,
    by_name: DashMap<String, KeyspaceId>,
    by_id: DashMap<KeyspaceId, String>,
    /// Next ID to hand out. Held for the whole allocation.
    next_id: Mutex<u32>,
}

impl<B: Backend> KeyspaceRegistry<B> {
    /// Load the table from `backend`, writing the reserved `"system"` entry on
    /// first use.
    pub fn open(backend: Arc<B>) -> Result<Self, CloudataError> {
        let by_name = DashMap::new();
        let by_id = DashMap::new();
        let mut max_seen = 0u32;

        for (_, raw) in backend.scan_prefix(Partition::Registry, REGISTRY_ID_PREFIX)? {
            let record: KeyspaceRecord = decode(&raw)?;
            max_seen = max_seen.max(record.id.0);
            by_id.insert(record.id, record.name);
        }
        for (key, raw) in backend.scan_prefix(Partition::Registry, REGISTRY_NAME_PREFIX)? {
            let name = std::str::from_utf8(&key[REGISTRY_NAME_PREFIX.len()..])
                .map_err(|_| corrupt("keyspace name is not utf-8"))?
                .to_string();
            let id: KeyspaceId = decode(&raw)?;
            if by_id.get(&id).map(|n| *n == name) != Some(true) {
                return Err(corrupt(&format!("name '{name}' maps to {id:?} with no matching record")));
            }
            by_name.insert(name, id);
        }
        if by_name.len() != by_id.len() {
            return Err(corrupt("keyspace record without a name entry"));
        }

        let persisted_next = match backend.get(Partition::Meta, &meta_key(NEXT_ID_LABEL))? {
            Some(raw) => decode::<u32>(&raw)?,
            None => 1,
        };
        let next_id = persisted_next.max(max_seen.saturating_add(1)).max(1);

        if !by_id.contains_key(&KeyspaceId::SYSTEM) {
            let record =
                KeyspaceRecord { id: KeyspaceId::SYSTEM, name: SYSTEM_KEYSPACE_NAME.to_string() };
            let mut batch = WriteBatch::new();
            batch.insert(
                Partition::Registry,
                registry_name_key(SYSTEM_KEYSPACE_NAME),
                encode(&KeyspaceId::SYSTEM)?,
            );
            batch.insert(Partition::Registry, registry_id_key(KeyspaceId::SYSTEM), encode(&record)?);
            batch.insert(Partition::Meta, meta_key(NEXT_ID_LABEL), encode(&next_id)?);
            backend.commit(batch)?;
            by_name.insert(record.name.clone(), record.id);
            by_id.insert(record.id, record.name);
            tracing::info!("initialised keyspace registry");
        }

        Ok(KeyspaceRegistry { backend, by_name, by_id, next_id: Mutex::new(next_id) })
    }

    /// Return the ID for `name`, allocating one if the name is new.
    pub fn register(&self, name: &str) -> Result<KeyspaceId, CloudataError> {
        if name.is_empty() {
            return Err(CloudataError::InvalidArgument("keyspace name must not be empty".into()));
        }
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }

        let mut next = self.next_id.lock();
        // Another caller may have allocated it while we waited.
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }

        let id = KeyspaceId(*next);
        let following = next
            .checked_add(1)
            .ok_or_else(|| CloudataError::Storage("keyspace ids exhausted".into()))?;
        let record = KeyspaceRecord { id, name: name.to_string() };

        let mut batch = WriteBatch::new();
        batch.insert(Partition::Registry, registry_name_key(name), encode(&id)?);
        batch.insert(Partition::Registry, registry_id_key(id), encode(&record)?);
        batch.insert(Partition::Meta, meta_key(NEXT_ID_LABEL), encode(&following)?);
        self.backend.commit(batch)?;

        *next = following;
        self.by_id.insert(id, record.name);
        self.by_name.insert(name.to_string(), id);
        tracing::info!(keyspace = name, id = id.0, "registered keyspace");
        Ok(id)
    }

    pub fn resolve(&self, name: &str) -> Result<KeyspaceId, CloudataError> {
        self.by_name
            .get(name)
            .map(|id| *id)
            .ok_or_else(|| CloudataError::KeyspaceNotFound(name.to_string()))
    }

    pub fn id_to_name(&self, id: KeyspaceId) -> Result<String, CloudataError> {
        self.by_id
            .get(&id)
            .map(|name| name.clone())
            .ok_or(CloudataError::KeyspaceIdNotFound(id))
    }

    pub fn contains(&self, id: KeyspaceId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Every registered keyspace, ordered by ID.
    pub fn list(&self) -> Vec<(KeyspaceId, String)> {
        let mut all: Vec<(KeyspaceId, String)> =
            self.by_id.iter().map(|e| (*e.key(), e.value().clone())).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::fjall::FjallBackend;
    use crate::mem::MemBackend;

    #[test]
    fn system_keyspace_is_preregistered() {
        let reg = KeyspaceRegistry::open(Arc::new(MemBackend::new())).unwrap();
        assert_eq!(reg.resolve("system").unwrap(), KeyspaceId::SYSTEM);
        assert_eq!(reg.id_to_name(KeyspaceId::SYSTEM).unwrap(), "system");
        assert_eq!(reg.register("system").unwrap(), KeyspaceId::SYSTEM);
    }

    #[test]
    fn register_is_idempotent_and_monotonic() {
        let reg = KeyspaceRegistry::open(Arc::new(MemBackend::new())).unwrap();
        let auth = reg.register("auth").unwrap();
        assert_eq!(auth, KeyspaceId(1));
        assert_eq!(reg.register("auth").unwrap(), auth);

        let refs = reg.register("gitrefs").unwrap();
        assert_eq!(refs, KeyspaceId(2));
        assert_eq!(reg.id_to_name(refs).unwrap(), "gitrefs");
        assert_eq!(
            reg.list(),
            vec![
                (KeyspaceId(0), "system".to_string()),
                (KeyspaceId(1), "auth".to_string()),
                (KeyspaceId(2), "gitrefs".to_string()),
            ]
        );
    }

    #[test]
    fn unknown_names_and_ids() {
        let reg = KeyspaceRegistry::open(Arc::new(MemBackend::new())).unwrap();
        assert!(matches!(reg.resolve("nope"), Err(CloudataError::KeyspaceNotFound(_))));
        assert!(matches!(
            reg.id_to_name(KeyspaceId(99)),
            Err(CloudataError::KeyspaceIdNotFound(KeyspaceId(99)))
        ));
        assert!(matches!(reg.register(""), Err(CloudataError::InvalidArgument(_))));
    }

    #[test]
    fn concurrent_register_allocates_once() {
        let reg = Arc::new(KeyspaceRegistry::open(Arc::new(MemBackend::new())).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                thread::spawn(move || reg.register("queue").unwrap())
            })
            .collect();
        let ids: Vec<KeyspaceId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        // Exactly one allocation happened: the next new name gets the next ID.
        assert_eq!(reg.register("other").unwrap(), KeyspaceId(ids[0].0 + 1));
    }

    #[test]
    fn concurrent_distinct_names_get_distinct_ids() {
        let reg = Arc::new(KeyspaceRegistry::open(Arc::new(MemBackend::new())).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let reg = reg.clone();
                thread::spawn(move || reg.register(&format!("ks{i}")).unwrap())
            })
            .collect();
        let mut ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap().0).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=16).collect::<Vec<u32>>());
    }

    #[test]
    fn failed_allocation_is_not_published() {
        let backend = Arc::new(MemBackend::new());
        let reg = KeyspaceRegistry::open(backend.clone()).unwrap();

        backend.fail_next_commit();
        assert!(reg.register("lost").is_err());
        assert!(reg.resolve("lost").is_err());
        // The failed attempt did not consume an ID.
        assert_eq!(reg.register("lost").unwrap(), KeyspaceId(1));
    }

    #[test]
    fn ids_survive_restart_and_are_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = KeyspaceRegistry::open(FjallBackend::open(dir.path()).unwrap()).unwrap();
            assert_eq!(reg.register("auth").unwrap(), KeyspaceId(1));
            assert_eq!(reg.register("mq").unwrap(), KeyspaceId(2));
        }
        let reg = KeyspaceRegistry::open(FjallBackend::open(dir.path()).unwrap()).unwrap();
        assert_eq!(reg.resolve("auth").unwrap(), KeyspaceId(1));
        assert_eq!(reg.resolve("mq").unwrap(), KeyspaceId(2));
        assert_eq!(reg.register("files").unwrap(), KeyspaceId(3));
    }

    #[test]
    fn reopen_loads_names_from_forward_records() {
        let backend = Arc::new(MemBackend::new());
        {
            let reg = KeyspaceRegistry::open(backend.clone()).unwrap();
            reg.register("auth").unwrap();
            reg.register("gitrefs").unwrap();
        }
        // One forward and one reverse record per keyspace, system included.
        assert_eq!(backend.len(Partition::Registry), 6);

        let reg = KeyspaceRegistry::open(backend.clone()).unwrap();
        assert_eq!(reg.resolve("gitrefs").unwrap(), KeyspaceId(2));
        assert_eq!(reg.id_to_name(KeyspaceId(1)).unwrap(), "auth");
    }

    #[test]
    fn mismatched_records_fail_to_open() {
        let backend = Arc::new(MemBackend::new());
        KeyspaceRegistry::open(backend.clone()).unwrap().register("auth").unwrap();

        // A forward entry pointing at an ID with no record.
        let mut batch = WriteBatch::new();
        batch.insert(Partition::Registry, registry_name_key("ghost"), encode(&KeyspaceId(9)).unwrap());
        backend.commit(batch).unwrap();
        assert!(matches!(KeyspaceRegistry::open(backend.clone()), Err(CloudataError::Storage(_))));

        // A record whose forward entry is missing.
        let mut batch = WriteBatch::new();
        batch.remove(Partition::Registry, registry_name_key("ghost"));
        batch.remove(Partition::Registry, registry_name_key("auth"));
        backend.commit(batch).unwrap();
        assert!(matches!(KeyspaceRegistry::open(backend), Err(CloudataError::Storage(_))));
    }

    #[test]
    fn user_table_names() {
        assert_eq!(user_keyspace_name("orders"), "user:orders");
    }
}
