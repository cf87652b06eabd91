//! Per-connection session state.
//!
//! A connection starts with an empty [`SessionSlot`]. The first command to
//! need a session builds one and publishes it with a single
//! compare-and-swap; anyone who raced it drops their own candidate and uses
//! the published one. Building a `Session` only allocates, so a discarded
//! candidate is never observed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use uuid::Uuid;

use cloudata_types::KeyspaceId;

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    user: Mutex<Option<String>>,
    keyspace: AtomicU32,
}

impl Session {
    pub fn new(default_keyspace: KeyspaceId) -> Self {
        Session {
            id: Uuid::new_v4(),
            user: Mutex::new(None),
            keyspace: AtomicU32::new(default_keyspace.0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Login bound by a successful `AUTH`, if any.
    pub fn user(&self) -> Option<String> {
        self.user.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.lock().is_some()
    }

    pub fn authenticate(&self, login: &str) {
        *self.user.lock() = Some(login.to_string());
    }

    pub fn keyspace(&self) -> KeyspaceId {
        KeyspaceId(self.keyspace.load(Ordering::Acquire))
    }

    pub fn select(&self, keyspace: KeyspaceId) {
        self.keyspace.store(keyspace.0, Ordering::Release);
    }
}

/// Holds at most one [`Session`], set once and never replaced.
#[derive(Default)]
pub struct SessionSlot {
    slot: ArcSwapOption<Session>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<Session>> {
        self.slot.load_full()
    }

    /// Return the attached session, attaching one built by `make` if the slot
    /// is empty. Never blocks.
    pub fn get_or_create(&self, make: impl FnOnce() -> Session) -> Arc<Session> {
        if let Some(existing) = self.slot.load_full() {
            return existing;
        }
        let candidate = Arc::new(make());
        let previous = self.slot.compare_and_swap(&None::<Arc<Session>>, Some(candidate.clone()));
        match &*previous {
            Some(winner) => winner.clone(),
            None => candidate,
        }
    }
}

/// One client connection. Dropping it drops its session.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    slot: SessionSlot,
}

impl Connection {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Connection { id, peer, slot: SessionSlot::new() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session(&self, default_keyspace: KeyspaceId) -> Arc<Session> {
        self.slot.get_or_create(|| Session::new(default_keyspace))
    }

    pub fn existing_session(&self) -> Option<Arc<Session>> {
        self.slot.get()
    }
}
