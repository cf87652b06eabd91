use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LatchMap = DashMap<Vec<u8>, Arc<Mutex<()>>>;

/// One async mutex per physical key, created on demand and dropped once
/// nobody holds or waits on it.
///
/// Two callers on the same key serialize; callers on different keys never
/// share a mutex. Waiting happens on the async side and parks no thread, so
/// a queue on one key cannot hold up work on another. A latch is cloned out
/// of the map and removed from it only under the map's shard lock, so a
/// waiter can never be left holding a mutex that a newcomer does not also see.
#[derive(Default)]
pub struct KeyLatches {
    latches: Arc<LatchMap>,
}

/// Held latch. Owns everything it needs, so it can move into a blocking task.
pub struct LatchGuard {
    latches: Arc<LatchMap>,
    key: Vec<u8>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the latch for `key` is held.
    pub async fn lock(&self, key: Vec<u8>) -> LatchGuard {
        let latch = self.latches.entry(key.clone()).or_default().clone();
        let guard = latch.lock_owned().await;
        LatchGuard { latches: self.latches.clone(), key, guard: Some(guard) }
    }

    /// Number of keys with a live latch.
    pub fn active(&self) -> usize {
        self.latches.len()
    }
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: no holder, no waiter.
        self.latches.remove_if(&self.key, |_, latch| Arc::strong_count(latch) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn latch_is_released_and_forgotten() {
        let latches = KeyLatches::new();
        {
            let _g = latches.lock(b"k".to_vec()).await;
            assert_eq!(latches.active(), 1);
        }
        assert_eq!(latches.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_exclusive() {
        let latches = Arc::new(KeyLatches::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latches = latches.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let _g = latches.lock(b"hot".to_vec()).await;
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(latches.active(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let latches = KeyLatches::new();
        let _held = latches.lock(b"a".to_vec()).await;

        let other = tokio::time::timeout(Duration::from_secs(1), latches.lock(b"b".to_vec()))
            .await
            .expect("latch on another key must not wait");
        assert_eq!(latches.active(), 2);
        drop(other);
        assert_eq!(latches.active(), 1);
    }

    #[tokio::test]
    async fn guard_can_be_released_on_a_blocking_thread() {
        let latches = KeyLatches::new();
        let guard = latches.lock(b"k".to_vec()).await;
        tokio::task::spawn_blocking(move || drop(guard)).await.unwrap();
        assert_eq!(latches.active(), 0);
        let _again = latches.lock(b"k".to_vec()).await;
    }
}
