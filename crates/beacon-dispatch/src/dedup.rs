//! Event deduplication
//!
//! Local memory of already-handled event identifiers. The store delivers
//! the same record many times (echoes of our own writes, full-collection
//! re-deliveries, stale notifications); the guard decides which delivery
//! gets to trigger a new user-visible action. It is purely per-process
//! state, reset on restart, and acts as a lightweight mutex substitute for
//! the listener-driven controllers.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct GuardInner<K> {
    handled: HashSet<K>,
    releases: HashMap<K, JoinHandle<()>>,
}

/// Handled-id set with delayed release.
///
/// For any id, [`should_present`](DedupGuard::should_present) returns true
/// at most once between an insertion and the matching scheduled release
/// firing, no matter how many redundant deliveries occur in between.
#[derive(Clone)]
pub struct DedupGuard<K: Eq + Hash + Clone + Send + 'static> {
    inner: Arc<Mutex<GuardInner<K>>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> DedupGuard<K> {
    /// Create an empty guard
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GuardInner {
                handled: HashSet::new(),
                releases: HashMap::new(),
            })),
        }
    }

    /// Whether this delivery should trigger a new user-visible action.
    ///
    /// True exactly once per entry of `id` into the handled set; every
    /// further call returns false until a scheduled release removes it.
    pub fn should_present(&self, id: K) -> bool {
        self.inner.lock().handled.insert(id)
    }

    /// Whether `id` is currently in the handled set
    pub fn is_handled(&self, id: &K) -> bool {
        self.inner.lock().handled.contains(id)
    }

    /// Schedule removal of `id` from the handled set after `after`.
    ///
    /// Replaces any earlier pending release for the same id. The delay
    /// exists because a terminal write and the store's echo of it each
    /// trigger the handler; releasing immediately would let a late stale
    /// actionable delivery re-open a decision UI that just closed.
    pub fn release(&self, id: K, after: Duration) {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.releases.remove(&id) {
            pending.abort();
        }
        let shared = Arc::clone(&self.inner);
        let key = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut inner = shared.lock();
            inner.handled.remove(&key);
            inner.releases.remove(&key);
        });
        inner.releases.insert(id, task);
    }

    /// Abort every scheduled release and forget all handled ids.
    ///
    /// Called on controller teardown so no release task outlives the
    /// session that created it.
    pub fn cancel_pending(&self) {
        let mut inner = self.inner.lock();
        for (_, task) in inner.releases.drain() {
            task.abort();
        }
        inner.handled.clear();
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Default for DedupGuard<K> {
    fn default() -> Self {
        Self::new()
    }
}
