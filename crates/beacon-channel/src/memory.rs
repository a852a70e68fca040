//! In-memory record store
//!
//! Process-local implementation of [`RecordChannel`] with the same delivery
//! semantics as the shared store: subscribers get the full current value of
//! their path immediately and on every write affecting it, including their
//! own writes, with no exactly-once guarantee. Used by tests and local
//! simulation.
//!
//! Records live in one JSON tree keyed by path segments. A write at a path
//! notifies every subscription whose path is an ancestor or descendant of
//! the written path, re-sending unchanged values where the write did not
//! actually alter the subscriber's view; that redundancy is deliberate, it
//! is what the dedup layer upstream has to absorb.

use crate::channel::{RecordChannel, RecordHandler, SubscriptionHandle};
use async_trait::async_trait;
use beacon_core::{DispatchError, DispatchResult, RecordPath};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct Subscription {
    id: u64,
    path: RecordPath,
    tx: mpsc::UnboundedSender<Option<Value>>,
    closed: Arc<AtomicBool>,
}

struct Inner {
    tree: Value,
    subscriptions: Vec<Subscription>,
}

/// In-memory implementation of [`RecordChannel`].
///
/// Cheap to clone via `Arc`; all state is shared.
pub struct InMemoryRecordStore {
    inner: Mutex<Inner>,
    next_subscription_id: AtomicU64,
    write_faults: AtomicUsize,
}

impl InMemoryRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tree: Value::Object(Map::new()),
                subscriptions: Vec::new(),
            }),
            next_subscription_id: AtomicU64::new(1),
            write_faults: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` write/remove operations fail with a transient
    /// network error, without mutating the tree. For failure-path tests.
    pub fn fail_next_writes(&self, count: usize) {
        self.write_faults.store(count, Ordering::SeqCst);
    }

    fn take_fault(&self) -> bool {
        self.write_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Notify every live subscription affected by a change at `written`.
    /// Sends while the lock is held so deliveries for one path stay in
    /// write order.
    fn notify(inner: &mut Inner, written: &RecordPath) {
        inner
            .subscriptions
            .retain(|sub| !sub.closed.load(Ordering::SeqCst));
        for sub in &inner.subscriptions {
            if sub.path.is_affected_by(written) {
                let value = value_at(&inner.tree, &sub.path.segments());
                // A full queue is impossible (unbounded); a closed receiver
                // just means the forwarding task is gone.
                let _ = sub.tx.send(value);
            }
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordChannel for InMemoryRecordStore {
    async fn read(&self, path: &RecordPath) -> DispatchResult<Option<Value>> {
        let inner = self.inner.lock();
        Ok(value_at(&inner.tree, &path.segments()))
    }

    async fn write(&self, path: &RecordPath, value: Value) -> DispatchResult<()> {
        if self.take_fault() {
            debug!(path = %path, "injected write fault");
            return Err(DispatchError::network("simulated write failure"));
        }
        let mut inner = self.inner.lock();
        set_at(&mut inner.tree, &path.segments(), value);
        debug!(path = %path, "record written");
        Self::notify(&mut inner, path);
        Ok(())
    }

    async fn remove(&self, path: &RecordPath) -> DispatchResult<()> {
        if self.take_fault() {
            debug!(path = %path, "injected remove fault");
            return Err(DispatchError::network("simulated remove failure"));
        }
        let mut inner = self.inner.lock();
        remove_at(&mut inner.tree, &path.segments());
        debug!(path = %path, "record removed");
        Self::notify(&mut inner, path);
        Ok(())
    }

    async fn subscribe(
        &self,
        path: &RecordPath,
        handler: RecordHandler,
    ) -> DispatchResult<SubscriptionHandle> {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let mut inner = self.inner.lock();
            let current = value_at(&inner.tree, &path.segments());
            let sub = Subscription {
                id,
                path: path.clone(),
                tx,
                closed: Arc::clone(&closed),
            };
            // Initial delivery goes through the same queue as later writes
            // so it is always observed first.
            let _ = sub.tx.send(current);
            inner.subscriptions.push(sub);
        }
        debug!(path = %path, subscription = id, "subscribed");

        let task_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                if task_closed.load(Ordering::SeqCst) {
                    break;
                }
                handler(value).await;
            }
        });

        Ok(SubscriptionHandle { id, closed })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.subscriptions.retain(|sub| sub.id != handle.id);
        debug!(subscription = handle.id, "unsubscribed");
    }
}

// =============================================================================
// Tree operations
// =============================================================================

fn value_at(node: &Value, segments: &[String]) -> Option<Value> {
    let mut current = node;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current.clone())
    }
}

fn set_at(node: &mut Value, segments: &[String], value: Value) {
    match segments {
        [] => *node = value,
        [head, rest @ ..] => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let map = node.as_object_mut().expect("object ensured above");
            let child = map.entry(head.clone()).or_insert(Value::Null);
            set_at(child, rest, value);
        }
    }
}

/// Remove the record at `segments`, pruning parents left empty so absence
/// reads back as `None` rather than an empty object.
fn remove_at(node: &mut Value, segments: &[String]) {
    let Value::Object(map) = node else {
        return;
    };
    match segments {
        [] => {}
        [only] => {
            map.remove(only);
        }
        [head, rest @ ..] => {
            if let Some(child) = map.get_mut(head) {
                remove_at(child, rest);
                if matches!(child, Value::Object(m) if m.is_empty()) {
                    map.remove(head);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use beacon_core::{CallId, PartyId};
    use serde_json::json;
    use std::time::Duration;

    type Deliveries = Arc<Mutex<Vec<Option<Value>>>>;

    fn recording_handler() -> (RecordHandler, Deliveries) {
        let seen: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: RecordHandler = Arc::new(move |value| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().push(value);
            })
        });
        (handler, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_receives_current_value_immediately() {
        let store = InMemoryRecordStore::new();
        let path = RecordPath::ResponderAvailability(PartyId::new());
        store.write(&path, json!({"availability": "available"})).await.unwrap();

        let (handler, seen) = recording_handler();
        store.subscribe(&path, handler).await.unwrap();
        settle().await;

        let deliveries = seen.lock();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0], Some(json!({"availability": "available"})));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_path_delivers_none_first() {
        let store = InMemoryRecordStore::new();
        let path = RecordPath::ResponderAssignment(PartyId::new());

        let (handler, seen) = recording_handler();
        store.subscribe(&path, handler).await.unwrap();
        settle().await;

        assert_eq!(seen.lock().as_slice(), &[None]);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_observes_echo_of_its_own_write() {
        let store = InMemoryRecordStore::new();
        let path = RecordPath::ResponderAvailability(PartyId::new());

        let (handler, seen) = recording_handler();
        store.subscribe(&path, handler).await.unwrap();
        store.write(&path, json!({"availability": "dispatched"})).await.unwrap();
        settle().await;

        let deliveries = seen.lock();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[1], Some(json!({"availability": "dispatched"})));
    }

    #[tokio::test(start_paused = true)]
    async fn child_write_notifies_collection_subscriber() {
        let store = InMemoryRecordStore::new();
        let call_id = CallId::new();

        let (handler, seen) = recording_handler();
        store.subscribe(&RecordPath::Calls, handler).await.unwrap();
        store
            .write(&RecordPath::Call(call_id), json!({"status": "ringing"}))
            .await
            .unwrap();
        settle().await;

        let deliveries = seen.lock();
        assert_eq!(deliveries.len(), 2);
        let map = deliveries[1].as_ref().unwrap().as_object().unwrap();
        assert!(map.contains_key(&call_id.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn removal_delivers_absence() {
        let store = InMemoryRecordStore::new();
        let responder = PartyId::new();
        let path = RecordPath::ResponderAssignment(responder);
        store.write(&path, json!({"report_id": "RPT-1"})).await.unwrap();

        let (handler, seen) = recording_handler();
        store.subscribe(&path, handler).await.unwrap();
        store.remove(&path).await.unwrap();
        settle().await;

        let deliveries = seen.lock();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[1], None);
        drop(deliveries);
        assert_eq!(store.read(&path).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_stops_delivery() {
        let store = InMemoryRecordStore::new();
        let path = RecordPath::ResponderAvailability(PartyId::new());

        let (handler, seen) = recording_handler();
        let handle = store.subscribe(&path, handler).await.unwrap();
        settle().await;
        store.unsubscribe(&handle);
        store.write(&path, json!({"availability": "available"})).await.unwrap();
        settle().await;

        assert_eq!(seen.lock().len(), 1);
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_from_inside_the_handler_is_safe() {
        let store = Arc::new(InMemoryRecordStore::new());
        let path = RecordPath::ResponderAvailability(PartyId::new());

        let (handle_slot_handler, seen) = {
            let seen: Deliveries = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let store_ref = Arc::clone(&store);
            let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
            let slot_ref = Arc::clone(&slot);
            let handler: RecordHandler = Arc::new(move |value| {
                let sink = Arc::clone(&sink);
                let store_ref = Arc::clone(&store_ref);
                let slot_ref = Arc::clone(&slot_ref);
                Box::pin(async move {
                    sink.lock().push(value);
                    // Tear down on first delivery, from inside the handler.
                    if let Some(handle) = slot_ref.lock().take() {
                        store_ref.unsubscribe(&handle);
                    }
                })
            });
            ((handler, slot), seen)
        };
        let (handler, slot) = handle_slot_handler;

        let handle = store.subscribe(&path, handler).await.unwrap();
        *slot.lock() = Some(handle);
        store.write(&path, json!({"availability": "available"})).await.unwrap();
        store.write(&path, json!({"availability": "dispatched"})).await.unwrap();
        settle().await;

        // Only the initial delivery ran; the two writes after teardown were
        // never handled.
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_fault_fails_the_write_without_mutating() {
        let store = InMemoryRecordStore::new();
        let path = RecordPath::ResponderAvailability(PartyId::new());
        store.fail_next_writes(1);

        let result = store.write(&path, json!({"availability": "available"})).await;
        assert_matches!(result, Err(DispatchError::Network { .. }));
        assert_eq!(store.read(&path).await.unwrap(), None);

        // The fault was consumed; the retry succeeds.
        store.write(&path, json!({"availability": "available"})).await.unwrap();
        assert!(store.read(&path).await.unwrap().is_some());
    }
}
