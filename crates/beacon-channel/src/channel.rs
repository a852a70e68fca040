//! The record channel contract
//!
//! Controllers never touch the store directly; they consume this trait.
//! Writes are best-effort and may fail transiently, and no transactionality
//! exists across paths — a controller that touches two paths must tolerate
//! observing one write before the other.

use async_trait::async_trait;
use beacon_core::{DispatchError, DispatchResult, RecordPath};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Subscription callback.
///
/// Invoked once immediately with the current value at the path (`None` when
/// absent), then again on every subsequent write affecting the path.
/// Invocations for one subscription are processed in order by a single
/// forwarding task, which preserves the store's per-path write-order
/// guarantee. Handlers must be idempotent against redundant invocations.
pub type RecordHandler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle identifying one live subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) closed: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    /// Whether the subscription has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Read/write/subscribe access to the shared broadcast store.
#[async_trait]
pub trait RecordChannel: Send + Sync {
    /// Current value at `path`, or `None` when absent.
    async fn read(&self, path: &RecordPath) -> DispatchResult<Option<Value>>;

    /// Write `value` at `path`. Best-effort; a transient failure is
    /// reported as [`DispatchError::Network`] and may be retried by the
    /// caller. Notifies every subscriber whose path is affected.
    async fn write(&self, path: &RecordPath, value: Value) -> DispatchResult<()>;

    /// Remove the record at `path` (tombstone-free clear); absence is the
    /// terminal signal for subscribers.
    async fn remove(&self, path: &RecordPath) -> DispatchResult<()>;

    /// Register `handler` for `path`. Delivers the current value
    /// immediately, then every subsequent change. Setup failure is fatal to
    /// the subscribing controller instance.
    async fn subscribe(
        &self,
        path: &RecordPath,
        handler: RecordHandler,
    ) -> DispatchResult<SubscriptionHandle>;

    /// Stop delivery for `handle`. Safe to call from within the
    /// subscription's own handler; once it returns, no new handler
    /// invocation starts.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

/// Decode a raw store value into a typed record.
///
/// `None` passes through (the record is absent); a present value that fails
/// to deserialize surfaces as [`DispatchError::Decode`] naming the path, so
/// malformed or partially-written records are caught at the boundary.
pub fn decode_record<T: DeserializeOwned>(
    path: &RecordPath,
    value: Option<&Value>,
) -> DispatchResult<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| DispatchError::decode(path.to_string(), e.to_string())),
    }
}

/// Encode a typed record into the raw store representation.
pub fn encode_record<T: serde::Serialize>(record: &T) -> DispatchResult<Value> {
    serde_json::to_value(record).map_err(|e| DispatchError::internal(e.to_string()))
}
