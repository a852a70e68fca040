//! Call signaling controller
//!
//! Routes an emergency voice call request from caller to callee over the
//! broadcast store. Per call the state machine is
//! `Idle → Ringing → { Answered → Ended | Ended | Rejected | Missed }`, and
//! at most one call may be in a non-idle state for the local party at a
//! time; additional incoming rings are auto-rejected without presenting.
//!
//! The controller is state-driven by the latest observed status value, not
//! by a sequence of discrete events: a call answered by the callee and
//! immediately ended by the caller still resolves to a terminal status on
//! both sides, whatever order the deliveries arrive in.

use crate::config::SignalingConfig;
use crate::dedup::DedupGuard;
use crate::events::{MediaTransport, SignalingEvents};
use beacon_channel::{decode_record, encode_record, RecordChannel, RecordHandler, SubscriptionHandle};
use beacon_core::{
    CallId, CallRecord, CallStatus, DispatchError, DispatchResult, Party, RecordPath, ReportId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

struct CallState {
    /// Incoming call currently presented for a decision
    incoming: Option<CallRecord>,
    /// Call the local party is engaged in (outgoing ringing or answered)
    active: Option<CallRecord>,
    /// Per-call status subscriptions for tracked calls
    watches: HashMap<CallId, SubscriptionHandle>,
    collection: Option<SubscriptionHandle>,
    shut_down: bool,
}

/// Listener-driven call signaling for one authenticated party.
///
/// Owns its own [`DedupGuard`] and subscription handles; construct one per
/// session and call [`shutdown`](CallSignalingController::shutdown) on
/// logout so a late delivery cannot revive a decision UI for a party that
/// is no longer authenticated.
pub struct CallSignalingController {
    local: Party,
    channel: Arc<dyn RecordChannel>,
    media: Arc<dyn MediaTransport>,
    events: Arc<dyn SignalingEvents>,
    config: SignalingConfig,
    dedup: DedupGuard<CallId>,
    state: Mutex<CallState>,
}

impl CallSignalingController {
    /// Create a controller for `local`, not yet listening.
    pub fn new(
        local: Party,
        channel: Arc<dyn RecordChannel>,
        media: Arc<dyn MediaTransport>,
        events: Arc<dyn SignalingEvents>,
        config: SignalingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            channel,
            media,
            events,
            config,
            dedup: DedupGuard::new(),
            state: Mutex::new(CallState {
                incoming: None,
                active: None,
                watches: HashMap::new(),
                collection: None,
                shut_down: false,
            }),
        })
    }

    /// Start listening for calls addressed to the local party.
    ///
    /// A subscribe failure here is fatal to this controller instance and is
    /// returned to the caller; there is no silent not-listening state.
    pub async fn listen(self: &Arc<Self>) -> DispatchResult<()> {
        let ctrl = Arc::clone(self);
        let handler: RecordHandler = Arc::new(move |value| {
            let ctrl = Arc::clone(&ctrl);
            Box::pin(async move { ctrl.on_calls_update(value).await })
        });
        let handle = self
            .channel
            .subscribe(&RecordPath::Calls, handler)
            .await
            .map_err(|e| DispatchError::channel(format!("call listener setup failed: {e}")))?;

        let mut state = self.state.lock();
        if state.shut_down {
            drop(state);
            self.channel.unsubscribe(&handle);
            return Err(DispatchError::invalid("controller is shut down"));
        }
        state.collection = Some(handle);
        Ok(())
    }

    /// The incoming call currently awaiting a decision, if any
    pub fn current_incoming(&self) -> Option<CallRecord> {
        self.state.lock().incoming.clone()
    }

    /// The call the local party is currently engaged in, if any
    pub fn current_active(&self) -> Option<CallRecord> {
        self.state.lock().active.clone()
    }

    // =========================================================================
    // Store deliveries
    // =========================================================================

    async fn on_calls_update(self: &Arc<Self>, value: Option<Value>) {
        let Some(Value::Object(entries)) = value else {
            return;
        };
        for (entry, raw) in entries {
            let record: CallRecord = match serde_json::from_value(raw) {
                Ok(record) => record,
                Err(error) => {
                    warn!(%entry, %error, "skipping malformed call record");
                    continue;
                }
            };
            if record.status == CallStatus::Ringing {
                if record.is_addressed_to(self.local.party_id) {
                    self.handle_ringing(record).await;
                }
            } else {
                self.apply_update(record).await;
            }
        }
    }

    async fn handle_ringing(self: &Arc<Self>, record: CallRecord) {
        if !self.dedup.should_present(record.call_id) {
            return;
        }
        let busy = {
            let state = self.state.lock();
            if state.shut_down {
                return;
            }
            let other = |tracked: &CallRecord| tracked.call_id != record.call_id;
            state.active.as_ref().map(other).unwrap_or(false)
                || state.incoming.as_ref().map(other).unwrap_or(false)
        };
        if busy {
            debug!(call_id = %record.call_id, "busy, auto-rejecting incoming call");
            match encode_record(&record.with_status(CallStatus::Rejected)) {
                Ok(value) => {
                    if let Err(error) =
                        self.channel.write(&RecordPath::Call(record.call_id), value).await
                    {
                        warn!(call_id = %record.call_id, %error, "busy auto-reject write failed");
                    }
                }
                Err(error) => warn!(call_id = %record.call_id, %error, "could not encode reject"),
            }
            self.dedup.release(record.call_id, self.config.release_grace);
            return;
        }

        {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.incoming = Some(record.clone());
        }
        self.watch_call(record.call_id).await;
        debug!(call_id = %record.call_id, "presenting incoming call");
        self.events.incoming_call(&record);
    }

    /// Subscribe to a tracked call's own path for status changes.
    async fn watch_call(self: &Arc<Self>, call_id: CallId) {
        let ctrl = Arc::clone(self);
        let handler: RecordHandler = Arc::new(move |value| {
            let ctrl = Arc::clone(&ctrl);
            Box::pin(async move { ctrl.on_call_update(call_id, value).await })
        });
        match self.channel.subscribe(&RecordPath::Call(call_id), handler).await {
            Ok(handle) => {
                let stale = {
                    let mut state = self.state.lock();
                    if state.shut_down {
                        Some(handle)
                    } else {
                        state.watches.insert(call_id, handle)
                    }
                };
                if let Some(old) = stale {
                    self.channel.unsubscribe(&old);
                }
            }
            Err(error) => warn!(call_id = %call_id, %error, "failed to watch call record"),
        }
    }

    async fn on_call_update(self: &Arc<Self>, call_id: CallId, value: Option<Value>) {
        let path = RecordPath::Call(call_id);
        match decode_record::<CallRecord>(&path, value.as_ref()) {
            Ok(Some(record)) => self.apply_update(record).await,
            Ok(None) => self.handle_removed(call_id).await,
            Err(error) => warn!(path = %path, %error, "ignoring malformed call record"),
        }
    }

    /// Fold the latest observed record into local state. Idempotent: the
    /// same record may arrive through the collection subscription, the
    /// per-call watch, and echoes of our own writes.
    async fn apply_update(&self, record: CallRecord) {
        if record.status == CallStatus::Answered {
            let connected = {
                let mut state = self.state.lock();
                if let Some(active) = state.active.as_mut() {
                    if active.call_id == record.call_id {
                        let first = active.status != CallStatus::Answered;
                        *active = record.clone();
                        first
                    } else {
                        false
                    }
                } else if state
                    .incoming
                    .as_ref()
                    .is_some_and(|r| r.call_id == record.call_id)
                {
                    // Our own answer echo can land before answer() promotes
                    // the slot; promote here and let answer() observe it.
                    state.incoming = None;
                    state.active = Some(record.clone());
                    true
                } else {
                    false
                }
            };
            if connected {
                self.events.call_connected(&record);
            }
            return;
        }

        if !record.status.is_terminal() {
            return;
        }

        let (was_incoming, was_active, was_answered, watch) = {
            let mut state = self.state.lock();
            let was_incoming = state
                .incoming
                .as_ref()
                .is_some_and(|r| r.call_id == record.call_id);
            if was_incoming {
                state.incoming = None;
            }
            let tracked_active = state
                .active
                .as_ref()
                .filter(|r| r.call_id == record.call_id)
                .cloned();
            let was_active = tracked_active.is_some();
            if was_active {
                state.active = None;
            }
            let was_answered =
                tracked_active.is_some_and(|r| r.status == CallStatus::Answered);
            let watch = state.watches.remove(&record.call_id);
            (was_incoming, was_active, was_answered, watch)
        };
        if !(was_incoming || was_active) {
            return;
        }

        debug!(call_id = %record.call_id, status = %record.status, "call reached terminal status");
        if let Some(handle) = watch {
            self.channel.unsubscribe(&handle);
        }
        self.dedup.release(record.call_id, self.config.release_grace);
        if was_incoming {
            self.events.incoming_call_dismissed(record.call_id, record.status);
        }
        if was_active {
            self.events.call_ended(&record);
            if was_answered {
                if let Err(error) = self.media.hangup(record.call_id).await {
                    warn!(call_id = %record.call_id, %error, "media teardown failed");
                }
            }
        }
    }

    /// The record vanished from the store while tracked. Outside this
    /// layer's own lifecycle, but tolerated: treat it as a terminal signal.
    async fn handle_removed(&self, call_id: CallId) {
        let (was_incoming, active, watch) = {
            let mut state = self.state.lock();
            let was_incoming = state
                .incoming
                .as_ref()
                .is_some_and(|r| r.call_id == call_id);
            if was_incoming {
                state.incoming = None;
            }
            let active = state
                .active
                .as_ref()
                .filter(|r| r.call_id == call_id)
                .cloned();
            if active.is_some() {
                state.active = None;
            }
            (was_incoming, active, state.watches.remove(&call_id))
        };
        if !was_incoming && active.is_none() {
            return;
        }

        warn!(call_id = %call_id, "tracked call record disappeared");
        if let Some(handle) = watch {
            self.channel.unsubscribe(&handle);
        }
        self.dedup.release(call_id, self.config.release_grace);
        if was_incoming {
            self.events.incoming_call_dismissed(call_id, CallStatus::Missed);
        }
        if let Some(record) = active {
            let was_answered = record.status == CallStatus::Answered;
            self.events.call_ended(&record);
            if was_answered {
                if let Err(error) = self.media.hangup(call_id).await {
                    warn!(call_id = %call_id, %error, "media teardown failed");
                }
            }
        }
    }

    // =========================================================================
    // Local party actions
    // =========================================================================

    /// Place a call from the local party to `callee`.
    ///
    /// Fails when a call is already in progress; on a transient write
    /// failure no local state changes and the caller may retry.
    pub async fn initiate_call(
        self: &Arc<Self>,
        callee: Party,
        linked_report_id: Option<ReportId>,
    ) -> DispatchResult<CallRecord> {
        {
            let state = self.state.lock();
            if state.shut_down {
                return Err(DispatchError::invalid("controller is shut down"));
            }
            if state.active.is_some() || state.incoming.is_some() {
                return Err(DispatchError::invalid("a call is already in progress"));
            }
        }
        let record = CallRecord::ringing(self.local.clone(), callee, linked_report_id);
        self.channel
            .write(&RecordPath::Call(record.call_id), encode_record(&record)?)
            .await?;
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(DispatchError::invalid("controller is shut down"));
            }
            state.active = Some(record.clone());
        }
        self.watch_call(record.call_id).await;
        debug!(call_id = %record.call_id, callee = %record.callee.party_id, "call initiated");
        Ok(record)
    }

    /// Answer the currently presented incoming call.
    pub async fn answer(&self, call_id: CallId) -> DispatchResult<()> {
        let record = {
            let state = self.state.lock();
            match state.incoming.as_ref() {
                Some(r) if r.call_id == call_id => r.clone(),
                _ => return Err(DispatchError::not_found("no incoming call with that id")),
            }
        };
        let answered = record.with_status(CallStatus::Answered);
        self.channel
            .write(&RecordPath::Call(call_id), encode_record(&answered)?)
            .await?;

        // Deliveries may have raced the write; only hand off to media if
        // this is still the current call.
        let still_current = {
            let mut state = self.state.lock();
            if state
                .incoming
                .as_ref()
                .is_some_and(|r| r.call_id == call_id)
            {
                state.incoming = None;
                state.active = Some(answered.clone());
                true
            } else {
                state.active.as_ref().is_some_and(|r| r.call_id == call_id)
            }
        };
        if !still_current {
            return Err(DispatchError::invalid("call ended before the answer completed"));
        }
        self.media.answer(call_id).await
    }

    /// Reject the currently presented incoming call.
    pub async fn reject(&self, call_id: CallId) -> DispatchResult<()> {
        let record = {
            let state = self.state.lock();
            match state.incoming.as_ref() {
                Some(r) if r.call_id == call_id => r.clone(),
                _ => return Err(DispatchError::not_found("no incoming call with that id")),
            }
        };
        self.channel
            .write(
                &RecordPath::Call(call_id),
                encode_record(&record.with_status(CallStatus::Rejected))?,
            )
            .await?;

        let watch = {
            let mut state = self.state.lock();
            if state
                .incoming
                .as_ref()
                .is_some_and(|r| r.call_id == call_id)
            {
                state.incoming = None;
            }
            state.watches.remove(&call_id)
        };
        if let Some(handle) = watch {
            self.channel.unsubscribe(&handle);
        }
        self.dedup.release(call_id, self.config.release_grace);
        debug!(call_id = %call_id, "call rejected");
        Ok(())
    }

    /// Terminate the tracked call locally.
    ///
    /// An answered call ends as `Ended`; an outgoing call still ringing is
    /// written `Missed` (the caller gave up); a presented incoming call is
    /// written `Rejected`.
    pub async fn hang_up(&self, call_id: CallId) -> DispatchResult<()> {
        let (record, was_incoming) = {
            let state = self.state.lock();
            if let Some(r) = state.active.as_ref().filter(|r| r.call_id == call_id) {
                (r.clone(), false)
            } else if let Some(r) = state.incoming.as_ref().filter(|r| r.call_id == call_id) {
                (r.clone(), true)
            } else {
                return Err(DispatchError::not_found("no tracked call with that id"));
            }
        };
        let next_status = match record.status {
            CallStatus::Answered => CallStatus::Ended,
            CallStatus::Ringing if record.is_authored_by(self.local.party_id) => CallStatus::Missed,
            CallStatus::Ringing => CallStatus::Rejected,
            terminal => terminal,
        };
        if !record.status.is_terminal() {
            self.channel
                .write(
                    &RecordPath::Call(call_id),
                    encode_record(&record.with_status(next_status))?,
                )
                .await?;
        }

        let watch = {
            let mut state = self.state.lock();
            if state
                .incoming
                .as_ref()
                .is_some_and(|r| r.call_id == call_id)
            {
                state.incoming = None;
            }
            if state.active.as_ref().is_some_and(|r| r.call_id == call_id) {
                state.active = None;
            }
            state.watches.remove(&call_id)
        };
        if let Some(handle) = watch {
            self.channel.unsubscribe(&handle);
        }
        self.dedup.release(call_id, self.config.release_grace);
        if record.status == CallStatus::Answered {
            if let Err(error) = self.media.hangup(call_id).await {
                warn!(call_id = %call_id, %error, "media teardown failed");
            }
        }
        debug!(call_id = %call_id, status = %next_status, was_incoming, "call hung up");
        Ok(())
    }

    /// Tear the controller down (logout): unsubscribe everything, cancel
    /// dedup release tasks, and discard tracked state.
    pub fn shutdown(&self) {
        let (collection, watches) = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.incoming = None;
            state.active = None;
            (state.collection.take(), std::mem::take(&mut state.watches))
        };
        if let Some(handle) = collection {
            self.channel.unsubscribe(&handle);
        }
        for (_, handle) in watches {
            self.channel.unsubscribe(&handle);
        }
        self.dedup.cancel_pending();
        debug!(party = %self.local.party_id, "call signaling controller shut down");
    }
}
