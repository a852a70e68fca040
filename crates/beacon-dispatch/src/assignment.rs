//! Assignment lease controller
//!
//! Routes a dispatcher's crime-report offer to one responder, who must
//! accept or decline within the lease window before the offer is
//! reclaimed. Per responder the state machine is
//! `NoOffer → PendingDecision → { Accepted | Cleared }`, where Cleared
//! folds decline and timeout into one outcome: assignment removed,
//! availability unchanged.
//!
//! The two responder paths (assignment, availability) are written without
//! any atomic multi-path guarantee, so every decision is evaluated from the
//! latest observed value of *both* paths at the time of check, never from
//! an assumed arrival order.

use crate::config::LeaseConfig;
use crate::dedup::DedupGuard;
use crate::events::{LeaseEvents, OfferResolution};
use crate::timer::LeaseTimer;
use beacon_channel::{decode_record, encode_record, RecordChannel, RecordHandler, SubscriptionHandle};
use beacon_core::{
    AssignmentRecord, AvailabilityRecord, DispatchError, DispatchResult, PartyId, RecordPath,
    ReportId, ResponderAvailability,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

struct LeaseState {
    /// Latest observed assignment record (`None` = absent)
    assignment: Option<AssignmentRecord>,
    /// Latest observed availability; `None` until the first delivery, an
    /// absent store record reads as Available
    availability: Option<ResponderAvailability>,
    /// Offer currently presented for a decision
    pending: Option<AssignmentRecord>,
    /// Accepted offer kept as context
    accepted: Option<ReportId>,
    subscriptions: Vec<SubscriptionHandle>,
    shut_down: bool,
}

enum Evaluation {
    Nothing,
    /// The dispatcher (or anyone but us) pulled the offer while pending
    Withdrawn(ReportId),
    /// A fresh actionable offer to present; carries the pending offer it
    /// displaced, if the dispatcher swapped assignments in place
    Present(AssignmentRecord, Option<ReportId>),
    /// Already-accepted context; carries the offer that was still pending
    /// when the Dispatched flip landed, with the resolution it gets
    Dispatched(Option<(ReportId, OfferResolution)>),
}

/// Listener-driven assignment leasing for one responder session.
///
/// Owns its [`DedupGuard`], [`LeaseTimer`], and subscription handles, plus
/// the single-shot processing latch that serializes accept, decline, and
/// lease expiry against each other. Construct one per authenticated
/// session; call [`shutdown`](AssignmentLeaseController::shutdown) on
/// logout.
pub struct AssignmentLeaseController {
    responder: PartyId,
    channel: Arc<dyn RecordChannel>,
    events: Arc<dyn LeaseEvents>,
    config: LeaseConfig,
    dedup: DedupGuard<ReportId>,
    lease: LeaseTimer,
    /// Latch guarding accept/decline/expiry against double submission;
    /// whichever operation latches first wins, the loser is suppressed
    /// entirely rather than issuing a conflicting write.
    processing: AtomicBool,
    state: Mutex<LeaseState>,
}

impl AssignmentLeaseController {
    /// Create a controller for `responder`, not yet listening.
    pub fn new(
        responder: PartyId,
        channel: Arc<dyn RecordChannel>,
        events: Arc<dyn LeaseEvents>,
        config: LeaseConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder,
            channel,
            events,
            config,
            dedup: DedupGuard::new(),
            lease: LeaseTimer::new(),
            processing: AtomicBool::new(false),
            state: Mutex::new(LeaseState {
                assignment: None,
                availability: None,
                pending: None,
                accepted: None,
                subscriptions: Vec::new(),
                shut_down: false,
            }),
        })
    }

    /// Start listening on both responder paths.
    ///
    /// A subscribe failure is fatal to this controller instance; partial
    /// setup is rolled back before returning.
    pub async fn listen(self: &Arc<Self>) -> DispatchResult<()> {
        let assignment_path = RecordPath::ResponderAssignment(self.responder);
        let availability_path = RecordPath::ResponderAvailability(self.responder);

        let ctrl = Arc::clone(self);
        let on_assignment: RecordHandler = Arc::new(move |value| {
            let ctrl = Arc::clone(&ctrl);
            Box::pin(async move { ctrl.on_assignment_update(value).await })
        });
        let ctrl = Arc::clone(self);
        let on_availability: RecordHandler = Arc::new(move |value| {
            let ctrl = Arc::clone(&ctrl);
            Box::pin(async move { ctrl.on_availability_update(value).await })
        });

        let assignment_sub = self
            .channel
            .subscribe(&assignment_path, on_assignment)
            .await
            .map_err(|e| DispatchError::channel(format!("assignment listener setup failed: {e}")))?;
        let availability_sub = match self.channel.subscribe(&availability_path, on_availability).await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.channel.unsubscribe(&assignment_sub);
                return Err(DispatchError::channel(format!(
                    "availability listener setup failed: {e}"
                )));
            }
        };

        let mut state = self.state.lock();
        if state.shut_down {
            drop(state);
            self.channel.unsubscribe(&assignment_sub);
            self.channel.unsubscribe(&availability_sub);
            return Err(DispatchError::invalid("controller is shut down"));
        }
        state.subscriptions = vec![assignment_sub, availability_sub];
        Ok(())
    }

    /// The offer currently awaiting a decision, if any
    pub fn pending_offer(&self) -> Option<AssignmentRecord> {
        self.state.lock().pending.clone()
    }

    /// Time left on the pending offer's lease; zero when none is pending
    pub fn lease_remaining(&self) -> Duration {
        self.lease.remaining()
    }

    // =========================================================================
    // Store deliveries
    // =========================================================================

    async fn on_assignment_update(self: &Arc<Self>, value: Option<Value>) {
        let path = RecordPath::ResponderAssignment(self.responder);
        match decode_record::<AssignmentRecord>(&path, value.as_ref()) {
            Ok(record) => {
                {
                    let mut state = self.state.lock();
                    if state.shut_down {
                        return;
                    }
                    state.assignment = record;
                }
                self.evaluate();
            }
            Err(error) => warn!(path = %path, %error, "ignoring malformed assignment record"),
        }
    }

    async fn on_availability_update(self: &Arc<Self>, value: Option<Value>) {
        let path = RecordPath::ResponderAvailability(self.responder);
        match decode_record::<AvailabilityRecord>(&path, value.as_ref()) {
            Ok(record) => {
                // An absent availability record reads as Available.
                let availability = record.map(|r| r.availability).unwrap_or_default();
                {
                    let mut state = self.state.lock();
                    if state.shut_down {
                        return;
                    }
                    state.availability = Some(availability);
                }
                self.evaluate();
            }
            Err(error) => warn!(path = %path, %error, "ignoring malformed availability record"),
        }
    }

    /// Re-derive the offer phase from the latest value of both paths.
    fn evaluate(self: &Arc<Self>) {
        let evaluation = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            match (state.assignment.clone(), state.availability) {
                (None, _) => {
                    state.accepted = None;
                    match state.pending.take() {
                        Some(record) => Evaluation::Withdrawn(record.report_id),
                        None => Evaluation::Nothing,
                    }
                }
                // Availability not yet delivered; too early to tell a new
                // offer from accepted context.
                (Some(_), None) => Evaluation::Nothing,
                (Some(record), Some(ResponderAvailability::Available)) => {
                    let already_pending = state
                        .pending
                        .as_ref()
                        .is_some_and(|p| p.report_id == record.report_id);
                    if already_pending || !self.dedup.should_present(record.report_id.clone()) {
                        Evaluation::Nothing
                    } else {
                        let displaced = state.pending.replace(record.clone());
                        Evaluation::Present(record, displaced.map(|p| p.report_id))
                    }
                }
                (Some(record), Some(ResponderAvailability::Dispatched)) => {
                    // A pending offer for the report we accepted is our own
                    // accept echo racing the bookkeeping; a pending offer
                    // for anything else was superseded by that accept.
                    let was_pending = state.pending.take().map(|p| {
                        let resolution = match state.accepted.as_ref() {
                            Some(accepted) if *accepted != p.report_id => {
                                OfferResolution::Withdrawn
                            }
                            _ => OfferResolution::Accepted,
                        };
                        (p.report_id, resolution)
                    });
                    state.accepted = Some(record.report_id);
                    Evaluation::Dispatched(was_pending)
                }
            }
        };

        match evaluation {
            Evaluation::Nothing => {}
            Evaluation::Withdrawn(report_id) => {
                debug!(report = %report_id, "pending offer withdrawn remotely");
                self.lease.disarm();
                self.events
                    .offer_dismissed(&report_id, OfferResolution::Withdrawn);
                self.dedup.release(report_id, self.config.release_grace);
            }
            Evaluation::Present(record, displaced) => {
                if let Some(old) = displaced {
                    debug!(report = %old, "pending offer displaced by a newer one");
                    self.events
                        .offer_dismissed(&old, OfferResolution::Withdrawn);
                    self.dedup.release(old, self.config.release_grace);
                }
                debug!(report = %record.report_id, "presenting assignment offer");
                self.processing.store(false, Ordering::SeqCst);
                let ctrl = Arc::clone(self);
                let report_id = record.report_id.clone();
                self.lease.arm(
                    self.config.decision_window,
                    Box::new(move || {
                        Box::pin(async move { ctrl.on_lease_expiry(report_id).await })
                    }),
                );
                self.events.offer(&record, self.lease.remaining());
            }
            Evaluation::Dispatched(was_pending) => {
                // Already-accepted offer continuing to exist as context;
                // never re-presented, never timed.
                self.lease.disarm();
                if let Some((report_id, resolution)) = was_pending {
                    self.events.offer_dismissed(&report_id, resolution);
                    self.dedup.release(report_id, self.config.release_grace);
                }
            }
        }
    }

    // =========================================================================
    // Responder decisions
    // =========================================================================

    /// Accept the pending offer: availability flips to Dispatched and the
    /// assignment record stays in place as context.
    pub async fn accept(&self, report_id: ReportId) -> DispatchResult<()> {
        {
            let state = self.state.lock();
            if !state
                .pending
                .as_ref()
                .is_some_and(|p| p.report_id == report_id)
            {
                return Err(DispatchError::not_found("no pending offer for that report"));
            }
        }
        let value = encode_record(&AvailabilityRecord::new(ResponderAvailability::Dispatched))?;
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(report = %report_id, "decision already in flight");
            return Ok(());
        }

        // The timer stays armed across the write; an expiry racing us is
        // suppressed by the latch, and on failure the countdown is still
        // honest.
        match self
            .channel
            .write(&RecordPath::ResponderAvailability(self.responder), value)
            .await
        {
            Ok(()) => {
                // The dispatcher may have displaced the offer while the
                // write was in flight; only clear what still belongs to
                // this report. A displaced offer was already dismissed as
                // Withdrawn, and the replacement's slot and countdown stay
                // untouched until the Dispatched echo resolves it.
                let still_current = {
                    let mut state = self.state.lock();
                    let still_current = state
                        .pending
                        .as_ref()
                        .is_some_and(|p| p.report_id == report_id);
                    if still_current {
                        state.pending = None;
                    }
                    state.availability = Some(ResponderAvailability::Dispatched);
                    state.accepted = Some(report_id.clone());
                    still_current
                };
                debug!(report = %report_id, "assignment accepted");
                if still_current {
                    self.lease.disarm();
                    self.events
                        .offer_dismissed(&report_id, OfferResolution::Accepted);
                }
                self.dedup.release(report_id, self.config.release_grace);
                Ok(())
            }
            Err(error) => {
                self.processing.store(false, Ordering::SeqCst);
                warn!(report = %report_id, %error, "accept write failed");
                self.events.decision_failed(&report_id, &error);
                Err(error)
            }
        }
    }

    /// Decline the pending offer: the assignment record is removed and
    /// availability stays Available.
    pub async fn decline(&self, report_id: ReportId) -> DispatchResult<()> {
        {
            let state = self.state.lock();
            if !state
                .pending
                .as_ref()
                .is_some_and(|p| p.report_id == report_id)
            {
                return Err(DispatchError::not_found("no pending offer for that report"));
            }
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(report = %report_id, "decision already in flight");
            return Ok(());
        }

        match self
            .channel
            .remove(&RecordPath::ResponderAssignment(self.responder))
            .await
        {
            Ok(()) => {
                // Same displacement re-check as accept: the removal's
                // absence delivery resolves any replacement offer.
                let still_current = {
                    let mut state = self.state.lock();
                    let still_current = state
                        .pending
                        .as_ref()
                        .is_some_and(|p| p.report_id == report_id);
                    if still_current {
                        state.pending = None;
                    }
                    state.assignment = None;
                    still_current
                };
                debug!(report = %report_id, "assignment declined");
                if still_current {
                    self.lease.disarm();
                    self.events
                        .offer_dismissed(&report_id, OfferResolution::Declined);
                }
                self.dedup.release(report_id, self.config.release_grace);
                Ok(())
            }
            Err(error) => {
                self.processing.store(false, Ordering::SeqCst);
                warn!(report = %report_id, %error, "decline write failed");
                self.events.decision_failed(&report_id, &error);
                Err(error)
            }
        }
    }

    /// Lease deadline elapsed with no decision in flight. Behaves like a
    /// decline; idempotent against a concurrent accept/decline that
    /// latched first.
    pub async fn on_lease_expiry(&self, report_id: ReportId) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(report = %report_id, "expiry raced a manual decision; suppressed");
            return;
        }
        let still_pending = {
            let state = self.state.lock();
            !state.shut_down
                && state
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.report_id == report_id)
        };
        if !still_pending {
            self.processing.store(false, Ordering::SeqCst);
            return;
        }

        match self
            .channel
            .remove(&RecordPath::ResponderAssignment(self.responder))
            .await
        {
            Ok(()) => {
                let still_current = {
                    let mut state = self.state.lock();
                    let still_current = state
                        .pending
                        .as_ref()
                        .is_some_and(|p| p.report_id == report_id);
                    if still_current {
                        state.pending = None;
                    }
                    state.assignment = None;
                    still_current
                };
                debug!(report = %report_id, "lease expired, assignment reclaimed");
                if still_current {
                    self.events
                        .offer_dismissed(&report_id, OfferResolution::Expired);
                }
                self.dedup.release(report_id, self.config.release_grace);
            }
            Err(error) => {
                // Leave the offer pending; the responder can still decline
                // manually and the store still holds the assignment.
                warn!(report = %report_id, %error, "lease reclaim write failed");
                self.processing.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Tear the controller down (logout): disarm the lease, unsubscribe
    /// both paths, cancel dedup release tasks, and discard state.
    pub fn shutdown(&self) {
        let subscriptions = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.pending = None;
            state.assignment = None;
            state.accepted = None;
            std::mem::take(&mut state.subscriptions)
        };
        for handle in subscriptions {
            self.channel.unsubscribe(&handle);
        }
        self.lease.disarm();
        self.dedup.cancel_pending();
        debug!(responder = %self.responder, "assignment lease controller shut down");
    }
}
