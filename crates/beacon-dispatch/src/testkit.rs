//! Test doubles for the collaborator interfaces
//!
//! Recording implementations of the event and media traits, plus a
//! scripted stand-in for the external dispatcher. Used by this crate's own
//! tests and available to downstream consumers wiring up simulations.

use crate::events::{LeaseEvents, MediaTransport, OfferResolution, SignalingEvents};
use async_trait::async_trait;
use beacon_channel::{encode_record, RecordChannel};
use beacon_core::{
    AssignmentRecord, AvailabilityRecord, CallId, CallRecord, CallStatus, DispatchError,
    DispatchResult, PartyId, RecordPath, ReportId, ResponderAvailability,
};
use parking_lot::Mutex;
use std::time::Duration;

/// One observed signaling notification
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// `incoming_call` fired
    IncomingCall(CallId),
    /// `incoming_call_dismissed` fired
    Dismissed(CallId, CallStatus),
    /// `call_connected` fired
    Connected(CallId),
    /// `call_ended` fired
    Ended(CallId, CallStatus),
}

/// Records every signaling notification in order
#[derive(Default)]
pub struct RecordingSignalingEvents {
    seen: Mutex<Vec<SignalingEvent>>,
}

impl RecordingSignalingEvents {
    /// Everything observed so far, in order
    pub fn events(&self) -> Vec<SignalingEvent> {
        self.seen.lock().clone()
    }

    /// How many `incoming_call` presentations were observed
    pub fn presentations(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|e| matches!(e, SignalingEvent::IncomingCall(_)))
            .count()
    }
}

impl SignalingEvents for RecordingSignalingEvents {
    fn incoming_call(&self, record: &CallRecord) {
        self.seen
            .lock()
            .push(SignalingEvent::IncomingCall(record.call_id));
    }

    fn incoming_call_dismissed(&self, call_id: CallId, status: CallStatus) {
        self.seen.lock().push(SignalingEvent::Dismissed(call_id, status));
    }

    fn call_connected(&self, record: &CallRecord) {
        self.seen
            .lock()
            .push(SignalingEvent::Connected(record.call_id));
    }

    fn call_ended(&self, record: &CallRecord) {
        self.seen
            .lock()
            .push(SignalingEvent::Ended(record.call_id, record.status));
    }
}

/// One observed lease notification
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseEvent {
    /// `offer` fired, with the lease time remaining at presentation
    Offer(ReportId, Duration),
    /// `offer_dismissed` fired
    Dismissed(ReportId, OfferResolution),
    /// `decision_failed` fired
    DecisionFailed(ReportId, DispatchError),
}

/// Records every lease notification in order
#[derive(Default)]
pub struct RecordingLeaseEvents {
    seen: Mutex<Vec<LeaseEvent>>,
}

impl RecordingLeaseEvents {
    /// Everything observed so far, in order
    pub fn events(&self) -> Vec<LeaseEvent> {
        self.seen.lock().clone()
    }

    /// How many `offer` presentations were observed
    pub fn presentations(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|e| matches!(e, LeaseEvent::Offer(..)))
            .count()
    }

    /// The resolutions observed, in order
    pub fn resolutions(&self) -> Vec<OfferResolution> {
        self.seen
            .lock()
            .iter()
            .filter_map(|e| match e {
                LeaseEvent::Dismissed(_, resolution) => Some(*resolution),
                _ => None,
            })
            .collect()
    }
}

impl LeaseEvents for RecordingLeaseEvents {
    fn offer(&self, record: &AssignmentRecord, remaining: Duration) {
        self.seen
            .lock()
            .push(LeaseEvent::Offer(record.report_id.clone(), remaining));
    }

    fn offer_dismissed(&self, report_id: &ReportId, resolution: OfferResolution) {
        self.seen
            .lock()
            .push(LeaseEvent::Dismissed(report_id.clone(), resolution));
    }

    fn decision_failed(&self, report_id: &ReportId, error: &DispatchError) {
        self.seen
            .lock()
            .push(LeaseEvent::DecisionFailed(report_id.clone(), error.clone()));
    }
}

/// Media transport double recording answer/hangup calls
#[derive(Default)]
pub struct RecordingMedia {
    answered: Mutex<Vec<CallId>>,
    hung_up: Mutex<Vec<CallId>>,
}

impl RecordingMedia {
    /// Call ids handed to `answer`
    pub fn answered(&self) -> Vec<CallId> {
        self.answered.lock().clone()
    }

    /// Call ids handed to `hangup`
    pub fn hung_up(&self) -> Vec<CallId> {
        self.hung_up.lock().clone()
    }
}

#[async_trait]
impl MediaTransport for RecordingMedia {
    async fn answer(&self, call_id: CallId) -> DispatchResult<()> {
        self.answered.lock().push(call_id);
        Ok(())
    }

    async fn hangup(&self, call_id: CallId) -> DispatchResult<()> {
        self.hung_up.lock().push(call_id);
        Ok(())
    }
}

/// Write an assignment offer the way the external dispatcher does.
pub async fn create_assignment(
    channel: &dyn RecordChannel,
    responder: PartyId,
    report_id: ReportId,
) -> DispatchResult<AssignmentRecord> {
    let record = AssignmentRecord::new(report_id);
    channel
        .write(
            &RecordPath::ResponderAssignment(responder),
            encode_record(&record)?,
        )
        .await?;
    Ok(record)
}

/// Write the responder's availability record directly.
pub async fn set_availability(
    channel: &dyn RecordChannel,
    responder: PartyId,
    availability: ResponderAvailability,
) -> DispatchResult<()> {
    channel
        .write(
            &RecordPath::ResponderAvailability(responder),
            encode_record(&AvailabilityRecord::new(availability))?,
        )
        .await
}
