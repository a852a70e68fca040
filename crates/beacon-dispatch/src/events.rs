//! Collaborator interfaces
//!
//! The controllers push one-way notifications out through these traits and
//! consume nothing back beyond the user's eventual answer/reject or
//! accept/decline call into the controller. Media transport is opaque to
//! this layer.

use async_trait::async_trait;
use beacon_core::{AssignmentRecord, CallId, CallRecord, CallStatus, DispatchError, DispatchResult, ReportId};
use std::fmt;
use std::time::Duration;

/// Why a pending assignment offer left the decision UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResolution {
    /// The responder accepted; availability flipped to Dispatched
    Accepted,
    /// The responder declined; the assignment was removed
    Declined,
    /// The lease ran out; the assignment was reclaimed
    Expired,
    /// The dispatcher withdrew the offer remotely
    Withdrawn,
}

impl fmt::Display for OfferResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OfferResolution::Accepted => "accepted",
            OfferResolution::Declined => "declined",
            OfferResolution::Expired => "expired",
            OfferResolution::Withdrawn => "withdrawn",
        };
        write!(f, "{}", s)
    }
}

/// UI-facing notifications from the call signaling controller
pub trait SignalingEvents: Send + Sync {
    /// A new incoming call should be presented for a decision
    fn incoming_call(&self, record: &CallRecord);

    /// A presented incoming call resolved without local user action
    /// (remote hangup, remote cancel, or record removal)
    fn incoming_call_dismissed(&self, call_id: CallId, status: CallStatus);

    /// The tracked call was answered; media setup may proceed
    fn call_connected(&self, record: &CallRecord);

    /// The tracked active call reached a terminal status
    fn call_ended(&self, record: &CallRecord);
}

/// UI-facing notifications from the assignment lease controller
pub trait LeaseEvents: Send + Sync {
    /// A new assignment offer should be presented, with the time left on
    /// its lease
    fn offer(&self, record: &AssignmentRecord, remaining: Duration);

    /// A presented offer resolved
    fn offer_dismissed(&self, report_id: &ReportId, resolution: OfferResolution);

    /// An accept/decline write failed transiently; the decision UI should
    /// re-enable and let the user retry
    fn decision_failed(&self, report_id: &ReportId, error: &DispatchError);
}

/// Opaque media transport collaborator.
///
/// Both operations must be idempotent: the controller may invoke `hangup`
/// for a call the transport already tore down when a terminal status echo
/// arrives.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Set up media for an answered call
    async fn answer(&self, call_id: CallId) -> DispatchResult<()>;

    /// Tear down media for a terminated call
    async fn hangup(&self, call_id: CallId) -> DispatchResult<()>;
}
