//! Record types exchanged through the shared broadcast store
//!
//! Every record crosses the store as JSON and is decoded back into these
//! types at the channel boundary, so a malformed or partially-written record
//! surfaces as a typed decode error instead of failing downstream.

use crate::identifiers::{CallId, PartyId, ReportId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Parties
// =============================================================================

/// Role a party plays in the dispatch system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    /// A police officer who receives assignments and emergency calls
    Responder,
    /// A civilian who files reports and places emergency calls
    Reporter,
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartyRole::Responder => write!(f, "responder"),
            PartyRole::Reporter => write!(f, "reporter"),
        }
    }
}

/// One endpoint of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Stable identifier of the party
    pub party_id: PartyId,
    /// Role the party plays
    pub role: PartyRole,
    /// Human-readable name shown by the decision UI
    pub display_name: String,
}

impl Party {
    /// Construct a party descriptor
    pub fn new(party_id: PartyId, role: PartyRole, display_name: impl Into<String>) -> Self {
        Self {
            party_id,
            role,
            display_name: display_name.into(),
        }
    }
}

// =============================================================================
// Call records
// =============================================================================

/// Signaling status of a call attempt
///
/// Status only moves forward: `Ringing` may transition to any other status,
/// `Answered` only to `Ended`, and the remaining statuses are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Call offered to the callee, awaiting a decision
    Ringing,
    /// Callee accepted; media setup is in the hands of the transport
    Answered,
    /// Either party terminated an answered call
    Ended,
    /// Callee declined, or the call was auto-rejected while busy
    Rejected,
    /// Caller gave up before the callee decided
    Missed,
}

impl CallStatus {
    /// Whether this status ends the call for both parties
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Rejected | CallStatus::Missed
        )
    }

    /// Whether the status state machine permits moving to `next`.
    ///
    /// Re-asserting the current status is allowed (the store re-delivers
    /// writes); moving backward is not.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            CallStatus::Ringing => true,
            CallStatus::Answered => next == CallStatus::Ended,
            _ => false,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
            CallStatus::Missed => "missed",
        };
        write!(f, "{}", s)
    }
}

/// One call attempt between two parties.
///
/// Immutable except for `status` and its companion timestamps; either party
/// may write a forward status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Unique identifier, assigned at creation
    pub call_id: CallId,
    /// The party that placed the call
    pub caller: Party,
    /// The party being called
    pub callee: Party,
    /// Current signaling status
    pub status: CallStatus,
    /// Optional correlation to the assignment that prompted the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_report_id: Option<ReportId>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// Stamped when the callee answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    /// Stamped when an answered call ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Create a fresh ringing record from `caller` to `callee`.
    pub fn ringing(caller: Party, callee: Party, linked_report_id: Option<ReportId>) -> Self {
        Self {
            call_id: CallId::new(),
            caller,
            callee,
            status: CallStatus::Ringing,
            linked_report_id,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
        }
    }

    /// Copy of this record moved to `status`, stamping the matching
    /// timestamp field. Callers are expected to have checked
    /// [`CallStatus::can_transition_to`] first.
    pub fn with_status(&self, status: CallStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        match status {
            CallStatus::Answered => next.answered_at = Some(Utc::now()),
            CallStatus::Ended => next.ended_at = Some(Utc::now()),
            _ => {}
        }
        next
    }

    /// Whether `party` is the callee of this record
    pub fn is_addressed_to(&self, party: PartyId) -> bool {
        self.callee.party_id == party
    }

    /// Whether `party` placed this call
    pub fn is_authored_by(&self, party: PartyId) -> bool {
        self.caller.party_id == party
    }
}

// =============================================================================
// Assignment records
// =============================================================================

/// Availability of a responder, stored on the responder's own record.
///
/// Read together with the assignment record to disambiguate "new offer"
/// from "already accepted, still shown as context".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponderAvailability {
    /// Free to receive a new assignment offer
    #[default]
    Available,
    /// Accepted an assignment and is working it
    Dispatched,
}

impl fmt::Display for ResponderAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponderAvailability::Available => write!(f, "available"),
            ResponderAvailability::Dispatched => write!(f, "dispatched"),
        }
    }
}

/// A dispatcher's offer of a report to one responder.
///
/// Presence of this record at the responder's assignment path denotes "a
/// pending or accepted offer exists"; its removal is the terminal signal
/// for decline and timeout (tombstone-free clear).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    /// The work item being offered
    pub report_id: ReportId,
    /// When the dispatcher created the offer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
}

impl AssignmentRecord {
    /// Construct an offer of `report_id`, stamped now.
    pub fn new(report_id: ReportId) -> Self {
        Self {
            report_id,
            assigned_at: Some(Utc::now()),
        }
    }
}

/// The responder's availability as stored at the availability path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AvailabilityRecord {
    /// Current availability
    pub availability: ResponderAvailability,
}

impl AvailabilityRecord {
    /// Construct a record carrying `availability`
    pub fn new(availability: ResponderAvailability) -> Self {
        Self { availability }
    }
}
