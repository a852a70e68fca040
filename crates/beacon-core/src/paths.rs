//! Logical record paths
//!
//! Store-agnostic addresses for the records this layer reads and writes.
//! The call collection path exists because a callee learns of new calls by
//! subscribing to the whole collection and receiving its full map on every
//! change; individual call paths carry status updates for tracked calls.

use crate::identifiers::{CallId, PartyId};
use std::fmt;

/// A logical, path-addressable record location in the shared store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordPath {
    /// The whole call collection; value is a map of call id to call record
    Calls,
    /// A single call record
    Call(CallId),
    /// The responder's current assignment offer (absent when none)
    ResponderAssignment(PartyId),
    /// The responder's availability record
    ResponderAvailability(PartyId),
}

impl RecordPath {
    /// Path segments, outermost first, as stored in the record tree
    pub fn segments(&self) -> Vec<String> {
        match self {
            RecordPath::Calls => vec!["calls".into()],
            RecordPath::Call(call_id) => vec!["calls".into(), call_id.to_string()],
            RecordPath::ResponderAssignment(party_id) => vec![
                "responders".into(),
                party_id.to_string(),
                "current_assignment".into(),
            ],
            RecordPath::ResponderAvailability(party_id) => vec![
                "responders".into(),
                party_id.to_string(),
                "availability".into(),
            ],
        }
    }

    /// Whether a write at `written` changes the value observable at `self`.
    ///
    /// True when either path is an ancestor of (or equal to) the other:
    /// writing a call record changes the call collection, and writing the
    /// collection changes every call under it.
    pub fn is_affected_by(&self, written: &RecordPath) -> bool {
        let mine = self.segments();
        let theirs = written.segments();
        let shared = mine.len().min(theirs.len());
        mine[..shared] == theirs[..shared]
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments().join("/"))
    }
}
