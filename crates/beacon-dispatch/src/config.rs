//! Controller configuration

use std::time::Duration;

/// Configuration for the assignment lease controller
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a responder has to accept or decline an offer
    pub decision_window: Duration,
    /// Grace delay before a resolved report id leaves the dedup set
    pub release_grace: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            decision_window: Duration::from_secs(30),
            release_grace: Duration::from_secs(5),
        }
    }
}

/// Configuration for the call signaling controller
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Grace delay before a resolved call id leaves the dedup set.
    ///
    /// A terminal write and the store's echo of that same write can each
    /// trigger the handler; the delay keeps a late stale "ringing" delivery
    /// from re-opening a decision UI for a call that just ended.
    pub release_grace: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            release_grace: Duration::from_secs(5),
        }
    }
}
