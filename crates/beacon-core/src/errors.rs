//! Unified error type for the Beacon dispatch layer
//!
//! One flat error enum shared by every Beacon crate; constructors keep call
//! sites short. Store-write failures map to `Network` and are retryable by
//! the user; `Decode` marks a malformed record caught at the channel
//! boundary; `Channel` marks a failed subscription setup, which is fatal to
//! the controller instance that attempted it.

use serde::{Deserialize, Serialize};

/// Result alias used across all Beacon crates
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Unified error type for all dispatch-layer operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DispatchError {
    /// Invalid input or a guard rejected the operation
    #[error("Invalid: {message}")]
    Invalid {
        /// What was invalid
        message: String,
    },

    /// A referenced record or tracked call/offer was not found
    #[error("Not found: {message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// Transient store or network failure; safe to retry
    #[error("Network error: {message}")]
    Network {
        /// What failed
        message: String,
    },

    /// A record read from the store failed to decode into its typed shape
    #[error("Decode error at {path}: {message}")]
    Decode {
        /// Logical path the record was read from
        path: String,
        /// Underlying serde failure
        message: String,
    },

    /// Subscription setup failed; the controller instance is not listening
    #[error("Channel error: {message}")]
    Channel {
        /// What failed during setup
        message: String,
    },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the violation
        message: String,
    },
}

impl DispatchError {
    /// Create an invalid-input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a transient network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a decode error for a record at `path`
    pub fn decode(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a channel setup error
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the user may simply retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Network { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn constructors_build_the_matching_variant() {
        assert_matches!(DispatchError::invalid("x"), DispatchError::Invalid { .. });
        assert_matches!(DispatchError::network("x"), DispatchError::Network { .. });
        assert_matches!(
            DispatchError::decode("calls", "bad"),
            DispatchError::Decode { .. }
        );
    }

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(DispatchError::network("drop").is_retryable());
        assert!(!DispatchError::invalid("guard").is_retryable());
        assert!(!DispatchError::channel("setup").is_retryable());
    }

    #[test]
    fn display_includes_the_path_for_decode_errors() {
        let err = DispatchError::decode("calls/abc", "missing field");
        assert!(err.to_string().contains("calls/abc"));
    }
}
