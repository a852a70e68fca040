//! # Beacon Core - Domain Types
//!
//! Foundation crate for the Beacon real-time dispatch and signaling layer.
//! Defines the record shapes exchanged through the shared broadcast store,
//! the identifiers that address them, and the unified error type.
//!
//! ## What's in this crate
//!
//! - **Identifiers**: typed newtypes for parties, calls, and reports
//! - **Records**: call, assignment, and availability record types with their
//!   status state machines
//! - **Paths**: logical, store-agnostic record addresses
//! - **Errors**: the unified `DispatchError` used across all Beacon crates
//!
//! ## What's NOT in this crate
//!
//! - Store access (see `beacon-channel`)
//! - Protocol controllers and timers (see `beacon-dispatch`)
//! - Async execution (pure synchronous domain logic)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod identifiers;
pub mod paths;
pub mod records;

pub use errors::{DispatchError, DispatchResult};
pub use identifiers::{CallId, PartyId, ReportId};
pub use paths::RecordPath;
pub use records::{
    AssignmentRecord, AvailabilityRecord, CallRecord, CallStatus, Party, PartyRole,
    ResponderAvailability,
};
