//! # Beacon Channel - Store Access Layer
//!
//! Abstraction over the shared, eventually-consistent key/value broadcast
//! store that both coordination protocols run on. The store delivers the
//! full current value of a subscribed path on every write to it, by any
//! party, including the subscriber's own writes; delivery is at-least-once
//! and handlers must be idempotent.
//!
//! ## What's in this crate
//!
//! - **[`RecordChannel`]**: the subscribe/read/write/remove contract the
//!   controllers consume
//! - **[`InMemoryRecordStore`]**: a process-local implementation with the
//!   same delivery semantics, used by tests and local simulation
//! - **Typed decoding**: [`decode_record`] validates raw store values into
//!   typed records at the boundary
//!
//! ## What's NOT in this crate
//!
//! - Protocol state machines (see `beacon-dispatch`)
//! - The store's own transport or persistence

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod memory;

pub use channel::{decode_record, encode_record, RecordChannel, RecordHandler, SubscriptionHandle};
pub use memory::InMemoryRecordStore;
