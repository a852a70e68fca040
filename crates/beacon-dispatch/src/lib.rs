//! # Beacon Dispatch - Coordination Protocols
//!
//! The two coordination protocols of the Beacon safety platform, both built
//! on the shared key/value broadcast store exposed by `beacon-channel`:
//!
//! - **Call signaling** ([`CallSignalingController`]): routes an emergency
//!   voice call from caller to callee with ringing, accept/reject/busy
//!   semantics.
//! - **Assignment leasing** ([`AssignmentLeaseController`]): routes a crime
//!   report assignment from a dispatcher to a responder, who must accept or
//!   decline within a fixed window before the lease is reclaimed.
//!
//! Both are listener-driven state machines over a store that re-delivers
//! duplicate and out-of-order notifications. Correctness rests on idempotent
//! handlers, the [`DedupGuard`] handled-set, and a single-shot processing
//! latch guarding accept/decline against re-entrant double submission; no
//! locks are held across awaits, and shared state is re-checked after every
//! await before its result is acted on.
//!
//! Controllers are constructed per authenticated session and torn down
//! explicitly on logout; there is no module-level mutable state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod assignment;
pub mod call;
pub mod config;
pub mod dedup;
pub mod events;
pub mod testkit;
pub mod timer;

pub use assignment::AssignmentLeaseController;
pub use call::CallSignalingController;
pub use config::{LeaseConfig, SignalingConfig};
pub use dedup::DedupGuard;
pub use events::{LeaseEvents, MediaTransport, OfferResolution, SignalingEvents};
pub use timer::LeaseTimer;
