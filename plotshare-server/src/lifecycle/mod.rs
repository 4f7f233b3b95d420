//! The space request state machine.
//!
//! `RequestLifecycleManager` applies transitions; `OccupancyGuard` keeps a
//! space to one active request; `check_transition` is the pure gate both the
//! graph and the access policy go through.

mod manager;
mod occupancy;
mod transition;

pub use manager::{NoticeOutcome, RequestLifecycleManager, TransitionOutcome};
pub use occupancy::{OccupancyGuard, Reservation};
pub use transition::check_transition;
