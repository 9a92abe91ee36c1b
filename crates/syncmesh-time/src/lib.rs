//! SyncMesh Time - Worker timing primitives
//!
//! This crate provides the timing used by stream workers:
//! - Poll timers: fixed-interval sleeping or a sleep-then-spin busy wait
//!   that trades CPU for sub-millisecond tick precision
//! - Clock correction: per-source offset estimates with a rate-limited
//!   refresh schedule

pub mod correction;
pub mod poll;

pub use correction::*;
pub use poll::*;
