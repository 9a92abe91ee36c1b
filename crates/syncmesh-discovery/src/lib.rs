//! SyncMesh Discovery - Finding streams by predicate
//!
//! This crate provides:
//! - One-shot bounded resolves run off the async executor
//! - Continuous discovery sessions with periodic refresh and age-out
//! - A handle cache with explicit ownership transfer (`take_matching`)
//! - Discovery events on a broadcast bus

pub mod engine;
pub mod event;

pub use engine::*;
pub use event::*;
