//! SyncMesh Transport - Primitive stream transport API
//!
//! This crate provides:
//! - The narrow transport API the engine consumes ([`StreamTransport`],
//!   [`ContinuousResolver`], [`Outlet`], [`Inlet`])
//! - Stream descriptions, discovered handles and attribute predicates
//! - Typed channel data and pulled samples
//! - [`MemoryTransport`], an in-process implementation for single-host
//!   setups and tests
//!
//! Handles release their transport resources when dropped.

pub mod api;
pub mod info;
pub mod memory;
pub mod predicate;
pub mod sample;

pub use api::*;
pub use info::*;
pub use memory::*;
pub use predicate::*;
pub use sample::*;
