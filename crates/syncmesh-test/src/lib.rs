//! SyncMesh Test Harness - Multi-node scenarios in one process
//!
//! This crate provides:
//! - A cluster harness running sessions over a shared in-memory transport
//! - Event and polling helpers with deadlines
//! - Silent nodes that advertise without speaking, for eviction scenarios
//! - End-to-end scenarios across every topology

pub mod harness;
pub mod integration;

pub use harness::*;
pub use integration::*;
