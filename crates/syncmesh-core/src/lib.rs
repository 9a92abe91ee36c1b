//! SyncMesh Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every SyncMesh layer:
//! - Identifiers (NodeId, SessionId, StreamId, RequestId, ResolverId)
//! - Time primitives (Timestamp, local_clock)
//! - Error taxonomy
//! - Resource lifecycle state machine and broadcast event bus
//! - Node model, configuration and typed sample messages

pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod lifecycle;
pub mod message;
pub mod node;
pub mod time;

pub use config::*;
pub use error::*;
pub use event::*;
pub use id::*;
pub use lifecycle::*;
pub use message::*;
pub use node::*;
pub use time::*;
