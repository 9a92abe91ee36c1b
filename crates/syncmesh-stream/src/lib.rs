//! SyncMesh Stream - Concurrent stream transport engine
//!
//! Each started [`DataStream`] runs up to two workers, matched to its
//! participation mode:
//! - an outlet worker owning exactly one outlet, pushing samples on demand
//! - an inlet worker owning a set of inlets, polling them on a timer or a
//!   busy-wait loop and delivering batches of clock-corrected samples
//!
//! Workers live on their own OS threads and talk to the orchestrator only
//! through typed messages. Commands may carry a request id; the worker
//! answers with a response carrying the same id.

pub mod handle;
pub mod inlet;
pub mod messages;
pub mod options;
pub mod outlet;
pub mod stream;

pub use handle::*;
pub use inlet::spawn_inlet_worker;
pub use messages::*;
pub use options::*;
pub use outlet::spawn_outlet_worker;
pub use stream::*;
