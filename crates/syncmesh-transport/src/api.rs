//! Transport primitives consumed by the engine
//!
//! All calls may block the calling thread. Orchestrator code reaches them
//! through `spawn_blocking`; worker threads call them directly.

use std::sync::Arc;
use std::time::Duration;

use syncmesh_core::SyncResult;

use crate::{Predicate, Sample, SampleData, StreamHandle, StreamInfo};

/// Entry point of a stream transport
pub trait StreamTransport: Send + Sync + 'static {
    /// Resolve streams matching `predicate`
    ///
    /// Waits up to `wait`, returning early once `max_streams` are found.
    fn resolve_streams(
        &self,
        predicate: &Predicate,
        wait: Duration,
        max_streams: usize,
    ) -> SyncResult<Vec<StreamHandle>>;

    /// Start a background resolver that keeps the set of matching streams
    /// current; streams not seen for `forget_after` are dropped
    fn create_continuous_resolver(
        &self,
        predicate: &Predicate,
        forget_after: Duration,
        max_streams: usize,
    ) -> SyncResult<Box<dyn ContinuousResolver>>;

    /// Publish a stream
    fn create_outlet(&self, info: StreamInfo) -> SyncResult<Box<dyn Outlet>>;

    /// Subscribe to a discovered stream
    fn create_inlet(&self, handle: &StreamHandle) -> SyncResult<Box<dyn Inlet>>;
}

/// Shared transport reference
pub type SharedTransport = Arc<dyn StreamTransport>;

/// Background resolver; dropping it destroys it
pub trait ContinuousResolver: Send + Sync {
    fn predicate(&self) -> &Predicate;

    /// Streams currently known to match
    fn results(&self) -> SyncResult<Vec<StreamHandle>>;
}

/// Producing end of a stream; dropping it withdraws the stream
pub trait Outlet: Send {
    /// Description including the transport-assigned uid
    fn info(&self) -> &StreamInfo;

    /// Push one sample; `timestamp` defaults to the local clock
    fn push_sample(&mut self, data: SampleData, timestamp: Option<f64>) -> SyncResult<()>;

    /// Whether any inlet is subscribed
    fn have_consumers(&self) -> bool;
}

/// Consuming end of a stream; dropping it closes the subscription
pub trait Inlet: Send {
    fn info(&self) -> &StreamInfo;

    /// Pull the next sample, waiting up to `timeout` (zero never blocks)
    ///
    /// Fails with `StreamUnavailable` once the outlet is gone and nothing is
    /// left to read.
    fn pull_sample(&mut self, timeout: Duration) -> SyncResult<Option<Sample>>;

    /// Offset to add to this stream's time stamps to map them onto the
    /// local clock
    fn time_correction(&mut self, timeout: Duration) -> SyncResult<f64>;

    /// Discard everything queued; returns the number of dropped samples
    fn flush(&mut self) -> usize;
}
