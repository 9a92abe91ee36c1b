//! Discovery events

use std::time::Duration;

use syncmesh_core::ResolverId;
use syncmesh_transport::{Predicate, StreamHandle};

/// Published by the [`DiscoveryEngine`](crate::DiscoveryEngine)
#[derive(Clone, Debug)]
pub enum DiscoveryEvent {
    /// A continuous discovery session started
    ResolverCreated {
        resolver_id: ResolverId,
        predicate: Predicate,
    },
    /// A one-shot resolve found streams
    NodesDiscovered { predicate: Predicate, count: usize },
    /// A continuous session refreshed its results
    PeriodicDiscovery {
        resolver_id: ResolverId,
        count: usize,
        handles: Vec<StreamHandle>,
    },
    /// A resolve failed; periodic sessions keep running
    DiscoveryError {
        resolver_id: Option<ResolverId>,
        reason: String,
    },
    /// A one-shot resolve ran out its wait without results
    DiscoveryTimeout {
        predicate: Predicate,
        duration: Duration,
    },
    /// A continuous discovery session stopped
    ResolverStopped { resolver_id: ResolverId },
}
