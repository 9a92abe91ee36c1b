//! Cluster harness
//!
//! Runs several sessions in one process over a shared [`MemoryTransport`],
//! with timing tightened so membership converges in tens of milliseconds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::Level;

use syncmesh_core::{
    CoordinationConfig, ElectionStrategy, Envelope, NodeId, SessionConfig, SyncResult, Topology,
};
use syncmesh_session::{init_tracing_with_level, CoordinationSession, LogFormat, SessionEvent};
use syncmesh_transport::MemoryTransport;

/// Timing applied to every session of a cluster
#[derive(Clone, Copy, Debug)]
pub struct ClusterTiming {
    pub heartbeat_interval: Duration,
    pub discovery_interval: Duration,
    pub node_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for ClusterTiming {
    fn default() -> Self {
        ClusterTiming {
            heartbeat_interval: Duration::from_millis(50),
            discovery_interval: Duration::from_millis(50),
            node_timeout: Duration::from_millis(400),
            join_timeout: Duration::from_millis(150),
        }
    }
}

/// Sessions sharing one in-memory transport
pub struct TestCluster {
    transport: MemoryTransport,
    session_id: String,
    topology: Topology,
    election: ElectionStrategy,
    timing: ClusterTiming,
    min_nodes: usize,
    max_nodes: usize,
    next_id: u64,
}

impl TestCluster {
    pub fn new(session_id: impl Into<String>, topology: Topology) -> Self {
        TestCluster {
            transport: MemoryTransport::new(),
            session_id: session_id.into(),
            topology,
            election: ElectionStrategy::default(),
            timing: ClusterTiming::default(),
            min_nodes: 1,
            max_nodes: 16,
            next_id: 1,
        }
    }

    pub fn with_election(mut self, election: ElectionStrategy) -> Self {
        self.election = election;
        self
    }

    pub fn with_timing(mut self, timing: ClusterTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_min_nodes(mut self, n: usize) -> Self {
        self.min_nodes = n;
        self
    }

    pub fn with_max_nodes(mut self, n: usize) -> Self {
        self.max_nodes = n;
        self
    }

    pub fn transport(&self) -> &MemoryTransport {
        &self.transport
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn timing(&self) -> ClusterTiming {
        self.timing
    }

    /// Configuration for the next node; ids are assigned in creation order
    pub fn config(&mut self, name: &str) -> SyncResult<SessionConfig> {
        let id = NodeId::new(0x100 + self.next_id);
        self.next_id += 1;
        let coordination = CoordinationConfig::builder()
            .min_nodes(self.min_nodes)
            .max_nodes(self.max_nodes)
            .heartbeat_interval(self.timing.heartbeat_interval)
            .discovery_interval(self.timing.discovery_interval)
            .node_timeout(self.timing.node_timeout)
            .join_timeout(self.timing.join_timeout)
            .build()?;
        SessionConfig::builder(self.session_id.clone(), name)
            .node_id(id)
            .topology(self.topology)
            .election(self.election)
            .coordination(coordination)
            .build()
    }

    /// Create a disconnected session for the next node
    pub fn session(&mut self, name: &str) -> SyncResult<CoordinationSession> {
        let config = self.config(name)?;
        CoordinationSession::new(config, Arc::new(self.transport.clone()))
    }

    /// Create a session for the next node and join it
    pub async fn join(&mut self, name: &str) -> SyncResult<CoordinationSession> {
        let session = self.session(name)?;
        session.join().await?;
        Ok(session)
    }
}

/// Route test logs through the session subscriber; safe to call repeatedly
pub fn init_test_tracing() {
    init_tracing_with_level(LogFormat::Plain, Level::WARN);
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next event satisfying `matches`, skipping everything else
pub async fn next_event<F>(
    rx: &mut broadcast::Receiver<Envelope<SessionEvent>>,
    timeout: Duration,
    mut matches: F,
) -> Option<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(envelope)) if matches(&envelope.event) => return Some(envelope.event),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Matching events, until none arrives for `window`
pub async fn collect_events<F>(
    rx: &mut broadcast::Receiver<Envelope<SessionEvent>>,
    window: Duration,
    mut matches: F,
) -> Vec<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let mut found = Vec::new();
    while let Some(event) = next_event(rx, window, &mut matches).await {
        found.push(event);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configs_get_distinct_ids() {
        let mut cluster = TestCluster::new("ids", Topology::Peer2Peer).with_max_nodes(4);
        let a = cluster.config("a").unwrap();
        let b = cluster.config("b").unwrap();
        assert_ne!(a.node_id(), b.node_id());
        assert_eq!(a.session_id(), b.session_id());
        assert_eq!(a.coordination().max_nodes(), 4);
    }

    #[tokio::test]
    async fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || async { true }).await);
        assert!(!wait_until(Duration::from_millis(30), || async { false }).await);
    }
}
