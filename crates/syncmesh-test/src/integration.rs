//! End-to-end scenarios
//!
//! Multi-node sessions over one in-memory transport:
//! - hierarchical and peer-to-peer network formation
//! - data delivery between producer and consumer nodes
//! - departure, eviction and re-election
//! - admission limits

use std::sync::Arc;

use syncmesh_core::{
    Capability, DataType, NodeId, ParticipationMode, Resource, StreamConfig, SyncResult, Timestamp,
    Topology,
};
use syncmesh_session::{coordination_stream_config, NodeAnnouncement};
use syncmesh_stream::DataStream;

use crate::TestCluster;

/// A node that advertises itself in a session but never speaks
///
/// Disposing it makes it vanish without a departure announcement, the way a
/// crashed process would.
pub struct SilentNode {
    pub node_id: NodeId,
    stream: DataStream,
}

impl SilentNode {
    pub async fn start(cluster: &TestCluster, node_id: NodeId, topology: Topology) -> SyncResult<Self> {
        let announcement = NodeAnnouncement {
            node_id,
            name: format!("silent-{node_id}"),
            role: topology.joiner_role(),
            topology,
            capabilities: Capability::all(),
            started_at: Some(Timestamp::now()),
            roll: None,
        };
        let config = coordination_stream_config(cluster.timing().heartbeat_interval)?;
        let mut stream = DataStream::new(
            config,
            node_id.to_string(),
            Arc::new(cluster.transport().clone()),
        )
        .with_session(cluster.session_id());
        for (key, value) in announcement.to_desc() {
            stream = stream.with_description(key, value);
        }
        stream.start().await?;
        Ok(SilentNode { node_id, stream })
    }

    /// Withdraw the advertisement without announcing anything
    pub async fn crash(mut self) -> SyncResult<()> {
        self.stream.dispose().await
    }
}

/// Stream shape shared by the data delivery scenarios
pub fn eeg_config(mode: ParticipationMode) -> SyncResult<StreamConfig> {
    StreamConfig::builder("eeg")
        .channels(4)
        .sample_rate(100.0)
        .data_type(DataType::Float32)
        .participation_mode(mode)
        .precise_polling(mode.consumes())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use syncmesh_core::{NodeRole, SessionState, SyncError};
    use syncmesh_session::{LeaveReason, SessionEvent};
    use tokio::time::Instant;

    use crate::{collect_events, init_test_tracing, next_event, wait_until};

    const CONVERGE: Duration = Duration::from_secs(2);

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hierarchical_server_to_client_delivery() {
        init_test_tracing();
        let mut cluster = TestCluster::new("hier-lab", Topology::Hierarchical).with_min_nodes(2);

        let mut a = cluster.join("amp").await.unwrap();
        assert_eq!(a.role().await.unwrap(), NodeRole::Server);
        let mut b = cluster.join("viewer").await.unwrap();
        assert_eq!(b.role().await.unwrap(), NodeRole::Client);
        assert_eq!(b.leader().await.unwrap(), Some(a.node_id()));

        assert_eq!(a.wait_for_quorum(Some(CONVERGE)).await.unwrap(), 2);
        assert_eq!(a.role().await.unwrap(), NodeRole::Server);
        assert!(a.snapshot().await.unwrap().is_leader());

        let producer = a
            .create_data_stream(eeg_config(ParticipationMode::Producer).unwrap())
            .await
            .unwrap();
        let consumer = b
            .create_data_stream(eeg_config(ParticipationMode::Consumer).unwrap())
            .await
            .unwrap();
        assert_eq!(producer, consumer);

        let mut first_push = None;
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while received.is_empty() && Instant::now() < deadline {
            a.push_sample(&producer, vec![1.0f32, 2.0, 3.0, 4.0], None)
                .await
                .unwrap();
            first_push.get_or_insert_with(Instant::now);
            tokio::time::sleep(Duration::from_millis(10)).await;
            received = b.take_stream_batches(&consumer).await.unwrap();
        }
        let first_push = first_push.unwrap();
        assert!(!received.is_empty(), "consumer never received a sample");
        assert!(first_push.elapsed() < Duration::from_millis(500));

        let sample = &received[0];
        assert_eq!(sample.source_id, a.node_id().to_string());
        assert_eq!(sample.channel_data.len(), 4);
        assert_eq!(sample.channel_data.data_type(), DataType::Float32);

        b.dispose().await.unwrap();
        a.dispose().await.unwrap();
        assert_eq!(cluster.transport().outlet_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_peer_mesh_converges() {
        let mut cluster = TestCluster::new("mesh", Topology::Peer2Peer);
        let mut nodes = Vec::new();
        for name in ["n1", "n2", "n3"] {
            nodes.push(cluster.join(name).await.unwrap());
        }
        for node in &nodes {
            assert_eq!(node.wait_for_nodes(3, Some(CONVERGE)).await.unwrap(), 3);
            assert_eq!(node.role().await.unwrap(), NodeRole::Peer);
            assert_eq!(node.leader().await.unwrap(), None);
        }
        // Peers hear each other's heartbeats
        let first = &nodes[0];
        assert!(
            wait_until(CONVERGE, || async move {
                first.stats().await.unwrap().heartbeats_received >= 2
            })
            .await
        );
        for mut node in nodes {
            node.dispose().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_large_session_fully_discovered() {
        let mut cluster = TestCluster::new("crowd", Topology::Peer2Peer).with_max_nodes(64);
        let mut a = cluster.join("a").await.unwrap();
        let mut silent = Vec::new();
        for i in 0..40u64 {
            silent.push(
                SilentNode::start(&cluster, NodeId::new(0x1000 + i), Topology::Peer2Peer)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(
            a.wait_for_nodes(41, Some(Duration::from_secs(5))).await.unwrap(),
            41
        );
        assert_eq!(a.snapshot().await.unwrap().node_count(), 41);

        for node in silent {
            node.crash().await.unwrap();
        }
        a.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_silent_node_evicted_once() {
        let mut cluster = TestCluster::new("evict", Topology::Peer2Peer);
        let mut a = cluster.join("a").await.unwrap();
        let mut events = a.subscribe();

        let ghost = SilentNode::start(&cluster, NodeId::new(0xdead), Topology::Peer2Peer)
            .await
            .unwrap();
        let ghost_id = ghost.node_id;
        a.wait_for_nodes(2, Some(CONVERGE)).await.unwrap();
        ghost.crash().await.unwrap();

        let left = next_event(&mut events, CONVERGE, |e| {
            matches!(e, SessionEvent::NodeLeft { node_id, .. } if *node_id == ghost_id)
        })
        .await;
        assert_eq!(
            left,
            Some(SessionEvent::NodeLeft {
                node_id: ghost_id,
                reason: LeaveReason::Timeout
            })
        );

        // Lingering discovery results must not bring it back
        let window = cluster.timing().node_timeout * 2;
        let again = collect_events(&mut events, window, |e| match e {
            SessionEvent::NodeLeft { node_id, .. } => *node_id == ghost_id,
            SessionEvent::NodeJoined { node } => node.id == ghost_id,
            _ => false,
        })
        .await;
        assert!(again.is_empty(), "ghost reappeared: {again:?}");
        assert_eq!(a.snapshot().await.unwrap().node_count(), 1);
        assert_eq!(a.stats().await.unwrap().evictions, 1);
        a.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leave_is_announced() {
        let mut cluster = TestCluster::new("depart", Topology::Peer2Peer);
        let mut a = cluster.join("a").await.unwrap();
        let mut b = cluster.join("b").await.unwrap();
        a.wait_for_nodes(2, Some(CONVERGE)).await.unwrap();
        b.wait_for_nodes(2, Some(CONVERGE)).await.unwrap();
        // Make sure a listens to b before b leaves
        let listener = &a;
        assert!(
            wait_until(CONVERGE, || async move {
                listener.stats().await.unwrap().heartbeats_received >= 1
            })
            .await
        );

        let mut events = a.subscribe();
        b.leave().await.unwrap();
        assert_eq!(b.state(), SessionState::Disconnected);

        let left = next_event(&mut events, CONVERGE, |e| {
            matches!(e, SessionEvent::NodeLeft { .. })
        })
        .await;
        assert_eq!(
            left,
            Some(SessionEvent::NodeLeft {
                node_id: b.node_id(),
                reason: LeaveReason::Announced
            })
        );
        assert_eq!(a.snapshot().await.unwrap().node_count(), 1);

        b.dispose().await.unwrap();
        a.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hybrid_reelects_after_leader_leaves() {
        let mut cluster = TestCluster::new("hybrid", Topology::Hybrid);
        let mut a = cluster.join("a").await.unwrap();
        assert_eq!(a.role().await.unwrap(), NodeRole::Leader);
        let mut b = cluster.join("b").await.unwrap();
        let mut c = cluster.join("c").await.unwrap();
        for node in [&b, &c] {
            node.wait_for_nodes(3, Some(CONVERGE)).await.unwrap();
            assert_eq!(node.leader().await.unwrap(), Some(a.node_id()));
        }

        a.leave().await.unwrap();

        // b started before c, so first-ready elects b everywhere
        let b_id = b.node_id();
        for node in [&b, &c] {
            assert!(
                wait_until(CONVERGE, || async move { node.leader().await.unwrap() == Some(b_id) }).await,
                "leader not re-elected"
            );
        }
        assert_eq!(b.role().await.unwrap(), NodeRole::Leader);
        assert!(b.stats().await.unwrap().elections >= 1);

        for node in [&mut a, &mut b, &mut c] {
            node.dispose().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_session_rejects_join() {
        let mut cluster = TestCluster::new("full", Topology::Peer2Peer).with_max_nodes(2);
        let mut a = cluster.join("a").await.unwrap();
        let mut b = cluster.join("b").await.unwrap();

        let mut c = cluster.session("c").unwrap();
        let err = c.join().await.unwrap_err();
        assert_eq!(err, SyncError::SessionFull { members: 2, max: 2 });
        assert_eq!(c.state(), SessionState::Error);
        assert_eq!(cluster.transport().outlet_count(), 2);
        assert_eq!(
            c.join().await.unwrap_err(),
            SyncError::SessionNotActive(SessionState::Error)
        );

        // Room again once a member leaves; the failed node recovers through leave
        b.leave().await.unwrap();
        let transport = cluster.transport();
        assert!(wait_until(CONVERGE, || async move { transport.outlet_count() == 1 }).await);
        c.leave().await.unwrap();
        assert_eq!(c.state(), SessionState::Disconnected);
        c.join().await.unwrap();
        assert!(c.is_active());

        for node in [&mut a, &mut b, &mut c] {
            node.dispose().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispose_twice_and_after_failure() {
        let mut cluster = TestCluster::new("dispose", Topology::Peer2Peer);
        let mut a = cluster.join("a").await.unwrap();
        let mut idle = cluster.session("never-joined").unwrap();

        a.dispose().await.unwrap();
        a.dispose().await.unwrap();
        idle.dispose().await.unwrap();
        idle.dispose().await.unwrap();
        assert!(matches!(a.join().await, Err(SyncError::ChannelClosed(_))));
        assert_eq!(cluster.transport().outlet_count(), 0);
    }
}
