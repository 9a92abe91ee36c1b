//! Requests from session handles to the session task

use tokio::sync::oneshot;

use syncmesh_core::{Node, NodeId, NodeRole, SessionState, StreamConfig, StreamId, SyncResult, Topology};
use syncmesh_stream::{BatchedSample, StreamStats};
use syncmesh_transport::SampleData;

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// Session counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub discovery_ticks: u64,
    pub evictions: u64,
    pub elections: u64,
    /// Coordination samples that failed to decode
    pub messages_rejected: u64,
}

/// Point-in-time view of a session
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub node_id: NodeId,
    pub role: NodeRole,
    pub topology: Topology,
    pub leader: Option<NodeId>,
    /// Every member, local node first
    pub nodes: Vec<Node>,
    pub streams: Vec<StreamId>,
    pub stats: SessionStats,
}

impl SessionSnapshot {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.node_id)
    }
}

/// Work for the session task
#[derive(Debug)]
pub(crate) enum SessionRequest {
    Join {
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
    CreateDataStream {
        config: StreamConfig,
        reply: Reply<StreamId>,
    },
    DestroyDataStream {
        id: StreamId,
        reply: Reply<()>,
    },
    PushSample {
        stream: StreamId,
        data: SampleData,
        timestamp: Option<f64>,
        reply: Reply<()>,
    },
    TakeBatches {
        stream: StreamId,
        reply: Reply<Vec<BatchedSample>>,
    },
    StreamStats {
        stream: StreamId,
        reply: Reply<StreamStats>,
    },
    /// Pause or resume every data stream
    SetPaused {
        paused: bool,
        flush_before_resume: bool,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Leave, release the discovery engine and end the task
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
