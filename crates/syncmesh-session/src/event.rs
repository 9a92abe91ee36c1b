//! Session events

use std::fmt;

use syncmesh_core::{Node, NodeId, NodeRole, SessionId, SessionState, StreamId, Topology};

/// Why a node left the membership
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveReason {
    /// Silent for longer than the node timeout
    Timeout,
    /// The node announced its departure
    Announced,
    /// Removed through the membership API
    Removed,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LeaveReason::Timeout => "timeout",
            LeaveReason::Announced => "announced",
            LeaveReason::Removed => "removed",
        })
    }
}

/// Published on a session's event bus
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    SessionStarted {
        session_id: SessionId,
        node_id: NodeId,
        role: NodeRole,
        topology: Topology,
    },
    SessionStopped {
        session_id: SessionId,
        node_id: NodeId,
    },
    StateChanged {
        old: SessionState,
        new: SessionState,
    },
    /// A node entered the membership
    NodeJoined { node: Node },
    /// A known node was observed again with changed or refreshed data
    NodeUpdated { node: Node },
    NodeLeft { node_id: NodeId, reason: LeaveReason },
    RoleChanged {
        node_id: NodeId,
        old: NodeRole,
        new: NodeRole,
    },
    TopologyChanged { old: Topology, new: Topology },
    LeaderChanged {
        old: Option<NodeId>,
        new: Option<NodeId>,
    },
    StreamAdded { stream: StreamId },
    StreamRemoved { stream: StreamId },
}
