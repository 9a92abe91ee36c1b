//! Coordination protocol
//!
//! Each node publishes one coordination stream per session: a single string
//! channel named [`COORDINATION_STREAM`], tagged with the session id. Its
//! description advertises the node (id, name, role, topology, capabilities,
//! start time, election roll) so a plain discovery hit is enough to learn a
//! member. Samples on the stream are JSON [`CoordinationMessage`]s.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use syncmesh_core::{
    Capability, DataType, Node, NodeId, NodeMetadata, NodeRole, ParticipationMode, SessionId,
    StreamConfig, SyncError, SyncResult, Timestamp, Topology,
};
use syncmesh_transport::{desc_keys, Predicate, StreamInfo};

/// Name of the per-node coordination stream
pub const COORDINATION_STREAM: &str = "coordination";

/// Content type of the coordination stream
pub const COORDINATION_CONTENT_TYPE: &str = "coordination";

/// Description keys of a node advertisement
pub mod node_keys {
    pub const NODE_ID: &str = "node_id";
    pub const NODE_NAME: &str = "node_name";
    pub const ROLE: &str = "role";
    pub const TOPOLOGY: &str = "topology";
    pub const CAPABILITIES: &str = "capabilities";
    pub const STARTED_AT: &str = "started_at";
    pub const ROLL: &str = "roll";
}

/// Predicate matching every coordination stream of a session
pub fn network_predicate(session_id: &SessionId) -> SyncResult<Predicate> {
    Predicate::name(COORDINATION_STREAM)?.and_eq(desc_keys::SESSION_ID, session_id.as_str())
}

/// Predicate matching one data stream across the nodes of a session
pub fn data_stream_predicate(session_id: &SessionId, name: &str) -> SyncResult<Predicate> {
    Predicate::name(name)?.and_eq(desc_keys::SESSION_ID, session_id.as_str())
}

/// Configuration of the coordination stream for a heartbeat interval
pub fn coordination_stream_config(heartbeat_interval: Duration) -> SyncResult<StreamConfig> {
    let rate = 1.0 / heartbeat_interval.as_secs_f64().max(0.001);
    StreamConfig::builder(COORDINATION_STREAM)
        .channels(1)
        .sample_rate(rate)
        .data_type(DataType::String)
        .participation_mode(ParticipationMode::Both)
        .content_type(COORDINATION_CONTENT_TYPE)
        .build()
}

/// What a node tells the others about itself
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub node_id: NodeId,
    pub name: String,
    pub role: NodeRole,
    pub topology: Topology,
    pub capabilities: BTreeSet<Capability>,
    pub started_at: Option<Timestamp>,
    pub roll: Option<f64>,
}

impl NodeAnnouncement {
    pub fn from_node(node: &Node, topology: Topology) -> Self {
        NodeAnnouncement {
            node_id: node.id,
            name: node.display_name.clone(),
            role: node.role.clone(),
            topology,
            capabilities: node.capabilities.clone(),
            started_at: node.started_at,
            roll: node.metadata.roll,
        }
    }

    /// Node record as observed at `seen`
    pub fn to_node(&self, seen: Timestamp) -> Node {
        let mut node = Node::new(self.node_id, self.name.clone())
            .with_role(self.role.clone())
            .with_capabilities(self.capabilities.iter().cloned())
            .with_metadata(NodeMetadata {
                roll: self.roll,
                ..NodeMetadata::default()
            });
        node.started_at = self.started_at;
        node.last_seen = seen;
        node
    }

    /// Description entries advertising this node
    pub fn to_desc(&self) -> Vec<(String, String)> {
        let capabilities = self
            .capabilities
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut desc = vec![
            (node_keys::NODE_ID.to_string(), self.node_id.to_string()),
            (node_keys::NODE_NAME.to_string(), self.name.clone()),
            (node_keys::ROLE.to_string(), self.role.to_string()),
            (node_keys::TOPOLOGY.to_string(), self.topology.to_string()),
            (node_keys::CAPABILITIES.to_string(), capabilities),
        ];
        if let Some(started_at) = self.started_at {
            desc.push((
                node_keys::STARTED_AT.to_string(),
                started_at.as_micros().to_string(),
            ));
        }
        if let Some(roll) = self.roll {
            desc.push((node_keys::ROLL.to_string(), roll.to_string()));
        }
        desc
    }

    /// Decode the advertisement carried by a coordination stream
    pub fn from_info(info: &StreamInfo) -> SyncResult<Self> {
        let required = |key: &str| {
            info.desc
                .get(key)
                .cloned()
                .ok_or_else(|| SyncError::InvalidConfig(format!("{} lacks {key}", info.uid)))
        };
        let capabilities = required(node_keys::CAPABILITIES)?
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<SyncResult<BTreeSet<Capability>>>()?;
        let started_at = match info.desc.get(node_keys::STARTED_AT) {
            Some(s) => Some(Timestamp::from_micros(s.parse().map_err(|_| {
                SyncError::InvalidConfig(format!("invalid started_at: {s:?}"))
            })?)),
            None => None,
        };
        let roll = match info.desc.get(node_keys::ROLL) {
            Some(s) => Some(
                s.parse::<f64>()
                    .map_err(|_| SyncError::InvalidConfig(format!("invalid roll: {s:?}")))?,
            ),
            None => None,
        };
        Ok(NodeAnnouncement {
            node_id: required(node_keys::NODE_ID)?.parse()?,
            name: required(node_keys::NODE_NAME)?,
            role: required(node_keys::ROLE)?.parse()?,
            topology: required(node_keys::TOPOLOGY)?.parse()?,
            capabilities,
            started_at,
            roll,
        })
    }
}

/// Messages carried on the coordination stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinationMessage {
    Heartbeat { node: NodeAnnouncement },
    /// The sender is leaving the session
    Leaving { node_id: NodeId },
    RoleChanged { node_id: NodeId, role: NodeRole },
}

impl CoordinationMessage {
    pub fn sender(&self) -> NodeId {
        match self {
            CoordinationMessage::Heartbeat { node } => node.node_id,
            CoordinationMessage::Leaving { node_id }
            | CoordinationMessage::RoleChanged { node_id, .. } => *node_id,
        }
    }

    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self)
            .map_err(|e| SyncError::Transport(format!("encode coordination message: {e}")))
    }

    pub fn decode(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::Transport(format!("decode coordination message: {e}")))
    }
}
