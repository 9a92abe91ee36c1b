//! Node model
//!
//! A node is one participating process. Its well-known metadata is typed;
//! anything else travels in the residual extension map.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{NodeId, SyncError, Timestamp};

/// Role of a node within its session
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Discovering,
    Peer,
    Client,
    Server,
    Leader,
    Coordinator,
    Custom(String),
}

impl NodeRole {
    /// Roles that aggregate the session and satisfy "a coordinator is known"
    pub fn is_coordinating(&self) -> bool {
        matches!(self, NodeRole::Server | NodeRole::Leader | NodeRole::Coordinator)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Discovering => f.write_str("discovering"),
            NodeRole::Peer => f.write_str("peer"),
            NodeRole::Client => f.write_str("client"),
            NodeRole::Server => f.write_str("server"),
            NodeRole::Leader => f.write_str("leader"),
            NodeRole::Coordinator => f.write_str("coordinator"),
            NodeRole::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "discovering" => NodeRole::Discovering,
            "peer" => NodeRole::Peer,
            "client" => NodeRole::Client,
            "server" => NodeRole::Server,
            "leader" => NodeRole::Leader,
            "coordinator" => NodeRole::Coordinator,
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => NodeRole::Custom(name.to_string()),
                _ => return Err(SyncError::InvalidConfig(format!("unknown role: {s:?}"))),
            },
        })
    }
}

/// Something a node advertises it can do
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// May be elected coordinator
    Coordinator,
    /// Produces data streams
    DataSource,
    /// Consumes data streams
    DataSink,
    Custom(String),
}

impl Capability {
    /// Default advertisement: every role is possible
    pub fn all() -> BTreeSet<Capability> {
        [Capability::Coordinator, Capability::DataSource, Capability::DataSink]
            .into_iter()
            .collect()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Coordinator => f.write_str("coordinator"),
            Capability::DataSource => f.write_str("data_source"),
            Capability::DataSink => f.write_str("data_sink"),
            Capability::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl FromStr for Capability {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "coordinator" => Capability::Coordinator,
            "data_source" => Capability::DataSource,
            "data_sink" => Capability::DataSink,
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Capability::Custom(name.to_string()),
                _ => {
                    return Err(SyncError::InvalidConfig(format!(
                        "unknown capability: {s:?}"
                    )))
                }
            },
        })
    }
}

/// Node metadata: typed well-known fields plus an extension map
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Locally generated election roll (random-roll strategy)
    pub roll: Option<f64>,
    pub hostname: Option<String>,
    /// Transport address of the node's coordination stream
    pub address: Option<String>,
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
}

impl NodeMetadata {
    /// Merge `other` into `self`; fields present in `other` win
    pub fn merge(&mut self, other: &NodeMetadata) {
        if other.roll.is_some() {
            self.roll = other.roll;
        }
        if other.hostname.is_some() {
            self.hostname = other.hostname.clone();
        }
        if other.address.is_some() {
            self.address = other.address.clone();
        }
        for (k, v) in &other.extensions {
            self.extensions.insert(k.clone(), v.clone());
        }
    }
}

/// A participant in a coordination session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub display_name: String,
    pub role: NodeRole,
    pub capabilities: BTreeSet<Capability>,
    pub metadata: NodeMetadata,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub last_seen: Timestamp,
}

impl Node {
    /// Create a node record stamped now, still discovering
    pub fn new(id: NodeId, display_name: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Node {
            id,
            display_name: display_name.into(),
            role: NodeRole::Discovering,
            capabilities: BTreeSet::new(),
            metadata: NodeMetadata::default(),
            created_at: now,
            started_at: None,
            last_seen: now,
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_started_at(mut self, started_at: Timestamp) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Time used for first-ready ordering: `started_at`, else `created_at`
    pub fn ready_at(&self) -> Timestamp {
        self.started_at.unwrap_or(self.created_at)
    }

    /// Merge a fresher observation of the same node into this record
    ///
    /// `last_seen` never moves backwards.
    pub fn merge_from(&mut self, other: &Node) {
        debug_assert_eq!(self.id, other.id);
        self.display_name = other.display_name.clone();
        self.role = other.role.clone();
        if !other.capabilities.is_empty() {
            self.capabilities = other.capabilities.clone();
        }
        self.metadata.merge(&other.metadata);
        if other.started_at.is_some() {
            self.started_at = other.started_at;
        }
        self.last_seen = self.last_seen.max(other.last_seen);
    }

    /// Refresh `last_seen`
    pub fn touch(&mut self, seen: Timestamp) {
        self.last_seen = self.last_seen.max(seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        for role in [
            NodeRole::Discovering,
            NodeRole::Peer,
            NodeRole::Client,
            NodeRole::Server,
            NodeRole::Leader,
            NodeRole::Coordinator,
            NodeRole::Custom("relay".into()),
        ] {
            assert_eq!(role.to_string().parse::<NodeRole>().unwrap(), role);
        }
        assert!("custom:".parse::<NodeRole>().is_err());
        assert!("boss".parse::<NodeRole>().is_err());
    }

    #[test]
    fn test_coordinating_roles() {
        assert!(NodeRole::Server.is_coordinating());
        assert!(NodeRole::Leader.is_coordinating());
        assert!(NodeRole::Coordinator.is_coordinating());
        assert!(!NodeRole::Client.is_coordinating());
        assert!(!NodeRole::Peer.is_coordinating());
    }

    #[test]
    fn test_merge_keeps_latest_last_seen() {
        let mut a = Node::new(NodeId(1), "a");
        a.last_seen = Timestamp::from_millis(2_000);

        let mut fresher = Node::new(NodeId(1), "a-renamed").with_role(NodeRole::Client);
        fresher.last_seen = Timestamp::from_millis(1_000);
        fresher.metadata.roll = Some(0.25);

        a.merge_from(&fresher);
        assert_eq!(a.display_name, "a-renamed");
        assert_eq!(a.role, NodeRole::Client);
        assert_eq!(a.metadata.roll, Some(0.25));
        assert_eq!(a.last_seen, Timestamp::from_millis(2_000));
    }

    #[test]
    fn test_ready_at_falls_back_to_created() {
        let n = Node::new(NodeId(3), "n");
        assert_eq!(n.ready_at(), n.created_at);
        let started = n.clone().with_started_at(Timestamp::from_millis(5));
        assert_eq!(started.ready_at(), Timestamp::from_millis(5));
    }
}
