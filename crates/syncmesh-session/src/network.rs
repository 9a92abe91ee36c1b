//! Network state - the in-process membership authority
//!
//! One writer (the session task) mutates it through synchronous methods.
//! Every mutator emits its event after applying the change, so a subscriber
//! reading the state on receipt sees what the event describes.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info};

use syncmesh_core::{EventBus, Node, NodeId, NodeRole, StreamId, Timestamp, Topology};

use crate::{LeaveReason, SessionEvent};

/// Membership, roles, leader and active streams of one session
#[derive(Debug)]
pub struct NetworkState {
    local: Node,
    topology: Topology,
    remotes: BTreeMap<NodeId, Node>,
    leader: Option<NodeId>,
    streams: BTreeSet<StreamId>,
    events: EventBus<SessionEvent>,
}

impl NetworkState {
    /// Create a new network state holding only the local node
    pub fn new(local: Node, topology: Topology, events: EventBus<SessionEvent>) -> Self {
        NetworkState {
            local,
            topology,
            remotes: BTreeMap::new(),
            leader: None,
            streams: BTreeSet::new(),
            events,
        }
    }

    // ===== QUERIES =====

    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    pub fn role(&self) -> &NodeRole {
        &self.local.role
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Number of members, the local node included
    pub fn node_count(&self) -> usize {
        self.remotes.len() + 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id == self.local.id || self.remotes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        if id == self.local.id {
            Some(&self.local)
        } else {
            self.remotes.get(&id)
        }
    }

    /// Every member, local node first
    pub fn nodes(&self) -> Vec<Node> {
        std::iter::once(self.local.clone())
            .chain(self.remotes.values().cloned())
            .collect()
    }

    pub fn remote_ids(&self) -> Vec<NodeId> {
        self.remotes.keys().copied().collect()
    }

    pub fn streams(&self) -> &BTreeSet<StreamId> {
        &self.streams
    }

    pub fn has_stream(&self, id: &StreamId) -> bool {
        self.streams.contains(id)
    }

    // ===== MEMBERSHIP =====

    /// Insert or merge a remote node observation
    ///
    /// Returns `true` when the node was new. Observations of the local node
    /// are ignored.
    pub fn update_node(&mut self, node: Node) -> bool {
        if node.id == self.local.id {
            return false;
        }
        let id = node.id;
        let (is_new, old_role, snapshot) = match self.remotes.get_mut(&id) {
            Some(existing) => {
                let old_role = existing.role.clone();
                existing.merge_from(&node);
                (false, Some(old_role), existing.clone())
            }
            None => {
                self.remotes.insert(id, node.clone());
                (true, None, node)
            }
        };

        if is_new {
            info!(node = %id, name = %snapshot.display_name, role = %snapshot.role, "node joined");
            self.events.emit(SessionEvent::NodeJoined {
                node: snapshot.clone(),
            });
        } else {
            self.events.emit(SessionEvent::NodeUpdated {
                node: snapshot.clone(),
            });
        }
        let role_changed = match old_role {
            Some(old) if old != snapshot.role => {
                debug!(node = %id, %old, new = %snapshot.role, "remote role changed");
                self.events.emit(SessionEvent::RoleChanged {
                    node_id: id,
                    old,
                    new: snapshot.role.clone(),
                });
                true
            }
            _ => false,
        };
        // An elected leader keeps its old role until it announces the new one
        if is_new || role_changed {
            self.track_leader(id, &snapshot.role);
        }
        is_new
    }

    /// Refresh `last_seen` of a known node
    pub fn touch(&mut self, id: NodeId, seen: Timestamp) -> bool {
        if id == self.local.id {
            self.local.touch(seen);
            return true;
        }
        match self.remotes.get_mut(&id) {
            Some(node) => {
                node.touch(seen);
                true
            }
            None => false,
        }
    }

    /// Remove a remote node; the local node cannot be removed
    pub fn remove_node(&mut self, id: NodeId, reason: LeaveReason) -> Option<Node> {
        let removed = self.remotes.remove(&id)?;
        info!(node = %id, %reason, "node left");
        self.events.emit(SessionEvent::NodeLeft {
            node_id: id,
            reason,
        });
        if self.leader == Some(id) {
            self.set_leader(None);
        }
        Some(removed)
    }

    /// Remove every remote node silent for longer than `timeout`
    ///
    /// Each evicted node is reported once; it is gone afterwards.
    pub fn evict_stale(&mut self, now: Timestamp, timeout: Duration) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .remotes
            .values()
            .filter(|n| now.duration_since(n.last_seen) > timeout)
            .map(|n| n.id)
            .collect();
        for id in &stale {
            self.remove_node(*id, LeaveReason::Timeout);
        }
        stale
    }

    // ===== TOPOLOGY & ROLES =====

    /// Returns whether the topology changed
    pub fn update_topology(&mut self, topology: Topology) -> bool {
        if self.topology == topology {
            return false;
        }
        let old = std::mem::replace(&mut self.topology, topology);
        info!(%old, new = %topology, "topology changed");
        self.events.emit(SessionEvent::TopologyChanged { old, new: topology });
        true
    }

    /// Set the local node's role; returns whether it changed
    pub fn update_role(&mut self, role: NodeRole) -> bool {
        if self.local.role == role {
            return false;
        }
        let old = std::mem::replace(&mut self.local.role, role.clone());
        info!(node = %self.local.id, %old, new = %role, "local role changed");
        self.events.emit(SessionEvent::RoleChanged {
            node_id: self.local.id,
            old,
            new: role.clone(),
        });
        self.track_leader(self.local.id, &role);
        true
    }

    /// Returns whether the leader changed
    pub fn set_leader(&mut self, leader: Option<NodeId>) -> bool {
        if self.leader == leader {
            return false;
        }
        let old = std::mem::replace(&mut self.leader, leader);
        debug!(?old, new = ?leader, "leader changed");
        self.events.emit(SessionEvent::LeaderChanged { old, new: leader });
        true
    }

    fn track_leader(&mut self, id: NodeId, role: &NodeRole) {
        if role.is_coordinating() {
            if self.leader != Some(id) {
                self.set_leader(Some(id));
            }
        } else if self.leader == Some(id) {
            self.set_leader(None);
        }
    }

    // ===== STREAMS =====

    pub fn add_stream(&mut self, id: StreamId) -> bool {
        if !self.streams.insert(id.clone()) {
            return false;
        }
        self.events.emit(SessionEvent::StreamAdded { stream: id });
        true
    }

    pub fn remove_stream(&mut self, id: &StreamId) -> bool {
        if !self.streams.remove(id) {
            return false;
        }
        self.events.emit(SessionEvent::StreamRemoved { stream: id.clone() });
        true
    }

    /// Forget every remote node and stream without per-item events
    ///
    /// Used when the local node leaves the session.
    pub fn reset(&mut self, role: NodeRole) {
        self.remotes.clear();
        self.streams.clear();
        self.leader = None;
        self.local.role = role;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncmesh_core::Envelope;
    use tokio::sync::broadcast;

    fn state() -> (NetworkState, broadcast::Receiver<Envelope<SessionEvent>>) {
        let bus = EventBus::new(64);
        let rx = bus.subscribe();
        let local = Node::new(NodeId::new(1), "local").with_role(NodeRole::Peer);
        (NetworkState::new(local, Topology::Peer2Peer, bus), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<Envelope<SessionEvent>>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            out.push(env.event);
        }
        out
    }

    #[test]
    fn test_update_node_insert_then_merge() {
        let (mut net, mut rx) = state();
        let remote = Node::new(NodeId::new(2), "remote").with_role(NodeRole::Peer);
        assert!(net.update_node(remote.clone()));
        assert!(!net.update_node(remote));
        assert_eq!(net.node_count(), 2);

        let events = drain(&mut rx);
        assert!(matches!(events[0], SessionEvent::NodeJoined { .. }));
        assert!(matches!(events[1], SessionEvent::NodeUpdated { .. }));
    }

    #[test]
    fn test_local_observation_ignored() {
        let (mut net, mut rx) = state();
        let echo = Node::new(NodeId::new(1), "echo").with_role(NodeRole::Server);
        assert!(!net.update_node(echo));
        assert_eq!(net.node_count(), 1);
        assert_eq!(net.role(), &NodeRole::Peer);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_state_readable_when_event_arrives() {
        let (mut net, mut rx) = state();
        net.update_node(Node::new(NodeId::new(7), "r"));
        let env = rx.try_recv().unwrap();
        if let SessionEvent::NodeJoined { node } = env.event {
            assert!(net.contains(node.id));
        } else {
            panic!("expected NodeJoined");
        }
    }

    #[test]
    fn test_unchanged_topology_and_role_are_silent() {
        let (mut net, mut rx) = state();
        assert!(!net.update_topology(Topology::Peer2Peer));
        assert!(!net.update_role(NodeRole::Peer));
        assert!(drain(&mut rx).is_empty());

        assert!(net.update_topology(Topology::Hierarchical));
        assert!(net.update_role(NodeRole::Server));
        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            SessionEvent::TopologyChanged { old: Topology::Peer2Peer, new: Topology::Hierarchical }
        ));
        assert!(matches!(events[1], SessionEvent::RoleChanged { .. }));
        assert!(matches!(
            events[2],
            SessionEvent::LeaderChanged { old: None, new: Some(id) } if id == NodeId::new(1)
        ));
    }

    #[test]
    fn test_coordinating_remote_becomes_leader() {
        let (mut net, _rx) = state();
        net.update_node(Node::new(NodeId::new(3), "srv").with_role(NodeRole::Server));
        assert_eq!(net.leader(), Some(NodeId::new(3)));

        net.update_node(Node::new(NodeId::new(3), "srv").with_role(NodeRole::Client));
        assert_eq!(net.leader(), None);
    }

    #[test]
    fn test_evict_reports_each_node_once() {
        let (mut net, mut rx) = state();
        let mut stale = Node::new(NodeId::new(2), "stale").with_role(NodeRole::Leader);
        stale.last_seen = Timestamp::from_millis(1_000);
        let mut fresh = Node::new(NodeId::new(3), "fresh");
        fresh.last_seen = Timestamp::from_millis(9_000);
        net.update_node(stale);
        net.update_node(fresh);
        drain(&mut rx);

        let now = Timestamp::from_millis(10_000);
        let evicted = net.evict_stale(now, Duration::from_secs(5));
        assert_eq!(evicted, vec![NodeId::new(2)]);
        assert!(net.evict_stale(now, Duration::from_secs(5)).is_empty());
        assert_eq!(net.leader(), None);

        let left: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::NodeLeft { .. }))
            .collect();
        assert_eq!(
            left,
            vec![SessionEvent::NodeLeft {
                node_id: NodeId::new(2),
                reason: LeaveReason::Timeout
            }]
        );
    }

    #[test]
    fn test_streams() {
        let (mut net, mut rx) = state();
        let id = StreamId::from("eeg");
        assert!(net.add_stream(id.clone()));
        assert!(!net.add_stream(id.clone()));
        assert!(net.remove_stream(&id));
        assert!(!net.remove_stream(&id));
        assert_eq!(drain(&mut rx).len(), 2);
    }
}
