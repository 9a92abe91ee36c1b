//! The session task
//!
//! Owns the network state, the discovery engine, the coordination stream and
//! every data stream of one session. Requests, heartbeat ticks, discovery
//! events and coordination messages are handled one at a time, so nothing
//! here needs a lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use syncmesh_core::{
    ElectionStrategy, EventBus, Node, NodeId, NodeMetadata, NodeRole, Resource, ResolverId,
    SessionConfig, SessionState, StreamConfig, StreamId, SyncError, SyncResult, Timestamp,
    Topology,
};
use syncmesh_discovery::{DiscoveryEngine, DiscoveryEvent};
use syncmesh_stream::{BatchedSample, DataStream, WorkerOptions};
use syncmesh_transport::{SampleData, SharedTransport, StreamHandle};

use crate::election::{generate_roll, Election};
use crate::protocol::{
    coordination_stream_config, data_stream_predicate, network_predicate, CoordinationMessage,
    NodeAnnouncement, COORDINATION_STREAM,
};
use crate::{LeaveReason, NetworkState, SessionEvent, SessionRequest, SessionSnapshot, SessionStats};

/// How often delivered coordination messages are processed
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

struct ManagedStream {
    stream: DataStream,
    /// Continuous resolver feeding inlets of a consuming stream
    resolver: Option<ResolverId>,
    /// Wired inlets: outlet address -> source id
    wired: HashMap<String, String>,
}

pub(crate) struct SessionActor {
    config: SessionConfig,
    transport: SharedTransport,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    members_tx: watch::Sender<usize>,
    events: EventBus<SessionEvent>,
    network: NetworkState,
    discovery: DiscoveryEngine,
    election: Box<dyn Election>,
    coordination: Option<DataStream>,
    network_resolver: Option<ResolverId>,
    /// Coordination inlets: peer -> outlet address
    peers: HashMap<NodeId, String>,
    /// Recently departed nodes and when they left
    departed: HashMap<NodeId, Timestamp>,
    streams: BTreeMap<StreamId, ManagedStream>,
    stats: SessionStats,
}

impl SessionActor {
    pub(crate) fn new(
        config: SessionConfig,
        transport: SharedTransport,
        discovery: DiscoveryEngine,
        election: Box<dyn Election>,
        events: EventBus<SessionEvent>,
        state_tx: watch::Sender<SessionState>,
        members_tx: watch::Sender<usize>,
    ) -> Self {
        let local = Node::new(config.node_id(), config.node_name())
            .with_capabilities(config.capabilities().iter().cloned());
        let network = NetworkState::new(local, config.topology(), events.clone());
        SessionActor {
            config,
            transport,
            state: SessionState::Disconnected,
            state_tx,
            members_tx,
            events,
            network,
            discovery,
            election,
            coordination: None,
            network_resolver: None,
            peers: HashMap::new(),
            departed: HashMap::new(),
            streams: BTreeMap::new(),
            stats: SessionStats::default(),
        }
    }

    pub(crate) async fn run(mut self, mut requests: mpsc::Receiver<SessionRequest>) {
        let mut discovery_events = self.discovery.events().subscribe();
        let mut heartbeat = tokio::time::interval(self.config.coordination().heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pump = tokio::time::interval(PUMP_INTERVAL);
        pump.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(session = %self.config.session_id(), node = %self.network.local_id(), "session task started");
        loop {
            let active = self.state == SessionState::Active;
            tokio::select! {
                request = requests.recv() => match request {
                    Some(SessionRequest::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request).await,
                    None => {
                        // Every handle dropped
                        self.shutdown().await;
                        break;
                    }
                },
                _ = heartbeat.tick(), if active => self.on_heartbeat().await,
                _ = pump.tick(), if active => self.pump_coordination().await,
                event = discovery_events.recv() => match event {
                    Ok(envelope) if self.state == SessionState::Active => {
                        self.on_discovery(envelope.event).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session lagging behind discovery events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(session = %self.config.session_id(), "session task stopped");
    }

    async fn handle(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Join { reply } => {
                let _ = reply.send(self.join().await);
            }
            SessionRequest::Leave { reply } => {
                let _ = reply.send(self.leave().await);
            }
            SessionRequest::CreateDataStream { config, reply } => {
                let _ = reply.send(self.create_data_stream(config).await);
            }
            SessionRequest::DestroyDataStream { id, reply } => {
                let _ = reply.send(self.destroy_data_stream(id).await);
            }
            SessionRequest::PushSample {
                stream,
                data,
                timestamp,
                reply,
            } => {
                let result = match self.streams.get(&stream) {
                    Some(managed) => managed.stream.push_sample(data, timestamp).await,
                    None => Err(SyncError::StreamNotFound(stream)),
                };
                let _ = reply.send(result);
            }
            SessionRequest::TakeBatches { stream, reply } => {
                let result = match self.streams.get_mut(&stream) {
                    Some(managed) => Ok(managed.stream.take_batches()),
                    None => Err(SyncError::StreamNotFound(stream)),
                };
                let _ = reply.send(result);
            }
            SessionRequest::StreamStats { stream, reply } => {
                let result = match self.streams.get(&stream) {
                    Some(managed) => managed.stream.stats().await,
                    None => Err(SyncError::StreamNotFound(stream)),
                };
                let _ = reply.send(result);
            }
            SessionRequest::SetPaused {
                paused,
                flush_before_resume,
                reply,
            } => {
                let _ = reply.send(self.set_paused(paused, flush_before_resume).await);
            }
            SessionRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionRequest::Shutdown { .. } => {}
        }
    }

    // ===== STATE =====

    fn set_state(&mut self, new: SessionState) -> SyncResult<()> {
        let old = self.state;
        if old == new {
            return Ok(());
        }
        if !old.can_transition_to(new) {
            return Err(SyncError::SessionNotActive(old));
        }
        self.state = new;
        info!(session = %self.config.session_id(), %old, %new, "session state changed");
        self.state_tx.send_replace(new);
        self.events.emit(SessionEvent::StateChanged { old, new });
        Ok(())
    }

    fn ensure_active(&self) -> SyncResult<()> {
        if self.state != SessionState::Active {
            return Err(SyncError::SessionNotActive(self.state));
        }
        Ok(())
    }

    fn publish_members(&self) {
        let count = match self.state {
            SessionState::Active => self.network.node_count(),
            _ => 0,
        };
        self.members_tx.send_if_modified(|current| {
            if *current == count {
                return false;
            }
            *current = count;
            true
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            node_id: self.network.local_id(),
            role: self.network.role().clone(),
            topology: self.network.topology(),
            leader: self.network.leader(),
            nodes: self.network.nodes(),
            streams: self.streams.keys().cloned().collect(),
            stats: self.stats.clone(),
        }
    }

    fn local_node(&self) -> Node {
        let roll = match self.config.election() {
            ElectionStrategy::RandomRoll => Some(generate_roll()),
            ElectionStrategy::FirstReady => None,
        };
        Node::new(self.config.node_id(), self.config.node_name())
            .with_capabilities(self.config.capabilities().iter().cloned())
            .with_started_at(Timestamp::now())
            .with_metadata(NodeMetadata {
                roll,
                ..NodeMetadata::default()
            })
    }

    fn announcement(&self) -> NodeAnnouncement {
        NodeAnnouncement::from_node(self.network.local(), self.network.topology())
    }

    // ===== JOIN / LEAVE =====

    async fn join(&mut self) -> SyncResult<()> {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::Active => {
                debug!(session = %self.config.session_id(), "already joined");
                return Ok(());
            }
            other => return Err(SyncError::SessionNotActive(other)),
        }
        self.set_state(SessionState::Discovering)?;
        match self.try_join().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(session = %self.config.session_id(), error = %err, "join failed");
                self.release_coordination().await;
                self.network.reset(NodeRole::Discovering);
                let _ = self.set_state(SessionState::Error);
                self.publish_members();
                Err(err)
            }
        }
    }

    async fn try_join(&mut self) -> SyncResult<()> {
        if !self.discovery.resource_state().is_running() {
            self.discovery.initialize().await?;
        }
        let session_id = self.config.session_id().clone();
        let local_id = self.config.node_id();
        let predicate = network_predicate(&session_id)?;
        let wait = self.discovery.config().resolve_wait;
        let found = self.discovery.resolve_once(&predicate, wait).await?;

        let remotes: Vec<(NodeAnnouncement, StreamHandle)> = latest_announcements(found)
            .into_iter()
            .filter(|(ann, _)| ann.node_id != local_id)
            .collect();

        self.network = NetworkState::new(self.local_node(), self.config.topology(), self.events.clone());
        let joined = !remotes.is_empty();
        let topology = if joined {
            self.set_state(SessionState::Joining)?;
            let max = self.config.coordination().max_nodes();
            if remotes.len() >= max {
                return Err(SyncError::SessionFull {
                    members: remotes.len(),
                    max,
                });
            }
            // The coordinator's view of the topology wins over any other
            let topology = remotes
                .iter()
                .find(|(a, _)| a.role.is_coordinating())
                .unwrap_or(&remotes[0])
                .0
                .topology;
            self.network.update_topology(topology);
            self.network.update_role(topology.joiner_role());
            let now = Timestamp::now();
            for (ann, handle) in &remotes {
                let seen = handle.observed_at.min(now);
                self.network.update_node(ann.to_node(seen));
            }
            info!(session = %session_id, %topology, members = remotes.len(), "joining network");
            topology
        } else {
            let topology = self.config.topology();
            self.network.update_topology(topology);
            self.network.update_role(topology.creator_role());
            info!(session = %session_id, %topology, "no network found, creating");
            topology
        };

        self.open_coordination().await?;
        for (ann, handle) in remotes {
            if self.should_connect(&ann.role) {
                self.wire_peer(ann.node_id, handle).await;
            }
        }
        if joined && topology.supports_election() && self.network.leader().is_none() {
            self.run_election().await?;
        }

        let resolver = self.discovery.start_continuous_discovery(predicate).await?;
        self.network_resolver = Some(resolver);
        self.send(CoordinationMessage::Heartbeat {
            node: self.announcement(),
        })
        .await?;
        self.stats.heartbeats_sent += 1;

        self.set_state(SessionState::Active)?;
        self.publish_members();
        self.events.emit(SessionEvent::SessionStarted {
            session_id,
            node_id: local_id,
            role: self.network.role().clone(),
            topology,
        });
        Ok(())
    }

    async fn open_coordination(&mut self) -> SyncResult<()> {
        let config = coordination_stream_config(self.config.coordination().heartbeat_interval())?;
        let mut stream = DataStream::new(
            config,
            self.network.local_id().to_string(),
            Arc::clone(&self.transport),
        )
        .with_session(self.config.session_id().as_str())
        .with_options(WorkerOptions::default());
        for (key, value) in self.announcement().to_desc() {
            stream = stream.with_description(key, value);
        }
        if let Err(err) = stream.start().await {
            let _ = stream.dispose().await;
            return Err(err);
        }
        self.coordination = Some(stream);
        Ok(())
    }

    async fn release_coordination(&mut self) {
        if let Some(resolver) = self.network_resolver.take() {
            self.discovery.stop_continuous_discovery(resolver);
        }
        if let Some(mut stream) = self.coordination.take() {
            if let Err(err) = stream.dispose().await {
                warn!(error = %err, "coordination stream cleanup failed");
            }
        }
        self.peers.clear();
        self.departed.clear();
    }

    async fn leave(&mut self) -> SyncResult<()> {
        match self.state {
            SessionState::Disconnected | SessionState::Leaving => return Ok(()),
            _ => {}
        }
        self.set_state(SessionState::Leaving)?;

        let streams = std::mem::take(&mut self.streams);
        for (id, mut managed) in streams {
            if let Some(resolver) = managed.resolver {
                self.discovery.stop_continuous_discovery(resolver);
            }
            if let Err(err) = managed.stream.dispose().await {
                warn!(stream = %id, error = %err, "data stream cleanup failed, continuing");
            }
            self.network.remove_stream(&id);
        }

        if self.coordination.is_some() {
            let leaving = CoordinationMessage::Leaving {
                node_id: self.network.local_id(),
            };
            if let Err(err) = self.send(leaving).await {
                warn!(error = %err, "departure announcement failed");
            }
        }
        self.release_coordination().await;

        self.events.emit(SessionEvent::SessionStopped {
            session_id: self.config.session_id().clone(),
            node_id: self.network.local_id(),
        });
        self.network.reset(NodeRole::Discovering);
        self.set_state(SessionState::Disconnected)?;
        self.publish_members();
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.leave().await {
            warn!(error = %err, "leave during shutdown failed");
        }
        if let Err(err) = self.discovery.dispose().await {
            warn!(error = %err, "discovery cleanup failed");
        }
    }

    // ===== COORDINATION =====

    async fn send(&self, message: CoordinationMessage) -> SyncResult<()> {
        let stream = self
            .coordination
            .as_ref()
            .ok_or_else(|| SyncError::StreamUnavailable(COORDINATION_STREAM.into()))?;
        let text = message.encode()?;
        stream.push_sample(SampleData::from(vec![text]), None).await
    }

    /// Connection policy per topology
    ///
    /// Peer-to-peer and hybrid nodes listen to every peer. In a hierarchical
    /// session the coordinating node listens to all clients and a client
    /// listens to the coordinator only.
    fn should_connect(&self, remote_role: &NodeRole) -> bool {
        match self.network.topology() {
            Topology::Peer2Peer | Topology::Hybrid => true,
            Topology::Hierarchical => {
                self.network.role().is_coordinating() || remote_role.is_coordinating()
            }
        }
    }

    async fn wire_peer(&mut self, id: NodeId, handle: StreamHandle) {
        let Some(stream) = self.coordination.as_ref() else {
            return;
        };
        let address = handle.address().to_string();
        match self.peers.get(&id) {
            Some(wired) if *wired == address => return,
            Some(_) => {
                // Peer republished its coordination stream
                if let Err(err) = stream.remove_inlet(handle.source_id()).await {
                    debug!(node = %id, error = %err, "stale coordination inlet not removed");
                }
            }
            None => {}
        }
        match stream.add_inlet(handle).await {
            Ok(()) => {
                debug!(node = %id, %address, "listening to peer");
                self.peers.insert(id, address);
            }
            Err(err) => warn!(node = %id, error = %err, "could not connect to peer"),
        }
    }

    async fn unwire_peer(&mut self, id: NodeId) {
        if self.peers.remove(&id).is_none() {
            return;
        }
        if let Some(stream) = self.coordination.as_ref() {
            if let Err(err) = stream.remove_inlet(&id.to_string()).await {
                debug!(node = %id, error = %err, "coordination inlet not removed");
            }
        }
    }

    async fn pump_coordination(&mut self) {
        let samples: Vec<BatchedSample> = match self.coordination.as_mut() {
            Some(stream) => stream.take_batches(),
            None => return,
        };
        if samples.is_empty() {
            return;
        }
        for sample in samples {
            let Some(text) = sample.channel_data.as_text() else {
                self.stats.messages_rejected += 1;
                continue;
            };
            match CoordinationMessage::decode(text) {
                Ok(message) => self.on_message(message).await,
                Err(err) => {
                    self.stats.messages_rejected += 1;
                    debug!(source = %sample.source_id, error = %err, "coordination message rejected");
                }
            }
        }
        self.publish_members();
        self.ensure_leader().await;
    }

    async fn on_message(&mut self, message: CoordinationMessage) {
        let sender = message.sender();
        if sender == self.network.local_id() {
            return;
        }
        let now = Timestamp::now();
        match message {
            CoordinationMessage::Heartbeat { node } => {
                self.stats.heartbeats_received += 1;
                self.departed.remove(&sender);
                self.network.update_node(node.to_node(now));
            }
            CoordinationMessage::Leaving { node_id } => {
                if self.network.remove_node(node_id, LeaveReason::Announced).is_some() {
                    self.departed.insert(node_id, now);
                }
                self.unwire_peer(node_id).await;
            }
            CoordinationMessage::RoleChanged { node_id, role } => {
                if let Some(known) = self.network.node(node_id) {
                    let mut updated = known.clone();
                    updated.role = role;
                    updated.last_seen = now;
                    self.network.update_node(updated);
                }
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        let now = Timestamp::now();
        let local_id = self.network.local_id();
        self.network.touch(local_id, now);

        let timeout = self.config.coordination().node_timeout();
        let evicted = self.network.evict_stale(now, timeout);
        for id in &evicted {
            self.stats.evictions += 1;
            self.departed.insert(*id, now);
            self.unwire_peer(*id).await;
        }
        self.departed
            .retain(|_, left| now.duration_since(*left) <= timeout);

        let heartbeat = CoordinationMessage::Heartbeat {
            node: self.announcement(),
        };
        match self.send(heartbeat).await {
            Ok(()) => self.stats.heartbeats_sent += 1,
            Err(err) => warn!(error = %err, "heartbeat not sent"),
        }
        if !evicted.is_empty() {
            self.publish_members();
            self.ensure_leader().await;
        }
    }

    async fn on_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeriodicDiscovery {
                resolver_id,
                handles,
                ..
            } => {
                if Some(resolver_id) == self.network_resolver {
                    self.on_network_discovery(handles).await;
                } else {
                    self.on_stream_discovery(resolver_id, handles).await;
                }
            }
            DiscoveryEvent::DiscoveryError { resolver_id, reason } => {
                debug!(resolver = ?resolver_id, %reason, "discovery error");
            }
            _ => {}
        }
    }

    async fn on_network_discovery(&mut self, handles: Vec<StreamHandle>) {
        self.stats.discovery_ticks += 1;
        let local_id = self.network.local_id();
        let window = self.config.coordination().node_timeout();
        let mut present = BTreeSet::new();

        for (ann, handle) in latest_announcements(handles) {
            if ann.node_id == local_id {
                continue;
            }
            // Lingering results of a node that already left
            if let Some(left) = self.departed.get(&ann.node_id) {
                if handle.observed_at.duration_since(*left) <= window {
                    continue;
                }
                self.departed.remove(&ann.node_id);
            }
            present.insert(ann.node_id);
            self.network.update_node(ann.to_node(handle.observed_at));
            if self.should_connect(&ann.role) {
                self.wire_peer(ann.node_id, handle).await;
            }
        }
        self.peers.retain(|id, _| present.contains(id));
        self.publish_members();
        self.ensure_leader().await;
    }

    /// Keep consumer inlets in line with the outlets discovered for a stream
    async fn on_stream_discovery(&mut self, resolver_id: ResolverId, handles: Vec<StreamHandle>) {
        let local_source = self.network.local_id().to_string();
        let Some((id, managed)) = self
            .streams
            .iter_mut()
            .find(|(_, m)| m.resolver == Some(resolver_id))
        else {
            return;
        };

        let live: HashMap<String, StreamHandle> = handles
            .into_iter()
            .filter(|h| h.source_id() != local_source)
            .map(|h| (h.address().to_string(), h))
            .collect();

        let stale: Vec<(String, String)> = managed
            .wired
            .iter()
            .filter(|(address, _)| !live.contains_key(*address))
            .map(|(a, s)| (a.clone(), s.clone()))
            .collect();
        for (address, source) in stale {
            managed.wired.remove(&address);
            // Inlets are removed per source; keep a republished outlet's inlet
            if managed.wired.values().any(|s| *s == source) {
                continue;
            }
            match managed.stream.remove_inlet(&source).await {
                Ok(count) => debug!(stream = %id, %source, count, "inlet for vanished outlet removed"),
                Err(err) => debug!(stream = %id, %source, error = %err, "inlet removal failed"),
            }
        }

        for (address, handle) in live {
            if managed.wired.contains_key(&address) {
                continue;
            }
            let source = handle.source_id().to_string();
            match managed.stream.add_inlet(handle).await {
                Ok(()) => {
                    info!(stream = %id, %source, "consumer wired to producer");
                    managed.wired.insert(address, source);
                }
                Err(err) => warn!(stream = %id, %source, error = %err, "could not wire consumer"),
            }
        }
    }

    // ===== ELECTION =====

    async fn ensure_leader(&mut self) {
        if self.state != SessionState::Active
            || !self.network.topology().supports_election()
            || self.network.leader().is_some()
        {
            return;
        }
        if let Err(err) = self.run_election().await {
            warn!(error = %err, "re-election failed");
        }
    }

    async fn run_election(&mut self) -> SyncResult<()> {
        let candidates = self.network.nodes();
        let winner = self.election.promote(&candidates)?;
        self.stats.elections += 1;
        info!(
            winner = %winner.id,
            strategy = ?self.election.strategy(),
            candidates = candidates.len(),
            "coordinator elected"
        );
        if winner.id == self.network.local_id() {
            let role = self.network.topology().elected_role();
            self.change_local_role(role).await;
        } else {
            self.network.set_leader(Some(winner.id));
        }
        Ok(())
    }

    /// Apply a new local role and advertise it
    async fn change_local_role(&mut self, role: NodeRole) {
        if !self.network.update_role(role.clone()) {
            let local = self.network.local_id();
            self.network.set_leader(Some(local));
            return;
        }
        let announcement = CoordinationMessage::RoleChanged {
            node_id: self.network.local_id(),
            role,
        };
        if let Err(err) = self.send(announcement).await {
            warn!(error = %err, "role announcement failed");
        }
        let desc = self.announcement().to_desc();
        if let Some(stream) = self.coordination.as_mut() {
            if let Err(err) = stream.recreate_outlet(desc).await {
                warn!(error = %err, "coordination advertisement not refreshed");
            }
        }
    }

    // ===== DATA STREAMS =====

    async fn create_data_stream(&mut self, config: StreamConfig) -> SyncResult<StreamId> {
        self.ensure_active()?;
        if config.name() == COORDINATION_STREAM {
            return Err(SyncError::InvalidConfig(format!(
                "stream name {COORDINATION_STREAM:?} is reserved"
            )));
        }
        let id = StreamId::new(config.name());
        if self.streams.contains_key(&id) {
            return Err(SyncError::StreamExists(id));
        }

        let consumes = config.participation_mode().consumes();
        let session_id = self.config.session_id().clone();
        let mut stream = DataStream::new(
            config,
            self.network.local_id().to_string(),
            Arc::clone(&self.transport),
        )
        .with_session(session_id.as_str());
        if let Err(err) = stream.start().await {
            let _ = stream.dispose().await;
            return Err(err);
        }

        let resolver = if consumes {
            let predicate = data_stream_predicate(&session_id, id.as_str())?;
            match self.discovery.start_continuous_discovery(predicate).await {
                Ok(resolver) => Some(resolver),
                Err(err) => {
                    let _ = stream.dispose().await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        self.streams.insert(
            id.clone(),
            ManagedStream {
                stream,
                resolver,
                wired: HashMap::new(),
            },
        );
        self.network.add_stream(id.clone());
        info!(stream = %id, consumes, "data stream created");
        Ok(id)
    }

    async fn destroy_data_stream(&mut self, id: StreamId) -> SyncResult<()> {
        self.ensure_active()?;
        let mut managed = self
            .streams
            .remove(&id)
            .ok_or_else(|| SyncError::StreamNotFound(id.clone()))?;
        if let Err(err) = managed.stream.dispose().await {
            warn!(stream = %id, error = %err, "data stream cleanup failed, keeping it");
            self.streams.insert(id, managed);
            return Err(err);
        }
        if let Some(resolver) = managed.resolver {
            self.discovery.stop_continuous_discovery(resolver);
        }
        self.network.remove_stream(&id);
        info!(stream = %id, "data stream destroyed");
        Ok(())
    }

    /// Applied to every stream; the first failure is returned afterwards
    async fn set_paused(&mut self, paused: bool, flush_before_resume: bool) -> SyncResult<()> {
        self.ensure_active()?;
        let mut outcome = Ok(());
        for (id, managed) in self.streams.iter_mut() {
            let result = if paused {
                managed.stream.pause().await
            } else {
                managed.stream.resume(flush_before_resume).await
            };
            if let Err(err) = result {
                warn!(stream = %id, paused, error = %err, "stream pause state not applied");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }
}

/// One advertisement per node, the most recently observed one
///
/// A republished coordination outlet lingers in discovery results next to
/// its replacement until it is forgotten.
fn latest_announcements(handles: Vec<StreamHandle>) -> Vec<(NodeAnnouncement, StreamHandle)> {
    let mut latest: BTreeMap<NodeId, (NodeAnnouncement, StreamHandle)> = BTreeMap::new();
    for handle in handles {
        let ann = match NodeAnnouncement::from_info(&handle.info) {
            Ok(ann) => ann,
            Err(err) => {
                debug!(uid = %handle.address(), error = %err, "ignoring malformed advertisement");
                continue;
            }
        };
        match latest.get(&ann.node_id) {
            Some((_, kept)) if kept.observed_at >= handle.observed_at => {}
            _ => {
                latest.insert(ann.node_id, (ann, handle));
            }
        }
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncmesh_core::{Capability, DataType};
    use syncmesh_transport::StreamInfo;

    fn advertised(id: u64, role: NodeRole, uid: &str, observed_ms: i64) -> StreamHandle {
        let ann = NodeAnnouncement {
            node_id: NodeId::new(id),
            name: format!("n{id}"),
            role,
            topology: Topology::Hybrid,
            capabilities: Capability::all(),
            started_at: None,
            roll: None,
        };
        let mut info = StreamInfo::new(COORDINATION_STREAM, "coordination", 1, 1.0, DataType::String, ann.node_id.to_string());
        info.uid = uid.to_string();
        for (k, v) in ann.to_desc() {
            info = info.with_desc(k, v);
        }
        let mut handle = StreamHandle::new(info);
        handle.observed_at = Timestamp::from_millis(observed_ms);
        handle
    }

    #[test]
    fn test_latest_announcement_wins() {
        let handles = vec![
            advertised(2, NodeRole::Leader, "new", 2_000),
            advertised(2, NodeRole::Client, "old", 1_000),
            advertised(3, NodeRole::Client, "other", 1_500),
        ];
        let latest = latest_announcements(handles);
        assert_eq!(latest.len(), 2);
        let (ann, handle) = &latest[0];
        assert_eq!(ann.node_id, NodeId::new(2));
        assert_eq!(ann.role, NodeRole::Leader);
        assert_eq!(handle.address(), "new");
    }

    #[test]
    fn test_malformed_advertisement_skipped() {
        let bare = StreamHandle::new(StreamInfo::new(COORDINATION_STREAM, "coordination", 1, 1.0, DataType::String, "x"));
        assert!(latest_announcements(vec![bare]).is_empty());
    }
}
