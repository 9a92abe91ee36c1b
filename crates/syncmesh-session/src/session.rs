//! Coordination session handle
//!
//! [`CoordinationSession`] is the public face of one session. Every call is
//! forwarded to the session task and answered over a oneshot channel; state
//! and membership size are mirrored through watch channels so they can be
//! read without a round trip.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use syncmesh_core::{
    Envelope, EventBus, Lifecycle, Node, NodeId, NodeRole, Resource, ResourceState, SessionConfig,
    SessionState, StreamConfig, StreamId, SyncError, SyncResult, Topology,
};
use syncmesh_discovery::{DiscoveryConfig, DiscoveryEngine};
use syncmesh_stream::{BatchedSample, StreamStats};
use syncmesh_transport::{SampleData, SharedTransport};

use crate::actor::SessionActor;
use crate::election::election_for;
use crate::{SessionEvent, SessionRequest, SessionSnapshot, SessionStats};

/// Depth of the request queue in front of the session task
const REQUEST_QUEUE: usize = 64;

/// One node's membership in one coordination session
pub struct CoordinationSession {
    config: SessionConfig,
    requests: mpsc::Sender<SessionRequest>,
    events: EventBus<SessionEvent>,
    state: watch::Receiver<SessionState>,
    members: watch::Receiver<usize>,
    lifecycle: Lifecycle,
    task: Option<JoinHandle<()>>,
}

impl CoordinationSession {
    /// Create a session and spawn its task
    ///
    /// Must be called from within a tokio runtime. The session starts
    /// disconnected; [`join`](Self::join) discovers or creates the network.
    pub fn new(config: SessionConfig, transport: SharedTransport) -> SyncResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::InvalidConfig(format!("session needs a tokio runtime: {e}")))?;
        let discovery = DiscoveryEngine::new(transport.clone(), DiscoveryConfig::from_session(&config)?);
        let events = EventBus::default();
        let (state_tx, state) = watch::channel(SessionState::Disconnected);
        let (members_tx, members) = watch::channel(0usize);
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);

        let actor = SessionActor::new(
            config.clone(),
            transport,
            discovery,
            election_for(config.election()),
            events.clone(),
            state_tx,
            members_tx,
        );
        let task = runtime.spawn(actor.run(rx));
        info!(session = %config.session_id(), node = %config.node_id(), name = config.node_name(), "session created");

        Ok(CoordinationSession {
            config,
            requests,
            events,
            state,
            members,
            lifecycle: Lifecycle::new("session"),
            task: Some(task),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id()
    }

    pub fn events(&self) -> &EventBus<SessionEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<SessionEvent>> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Number of known members, the local node included; 0 while disconnected
    pub fn node_count(&self) -> usize {
        *self.members.borrow()
    }

    async fn call<T>(
        &self,
        operation: &str,
        request: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(request(reply))
            .await
            .map_err(|_| SyncError::ChannelClosed(format!("session task gone ({operation})")))?;
        rx.await
            .map_err(|_| SyncError::ChannelClosed(format!("no reply to {operation}")))
    }

    // ===== MEMBERSHIP =====

    /// Discover the session network and join it, or create it
    ///
    /// A no-op when already joined. On failure the session is left in
    /// [`SessionState::Error`] with everything it opened released. Only
    /// [`leave`](Self::leave) recovers from there; `join` is rejected until
    /// then.
    pub async fn join(&self) -> SyncResult<()> {
        debug!(session = %self.config.session_id(), "join requested");
        self.call("join", |reply| SessionRequest::Join { reply }).await?
    }

    /// Announce departure and release every stream; a no-op when disconnected
    pub async fn leave(&self) -> SyncResult<()> {
        debug!(session = %self.config.session_id(), "leave requested");
        self.call("leave", |reply| SessionRequest::Leave { reply }).await?
    }

    pub async fn snapshot(&self) -> SyncResult<SessionSnapshot> {
        self.call("snapshot", |reply| SessionRequest::Snapshot { reply })
            .await
    }

    /// Every member, local node first
    pub async fn nodes(&self) -> SyncResult<Vec<Node>> {
        Ok(self.snapshot().await?.nodes)
    }

    pub async fn role(&self) -> SyncResult<NodeRole> {
        Ok(self.snapshot().await?.role)
    }

    pub async fn leader(&self) -> SyncResult<Option<NodeId>> {
        Ok(self.snapshot().await?.leader)
    }

    pub async fn topology(&self) -> SyncResult<Topology> {
        Ok(self.snapshot().await?.topology)
    }

    pub async fn stats(&self) -> SyncResult<SessionStats> {
        Ok(self.snapshot().await?.stats)
    }

    /// Wait until at least `target` members are known
    ///
    /// Without a timeout this waits until the count is reached or the
    /// session task ends.
    pub async fn wait_for_nodes(&self, target: usize, timeout: Option<Duration>) -> SyncResult<usize> {
        let mut members = self.members.clone();
        let wait = async move {
            members
                .wait_for(|count| *count >= target)
                .await
                .map(|count| *count)
                .map_err(|_| SyncError::ChannelClosed("session task gone (wait_for_nodes)".into()))
        };
        match timeout {
            Some(after) => tokio::time::timeout(after, wait)
                .await
                .map_err(|_| SyncError::timeout(format!("waiting for {target} nodes"), after))?,
            None => wait.await,
        }
    }

    /// Wait until the configured minimum number of nodes is present
    pub async fn wait_for_quorum(&self, timeout: Option<Duration>) -> SyncResult<usize> {
        self.wait_for_nodes(self.config.coordination().min_nodes(), timeout)
            .await
    }

    // ===== DATA STREAMS =====

    /// Create and start a data stream shared across the session
    ///
    /// A consuming stream connects itself to every producer of the same
    /// name in the session as they are discovered.
    pub async fn create_data_stream(&self, config: StreamConfig) -> SyncResult<StreamId> {
        self.call("create_data_stream", |reply| SessionRequest::CreateDataStream {
            config,
            reply,
        })
        .await?
    }

    pub async fn destroy_data_stream(&self, id: &StreamId) -> SyncResult<()> {
        let id = id.clone();
        self.call("destroy_data_stream", |reply| SessionRequest::DestroyDataStream {
            id,
            reply,
        })
        .await?
    }

    /// Push one sample on a producing stream
    pub async fn push_sample(
        &self,
        stream: &StreamId,
        data: impl Into<SampleData>,
        timestamp: Option<f64>,
    ) -> SyncResult<()> {
        let stream = stream.clone();
        let data = data.into();
        self.call("push_sample", |reply| SessionRequest::PushSample {
            stream,
            data,
            timestamp,
            reply,
        })
        .await?
    }

    /// Drain every sample delivered to a consuming stream so far
    pub async fn take_stream_batches(&self, stream: &StreamId) -> SyncResult<Vec<BatchedSample>> {
        let stream = stream.clone();
        self.call("take_stream_batches", |reply| SessionRequest::TakeBatches {
            stream,
            reply,
        })
        .await?
    }

    pub async fn stream_stats(&self, stream: &StreamId) -> SyncResult<StreamStats> {
        let stream = stream.clone();
        self.call("stream_stats", |reply| SessionRequest::StreamStats { stream, reply })
            .await?
    }

    pub async fn pause_streams(&self) -> SyncResult<()> {
        self.call("pause_streams", |reply| SessionRequest::SetPaused {
            paused: true,
            flush_before_resume: false,
            reply,
        })
        .await?
    }

    /// Resume every stream, optionally discarding what queued up meanwhile
    pub async fn resume_streams(&self, flush_before_resume: bool) -> SyncResult<()> {
        self.call("resume_streams", |reply| SessionRequest::SetPaused {
            paused: false,
            flush_before_resume,
            reply,
        })
        .await?
    }

    async fn shutdown(&mut self) {
        if self
            .call("shutdown", |reply| SessionRequest::Shutdown { reply })
            .await
            .is_err()
        {
            debug!(session = %self.config.session_id(), "session task already gone");
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(session = %self.config.session_id(), error = %err, "session task panicked");
            }
        }
    }
}

impl Resource for CoordinationSession {
    fn resource_state(&self) -> ResourceState {
        self.lifecycle.state()
    }

    async fn initialize(&mut self) -> SyncResult<ResourceState> {
        self.lifecycle.ensure_not_disposed()?;
        if self.lifecycle.state().is_running() {
            return Ok(self.lifecycle.state());
        }
        self.lifecycle
            .transition(ResourceState::Initializing, "initialize")?;
        if let Err(err) = self.join().await {
            return Err(self.lifecycle.fail(err));
        }
        self.lifecycle.transition(ResourceState::Active, "joined")?;
        Ok(ResourceState::Active)
    }

    async fn activate(&mut self) -> SyncResult<()> {
        self.resume_streams(false).await?;
        self.lifecycle.transition(ResourceState::Active, "activate")
    }

    async fn deactivate(&mut self) -> SyncResult<()> {
        self.pause_streams().await?;
        self.lifecycle.transition(ResourceState::Idle, "deactivate")
    }

    async fn dispose(&mut self) -> SyncResult<()> {
        let state = self.lifecycle.state();
        if state.is_terminal() {
            return Ok(());
        }
        self.shutdown().await;
        if !matches!(
            state,
            ResourceState::Created | ResourceState::Stopped | ResourceState::Error
        ) {
            self.lifecycle.transition(ResourceState::Stopping, "dispose")?;
            self.lifecycle.transition(ResourceState::Stopped, "left session")?;
        }
        self.lifecycle.transition(ResourceState::Disposed, "dispose")?;
        info!(session = %self.config.session_id(), "session disposed");
        Ok(())
    }

    fn health_check(&self) -> bool {
        let task_alive = self.task.as_ref().is_some_and(|t| !t.is_finished());
        task_alive && self.lifecycle.state().is_running() && self.is_active()
    }
}
