//! Data stream orchestrator
//!
//! A [`DataStream`] owns the workers of one named stream and drives them
//! through the resource lifecycle. Batches delivered by the inlet worker
//! land in a bounded channel read with [`DataStream::take_batches`] or
//! [`DataStream::next_batch`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use syncmesh_core::{
    Envelope, EventBus, Lifecycle, Message, MessageType, Resource, ResourceState, StreamConfig,
    StreamId, SyncError, SyncResult,
};
use syncmesh_transport::{ChannelValue, SampleData, SharedTransport, StreamHandle, StreamInfo};

use crate::{
    spawn_inlet_worker, spawn_outlet_worker, BatchedSample, CommandKind, WorkerHandle, WorkerKind,
    WorkerOptions, WorkerReply, WorkerSinks, WorkerStats,
};

/// Capacity of the batch channel between the inlet worker and the consumer
pub const BATCH_CHANNEL_CAPACITY: usize = 1024;

/// Published on a stream's event bus
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A worker hit an error it could not answer through a response
    WorkerError {
        stream: StreamId,
        worker: WorkerKind,
        source_id: Option<String>,
        reason: String,
    },
    InletAdded {
        stream: StreamId,
        source_id: String,
    },
    InletRemoved {
        stream: StreamId,
        source_id: String,
        count: usize,
    },
}

/// Counters of both workers
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamStats {
    pub outlet: Option<WorkerStats>,
    pub inlet: Option<WorkerStats>,
}

/// One named stream with its outlet and inlet workers
pub struct DataStream {
    id: StreamId,
    config: StreamConfig,
    source_id: String,
    session_id: Option<String>,
    description: BTreeMap<String, String>,
    transport: SharedTransport,
    options: WorkerOptions,
    lifecycle: Lifecycle,
    events: EventBus<StreamEvent>,
    outlet: Option<WorkerHandle>,
    inlet: Option<WorkerHandle>,
    outlet_info: Option<StreamInfo>,
    batch_tx: mpsc::Sender<Vec<BatchedSample>>,
    batch_rx: mpsc::Receiver<Vec<BatchedSample>>,
}

impl DataStream {
    /// Create a new stream; workers are spawned by [`DataStream::start`]
    pub fn new(config: StreamConfig, source_id: impl Into<String>, transport: SharedTransport) -> Self {
        let id = StreamId::new(config.name());
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        DataStream {
            lifecycle: Lifecycle::new(format!("stream:{id}")),
            options: WorkerOptions::for_stream(&config),
            id,
            config,
            source_id: source_id.into(),
            session_id: None,
            description: BTreeMap::new(),
            transport,
            events: EventBus::new(256),
            outlet: None,
            inlet: None,
            outlet_info: None,
            batch_tx,
            batch_rx,
        }
    }

    /// Tag the published description with a session id
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Add an entry to the published description
    pub fn with_description(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.description.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn state(&self) -> ResourceState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn events(&self) -> &EventBus<StreamEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<StreamEvent>> {
        self.events.subscribe()
    }

    /// Description the outlet was published with, uid included
    pub fn outlet_info(&self) -> Option<&StreamInfo> {
        self.outlet_info.as_ref()
    }

    /// Description to publish, built from config, session and extras
    pub fn stream_info(&self) -> StreamInfo {
        let mut info = StreamInfo::for_stream(&self.config, self.source_id.clone());
        if let Some(session_id) = &self.session_id {
            info = info.with_session(session_id.clone());
        }
        for (key, value) in &self.description {
            info = info.with_desc(key.clone(), value.clone());
        }
        info
    }

    fn sinks(&self) -> WorkerSinks {
        WorkerSinks {
            stream: self.id.clone(),
            batches: self.batch_tx.clone(),
            events: self.events.clone(),
        }
    }

    fn ensure_running(&self) -> SyncResult<()> {
        self.lifecycle.ensure_not_disposed()?;
        let state = self.lifecycle.state();
        if !state.is_running() {
            return Err(SyncError::StreamUnavailable(format!("{} is {state}", self.id)));
        }
        Ok(())
    }

    fn outlet_worker(&self) -> SyncResult<&WorkerHandle> {
        self.outlet
            .as_ref()
            .ok_or_else(|| SyncError::StreamUnavailable(format!("{} has no outlet", self.id)))
    }

    fn inlet_worker(&self) -> SyncResult<&WorkerHandle> {
        self.inlet
            .as_ref()
            .ok_or_else(|| SyncError::StreamUnavailable(format!("{} has no inlet worker", self.id)))
    }

    // ===== LIFECYCLE =====

    /// Spawn the workers required by the participation mode and start them
    pub async fn start(&mut self) -> SyncResult<()> {
        self.lifecycle.ensure_not_disposed()?;
        if self.lifecycle.state().is_running() {
            return Ok(());
        }
        self.lifecycle.transition(ResourceState::Initializing, "start")?;
        match self.spawn_workers().await {
            Ok(()) => {
                self.lifecycle.transition(ResourceState::Active, "workers running")?;
                info!(
                    stream = %self.id,
                    mode = ?self.config.participation_mode(),
                    poll_mode = ?self.options.poll_mode,
                    "stream started"
                );
                Ok(())
            }
            Err(err) => {
                if let Err(cleanup) = self.shutdown_workers().await {
                    warn!(stream = %self.id, error = %cleanup, "worker cleanup after failed start");
                }
                Err(self.lifecycle.fail(err))
            }
        }
    }

    async fn spawn_workers(&mut self) -> SyncResult<()> {
        let mode = self.config.participation_mode();
        let capacity = self.options.channel_capacity;
        let response_timeout = self.options.response_timeout;

        if mode.produces() {
            let info = self.stream_info();
            let transport = Arc::clone(&self.transport);
            let outlet = tokio::task::spawn_blocking(move || transport.create_outlet(info))
                .await
                .map_err(|e| SyncError::WorkerFailed(format!("outlet creation: {e}")))??;
            self.outlet_info = Some(outlet.info().clone());

            let name = format!("{}-outlet", self.id);
            let transport = Arc::clone(&self.transport);
            let worker_name = name.clone();
            let handle = WorkerHandle::spawn(
                WorkerKind::Outlet,
                name,
                capacity,
                response_timeout,
                self.sinks(),
                move |commands, events| {
                    spawn_outlet_worker(worker_name, transport, outlet, commands, events)
                },
            )?;
            // Stored first so a failed start still gets shut down
            self.outlet = Some(handle);
            self.outlet_worker()?.request(CommandKind::Start).await?;
        }

        if mode.consumes() {
            let name = format!("{}-inlet", self.id);
            let transport = Arc::clone(&self.transport);
            let options = self.options.clone();
            let worker_name = name.clone();
            let handle = WorkerHandle::spawn(
                WorkerKind::Inlet,
                name,
                capacity,
                response_timeout,
                self.sinks(),
                move |commands, events| {
                    spawn_inlet_worker(worker_name, transport, options, commands, events)
                },
            )?;
            self.inlet = Some(handle);
            self.inlet_worker()?.request(CommandKind::Start).await?;
        }
        Ok(())
    }

    /// Release both workers; the first failure is returned after both ran
    async fn shutdown_workers(&mut self) -> SyncResult<()> {
        let mut result = Ok(());
        for worker in [self.outlet.take(), self.inlet.take()].into_iter().flatten() {
            if let Err(err) = worker.shutdown().await {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Stop both workers
    ///
    /// Batches delivered before the stop stay readable.
    pub async fn stop(&mut self) -> SyncResult<()> {
        let state = self.lifecycle.state();
        match state {
            ResourceState::Stopped | ResourceState::Disposed | ResourceState::Created => Ok(()),
            ResourceState::Error => self.shutdown_workers().await,
            _ => {
                self.lifecycle.transition(ResourceState::Stopping, "stop")?;
                if let Err(err) = self.shutdown_workers().await {
                    return Err(self.lifecycle.fail(err));
                }
                self.lifecycle.transition(ResourceState::Stopped, "workers stopped")?;
                info!(stream = %self.id, "stream stopped");
                Ok(())
            }
        }
    }

    /// Suspend polling and outgoing sends
    pub async fn pause(&mut self) -> SyncResult<()> {
        self.lifecycle.ensure_not_disposed()?;
        match self.lifecycle.state() {
            ResourceState::Idle => return Ok(()),
            ResourceState::Active => {}
            other => return Err(SyncError::StreamUnavailable(format!("{} is {other}", self.id))),
        }
        self.broadcast(CommandKind::Pause).await?;
        self.lifecycle.transition(ResourceState::Idle, "paused")
    }

    /// Resume after [`DataStream::pause`]
    ///
    /// With `flush_before_resume`, samples queued on the inlets while paused
    /// are discarded and never delivered.
    pub async fn resume(&mut self, flush_before_resume: bool) -> SyncResult<()> {
        self.lifecycle.ensure_not_disposed()?;
        match self.lifecycle.state() {
            ResourceState::Active => return Ok(()),
            ResourceState::Idle => {}
            other => return Err(SyncError::StreamUnavailable(format!("{} is {other}", self.id))),
        }
        self.broadcast(CommandKind::Resume {
            flush_before_resume,
        })
        .await?;
        self.lifecycle.transition(ResourceState::Active, "resumed")
    }

    /// Send one command to every worker; an unanswered request is logged
    async fn broadcast(&self, kind: CommandKind) -> SyncResult<()> {
        for worker in [self.outlet.as_ref(), self.inlet.as_ref()].into_iter().flatten() {
            match worker.request(kind.clone()).await {
                Ok(_) => {}
                Err(err @ SyncError::Timeout { .. }) => {
                    warn!(worker = %worker.name(), error = %err, "worker did not answer");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    // ===== DATA PATH =====

    /// Deliver the inlet worker's pending batch now
    pub async fn flush(&self) -> SyncResult<usize> {
        self.ensure_running()?;
        let Some(inlet) = self.inlet.as_ref() else {
            return Ok(0);
        };
        match inlet.request(CommandKind::Flush).await {
            Ok(WorkerReply::Flushed(count)) => Ok(count),
            Ok(_) => Ok(0),
            Err(err @ SyncError::Timeout { .. }) => {
                warn!(stream = %self.id, error = %err, "flush not acknowledged");
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    /// Attach an inlet for a discovered stream
    pub async fn add_inlet(&self, handle: StreamHandle) -> SyncResult<()> {
        self.ensure_running()?;
        let source_id = handle.source_id().to_string();
        self.inlet_worker()?
            .request(CommandKind::AddInlet(handle))
            .await?;
        self.events.emit(StreamEvent::InletAdded {
            stream: self.id.clone(),
            source_id,
        });
        Ok(())
    }

    /// Detach every inlet fed by `source_id`; returns how many were removed
    pub async fn remove_inlet(&self, source_id: &str) -> SyncResult<usize> {
        self.ensure_running()?;
        let reply = self
            .inlet_worker()?
            .request(CommandKind::RemoveInlet {
                source_id: source_id.to_string(),
            })
            .await?;
        let count = match reply {
            WorkerReply::Removed(count) => count,
            _ => 0,
        };
        if count > 0 {
            self.events.emit(StreamEvent::InletRemoved {
                stream: self.id.clone(),
                source_id: source_id.to_string(),
                count,
            });
        }
        Ok(count)
    }

    /// Queue one sample on the outlet
    ///
    /// Without a time stamp the transport stamps the sample on push.
    pub async fn push_sample(&self, data: SampleData, timestamp: Option<f64>) -> SyncResult<()> {
        self.ensure_running()?;
        if data.data_type() != self.config.data_type() {
            return Err(SyncError::DataTypeMismatch {
                expected: self.config.data_type(),
                actual: data.data_type(),
            });
        }
        let expected = self.config.channels() as usize;
        if data.len() != expected {
            return Err(SyncError::ChannelMismatch {
                expected,
                actual: data.len(),
            });
        }
        self.outlet_worker()?
            .notify(CommandKind::SendData { data, timestamp })
            .await
    }

    /// Queue a typed message on the outlet
    pub async fn send<T: ChannelValue>(&self, message: Message<T>) -> SyncResult<()> {
        let expected = MessageType::of_stream(&self.config);
        let actual = message.message_type();
        if actual.data_type != expected.data_type {
            return Err(SyncError::DataTypeMismatch {
                expected: expected.data_type,
                actual: actual.data_type,
            });
        }
        if actual.channel_count != expected.channel_count {
            return Err(SyncError::ChannelMismatch {
                expected: expected.channel_count,
                actual: actual.channel_count,
            });
        }
        self.push_sample(SampleData::from(message), None).await
    }

    /// Republish the outlet with updated description entries
    ///
    /// The old outlet is withdrawn; consumers see a new uid under the same
    /// source id.
    pub async fn recreate_outlet(
        &mut self,
        description: impl IntoIterator<Item = (String, String)>,
    ) -> SyncResult<StreamInfo> {
        self.ensure_running()?;
        self.description.extend(description);
        let info = self.stream_info();
        let reply = self
            .outlet_worker()?
            .request(CommandKind::RecreateOutlet(info))
            .await?;
        match reply {
            WorkerReply::Recreated(info) => {
                debug!(stream = %self.id, uid = %info.uid, "outlet republished");
                self.outlet_info = Some(info.clone());
                Ok(info)
            }
            other => Err(SyncError::WorkerFailed(format!(
                "unexpected reply to recreate_outlet: {other:?}"
            ))),
        }
    }

    /// Counters of both workers
    pub async fn stats(&self) -> SyncResult<StreamStats> {
        let mut stats = StreamStats::default();
        if let Some(outlet) = &self.outlet {
            if let WorkerReply::Stats(s) = outlet.request(CommandKind::Stats).await? {
                stats.outlet = Some(s);
            }
        }
        if let Some(inlet) = &self.inlet {
            if let WorkerReply::Stats(s) = inlet.request(CommandKind::Stats).await? {
                stats.inlet = Some(s);
            }
        }
        Ok(stats)
    }

    /// Drain every batch delivered so far
    pub fn take_batches(&mut self) -> Vec<BatchedSample> {
        let mut samples = Vec::new();
        while let Ok(batch) = self.batch_rx.try_recv() {
            samples.extend(batch);
        }
        samples
    }

    /// Wait up to `timeout` for the next batch
    pub async fn next_batch(&mut self, timeout: Duration) -> Option<Vec<BatchedSample>> {
        tokio::time::timeout(timeout, self.batch_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Resource for DataStream {
    fn resource_state(&self) -> ResourceState {
        self.lifecycle.state()
    }

    async fn initialize(&mut self) -> SyncResult<ResourceState> {
        self.start().await?;
        Ok(self.lifecycle.state())
    }

    async fn activate(&mut self) -> SyncResult<()> {
        self.resume(false).await
    }

    async fn deactivate(&mut self) -> SyncResult<()> {
        self.pause().await
    }

    async fn dispose(&mut self) -> SyncResult<()> {
        if self.lifecycle.state() == ResourceState::Disposed {
            return Ok(());
        }
        self.outlet_info = None;
        if let Err(err) = self.stop().await {
            // Workers are released either way; a later dispose completes
            warn!(stream = %self.id, error = %err, "stop during dispose failed");
            if let Err(cleanup) = self.shutdown_workers().await {
                debug!(stream = %self.id, error = %cleanup, "worker cleanup after failed stop");
            }
            return Err(self.lifecycle.fail(err));
        }
        self.lifecycle.transition(ResourceState::Disposed, "disposed")
    }

    fn health_check(&self) -> bool {
        self.lifecycle.state().is_running()
            && self.outlet.as_ref().map_or(true, WorkerHandle::is_alive)
            && self.inlet.as_ref().map_or(true, WorkerHandle::is_alive)
    }
}
