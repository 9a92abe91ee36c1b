//! Orchestrator-side handle of one worker
//!
//! A router task reads the worker's event channel: responses complete the
//! pending request with the same id, data batches go to the stream's batch
//! channel and errors are published on the stream's event bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use syncmesh_core::{EventBus, RequestId, StreamId, SyncError, SyncResult};

use crate::{
    BatchedSample, CommandKind, StreamEvent, WorkerCommand, WorkerEvent, WorkerKind, WorkerReply,
};

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<SyncResult<WorkerReply>>>>>;

/// Where a worker's unsolicited output goes
#[derive(Clone)]
pub struct WorkerSinks {
    pub stream: StreamId,
    pub batches: mpsc::Sender<Vec<BatchedSample>>,
    pub events: EventBus<StreamEvent>,
}

/// Handle to a running worker
pub struct WorkerHandle {
    kind: WorkerKind,
    name: String,
    commands: mpsc::Sender<WorkerCommand>,
    pending: PendingMap,
    router: JoinHandle<()>,
    thread: Option<thread::JoinHandle<()>>,
    response_timeout: Duration,
}

impl WorkerHandle {
    /// Wire up channels, start the router and spawn the worker via `spawn`
    pub fn spawn<F>(
        kind: WorkerKind,
        name: String,
        channel_capacity: usize,
        response_timeout: Duration,
        sinks: WorkerSinks,
        spawn: F,
    ) -> SyncResult<Self>
    where
        F: FnOnce(
            mpsc::Receiver<WorkerCommand>,
            mpsc::Sender<WorkerEvent>,
        ) -> SyncResult<thread::JoinHandle<()>>,
    {
        let capacity = channel_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let thread = spawn(command_rx, event_tx)?;
        let router = tokio::spawn(route_events(
            kind,
            name.clone(),
            event_rx,
            Arc::clone(&pending),
            sinks,
        ));
        debug!(worker = %name, "worker spawned");

        Ok(WorkerHandle {
            kind,
            name,
            commands: command_tx,
            pending,
            router,
            thread: Some(thread),
            response_timeout,
        })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker thread is still running
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Send a command and wait for the worker's response
    pub async fn request(&self, kind: CommandKind) -> SyncResult<WorkerReply> {
        let command = WorkerCommand::request(kind);
        let request_id = command
            .request_id
            .ok_or_else(|| SyncError::WorkerFailed("request without id".into()))?;
        let operation = format!("{} {}", self.name, command.kind.name());

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, reply_tx);
        if self.commands.send(command).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(SyncError::ChannelClosed(format!("{} commands", self.name)));
        }

        match tokio::time::timeout(self.response_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::ChannelClosed(format!(
                "{} exited before answering",
                self.name
            ))),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(SyncError::timeout(operation, self.response_timeout))
            }
        }
    }

    /// Send a command without waiting for a response
    pub async fn notify(&self, kind: CommandKind) -> SyncResult<()> {
        self.commands
            .send(WorkerCommand::notify(kind))
            .await
            .map_err(|_| SyncError::ChannelClosed(format!("{} commands", self.name)))
    }

    /// Stop the worker and release it
    ///
    /// A worker that does not acknowledge within the response timeout is
    /// treated as stopped and detached. A worker thread that panicked is
    /// released too, but reported as a failure.
    pub async fn shutdown(mut self) -> SyncResult<()> {
        let stop = self.request(CommandKind::Stop).await;
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if let Err(err @ SyncError::Timeout { .. }) = &stop {
            warn!(
                worker = %self.name,
                error = %err,
                "worker did not acknowledge stop, treating it as stopped"
            );
            return Ok(());
        }
        // Acknowledged, or the worker is already gone and only needs joining
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        if matches!(joined, Ok(Ok(()))) {
            debug!(worker = %self.name, "worker stopped");
            Ok(())
        } else {
            warn!(worker = %self.name, "worker thread ended abnormally");
            Err(SyncError::WorkerFailed(format!("{} thread panicked", self.name)))
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route_events(
    kind: WorkerKind,
    name: String,
    mut events: mpsc::Receiver<WorkerEvent>,
    pending: PendingMap,
    sinks: WorkerSinks,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Response { request_id, result } => {
                let waiter = pending.lock().remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!(worker = %name, %request_id, "late response dropped"),
                }
            }
            WorkerEvent::Data(batch) => {
                if let Err(err) = sinks.batches.try_send(batch) {
                    let dropped = match &err {
                        mpsc::error::TrySendError::Full(b) | mpsc::error::TrySendError::Closed(b) => {
                            b.len()
                        }
                    };
                    warn!(worker = %name, dropped, "batch consumer not keeping up, batch dropped");
                }
            }
            WorkerEvent::Error { source_id, error } => {
                sinks.events.emit(StreamEvent::WorkerError {
                    stream: sinks.stream.clone(),
                    worker: kind,
                    source_id,
                    reason: error.to_string(),
                });
            }
        }
    }
    // Outstanding requests can no longer be answered
    pending.lock().clear();
    debug!(worker = %name, "worker event channel closed");
}
