//! Outlet worker
//!
//! Owns exactly one outlet. Sends are pushed synchronously; while paused
//! they are dropped, never buffered.

use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use syncmesh_core::{SyncError, SyncResult};
use syncmesh_transport::{Outlet, SharedTransport};

use crate::{CommandKind, WorkerCommand, WorkerEvent, WorkerKind, WorkerReply, WorkerStats};

struct OutletWorker {
    name: String,
    transport: SharedTransport,
    outlet: Option<Box<dyn Outlet>>,
    paused: bool,
    stats: WorkerStats,
    events: mpsc::Sender<WorkerEvent>,
}

impl OutletWorker {
    fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        while let Some(command) = commands.blocking_recv() {
            let stop = matches!(command.kind, CommandKind::Stop);
            let name = command.kind.name();
            let result = self.handle(command.kind);
            if name != "send_data" {
                debug!(
                    worker = %self.name,
                    command = name,
                    request_id = ?command.request_id,
                    ok = result.is_ok(),
                    "command applied"
                );
            }
            match command.request_id {
                Some(request_id) => {
                    let _ = self
                        .events
                        .blocking_send(WorkerEvent::Response { request_id, result });
                }
                None => {
                    if let Err(error) = result {
                        self.report(error);
                    }
                }
            }
            if stop {
                return;
            }
        }
        self.outlet = None;
        debug!(worker = %self.name, "command channel closed, outlet released");
    }

    fn handle(&mut self, kind: CommandKind) -> SyncResult<WorkerReply> {
        match kind {
            CommandKind::Start => Ok(WorkerReply::Ack),
            CommandKind::Stop => {
                self.outlet = None;
                info!(worker = %self.name, sent = self.stats.samples_sent, "outlet worker stopped");
                Ok(WorkerReply::Ack)
            }
            CommandKind::Pause => {
                self.paused = true;
                Ok(WorkerReply::Ack)
            }
            CommandKind::Resume { .. } => {
                self.paused = false;
                Ok(WorkerReply::Ack)
            }
            CommandKind::Flush => Ok(WorkerReply::Flushed(0)),
            CommandKind::SendData { data, timestamp } => {
                if self.paused {
                    self.stats.dropped_sends += 1;
                    return Ok(WorkerReply::Ack);
                }
                let outlet = self
                    .outlet
                    .as_mut()
                    .ok_or_else(|| SyncError::StreamUnavailable(self.name.clone()))?;
                outlet.push_sample(data, timestamp)?;
                self.stats.samples_sent += 1;
                Ok(WorkerReply::Ack)
            }
            CommandKind::RecreateOutlet(info) => {
                let replacement = self.transport.create_outlet(info)?;
                info!(
                    worker = %self.name,
                    uid = %replacement.info().uid,
                    "outlet recreated"
                );
                let info = replacement.info().clone();
                // Old outlet is withdrawn when replaced
                self.outlet = Some(replacement);
                Ok(WorkerReply::Recreated(info))
            }
            CommandKind::Stats => Ok(WorkerReply::Stats(self.stats.clone())),
            other @ (CommandKind::AddInlet(_) | CommandKind::RemoveInlet { .. }) => {
                Err(other.unsupported(WorkerKind::Outlet))
            }
        }
    }

    fn report(&mut self, error: SyncError) {
        warn!(worker = %self.name, error = %error, "outlet worker error");
        self.stats.errors += 1;
        let _ = self.events.try_send(WorkerEvent::Error {
            source_id: None,
            error,
        });
    }
}

/// Spawn an outlet worker around an already created outlet
pub fn spawn_outlet_worker(
    name: String,
    transport: SharedTransport,
    outlet: Box<dyn Outlet>,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
) -> SyncResult<thread::JoinHandle<()>> {
    let worker = OutletWorker {
        name: name.clone(),
        transport,
        outlet: Some(outlet),
        paused: false,
        stats: WorkerStats::default(),
        events,
    };
    thread::Builder::new()
        .name(name)
        .spawn(move || worker.run(commands))
        .map_err(|e| SyncError::WorkerFailed(format!("outlet worker thread: {e}")))
}
