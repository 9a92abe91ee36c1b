//! Inlet worker
//!
//! Two threads per worker:
//! - the control thread applies commands in arrival order and answers them
//! - the poll thread ticks on a [`PollTimer`], pulls every inlet without
//!   blocking and delivers the batch at the end of each tick
//!
//! The inlet list and the index-aligned clock corrections sit behind one
//! lock so adding or removing an inlet keeps them aligned. The batch has its
//! own lock: the tick fills it and both the tick and the `flush` command
//! drain it. Lock order is inlets, then batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use syncmesh_core::{SyncError, SyncResult};
use syncmesh_time::{ClockCorrection, PollTimer};
use syncmesh_transport::{Inlet, SharedTransport, StreamHandle};

use crate::{
    BatchedSample, CommandKind, WorkerCommand, WorkerEvent, WorkerKind, WorkerOptions,
    WorkerReply, WorkerStats,
};

#[derive(Default)]
struct InletSet {
    inlets: Vec<Box<dyn Inlet>>,
    corrections: Vec<ClockCorrection>,
}

impl InletSet {
    fn len(&self) -> usize {
        self.inlets.len()
    }

    fn push(&mut self, inlet: Box<dyn Inlet>, correction: ClockCorrection) {
        self.inlets.push(inlet);
        self.corrections.push(correction);
    }

    fn remove(&mut self, index: usize) -> Box<dyn Inlet> {
        self.corrections.remove(index);
        self.inlets.remove(index)
    }

    fn contains_address(&self, address: &str) -> bool {
        self.inlets.iter().any(|i| i.info().uid == address)
    }

    fn clear(&mut self) {
        self.inlets.clear();
        self.corrections.clear();
    }
}

struct InletShared {
    name: String,
    options: WorkerOptions,
    set: Mutex<InletSet>,
    batch: Mutex<Vec<BatchedSample>>,
    paused: AtomicBool,
    running: AtomicBool,
    stats: Mutex<WorkerStats>,
    events: mpsc::Sender<WorkerEvent>,
}

impl InletShared {
    /// One poll pass over every inlet
    fn tick(&self) {
        let mut failures: Vec<(String, SyncError)> = Vec::new();
        let pulled_count = {
            let mut set = self.set.lock();
            // Checked under the inlet lock so pause/resume never interleave
            // with a pull pass
            if self.paused.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            let mut pulled = Vec::new();
            let mut lost = Vec::new();
            let InletSet {
                inlets,
                corrections,
            } = &mut *set;
            for (index, (inlet, correction)) in
                inlets.iter_mut().zip(corrections.iter_mut()).enumerate()
            {
                let source_id = inlet.info().source_id.clone();
                if correction.refresh_due(now) {
                    match inlet.time_correction(self.options.correction_timeout) {
                        Ok(measured) => {
                            correction.record(measured, now);
                        }
                        Err(err) => {
                            correction.record_failure(now);
                            failures.push((source_id.clone(), err));
                        }
                    }
                }
                let offset = correction.current();
                for _ in 0..self.options.max_pulls_per_tick {
                    match inlet.pull_sample(Duration::ZERO) {
                        Ok(Some(sample)) => pulled.push(BatchedSample {
                            source_id: source_id.clone(),
                            timestamp: sample.timestamp,
                            clock_correction: offset,
                            channel_data: sample.data,
                        }),
                        Ok(None) => break,
                        Err(err) => {
                            if matches!(err, SyncError::StreamUnavailable(_)) {
                                lost.push(index);
                            }
                            failures.push((source_id.clone(), err));
                            break;
                        }
                    }
                }
            }
            for index in lost.into_iter().rev() {
                let inlet = set.remove(index);
                info!(worker = %self.name, source = %inlet.info().source_id, "inlet lost, removed");
            }
            let count = pulled.len();
            if count > 0 {
                self.batch.lock().extend(pulled);
            }
            count
        };

        {
            let mut stats = self.stats.lock();
            stats.ticks += 1;
            stats.samples_pulled += pulled_count as u64;
        }
        for (source_id, error) in failures {
            self.report(Some(source_id), error);
        }
    }

    /// Deliver the pending batch; returns the number of samples sent
    fn flush_batch(&self) -> SyncResult<usize> {
        // Held across the send so concurrent flushes keep batch order
        let mut batch = self.batch.lock();
        if batch.is_empty() {
            return Ok(0);
        }
        let samples = std::mem::take(&mut *batch);
        let count = samples.len();
        self.events
            .blocking_send(WorkerEvent::Data(samples))
            .map_err(|_| SyncError::ChannelClosed(format!("{} events", self.name)))?;
        self.stats.lock().batches_sent += 1;
        Ok(count)
    }

    fn report(&self, source_id: Option<String>, error: SyncError) {
        warn!(worker = %self.name, source = ?source_id, error = %error, "inlet worker error");
        self.stats.lock().errors += 1;
        let _ = self.events.try_send(WorkerEvent::Error { source_id, error });
    }
}

fn poll_loop(shared: Arc<InletShared>) {
    let mut timer = PollTimer::new(shared.options.poll_mode, shared.options.poll_interval);
    debug!(worker = %shared.name, mode = ?timer.mode(), interval = ?timer.interval(), "polling started");
    while shared.running.load(Ordering::Acquire) {
        timer.wait();
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        shared.tick();
        if shared.flush_batch().is_err() {
            shared.running.store(false, Ordering::Release);
            break;
        }
    }
    shared.stats.lock().skipped_ticks = timer.skipped();
    debug!(worker = %shared.name, ticks = timer.ticks(), "polling stopped");
}

struct InletWorker {
    shared: Arc<InletShared>,
    transport: SharedTransport,
    poller: Option<thread::JoinHandle<()>>,
}

impl InletWorker {
    fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        while let Some(command) = commands.blocking_recv() {
            let name = command.kind.name();
            let stop = matches!(command.kind, CommandKind::Stop);
            let result = self.handle(command.kind);
            debug!(
                worker = %self.shared.name,
                command = name,
                request_id = ?command.request_id,
                ok = result.is_ok(),
                "command applied"
            );
            match command.request_id {
                Some(request_id) => {
                    let _ = self
                        .shared
                        .events
                        .blocking_send(WorkerEvent::Response { request_id, result });
                }
                None => {
                    if let Err(error) = result {
                        self.shared.report(None, error);
                    }
                }
            }
            if stop {
                return;
            }
        }
        // Orchestrator dropped its handle
        let _ = self.stop();
    }

    fn handle(&mut self, kind: CommandKind) -> SyncResult<WorkerReply> {
        match kind {
            CommandKind::Start => self.start(),
            CommandKind::Stop => self.stop(),
            CommandKind::Pause => {
                let _set = self.shared.set.lock();
                self.shared.paused.store(true, Ordering::Release);
                Ok(WorkerReply::Ack)
            }
            CommandKind::Resume {
                flush_before_resume,
            } => {
                let mut set = self.shared.set.lock();
                if flush_before_resume {
                    let mut discarded = 0usize;
                    for inlet in set.inlets.iter_mut() {
                        discarded += inlet.flush();
                    }
                    self.shared.stats.lock().discarded_on_resume += discarded as u64;
                    debug!(worker = %self.shared.name, discarded, "stale samples discarded");
                }
                self.shared.paused.store(false, Ordering::Release);
                drop(set);
                Ok(WorkerReply::Ack)
            }
            CommandKind::Flush => self.shared.flush_batch().map(WorkerReply::Flushed),
            CommandKind::AddInlet(handle) => self.add_inlet(handle),
            CommandKind::RemoveInlet { source_id } => {
                let mut set = self.shared.set.lock();
                let mut removed = 0;
                while let Some(index) = set
                    .inlets
                    .iter()
                    .position(|i| i.info().source_id == source_id)
                {
                    set.remove(index);
                    removed += 1;
                }
                self.shared.stats.lock().inlets = set.len();
                info!(worker = %self.shared.name, source = %source_id, removed, "inlet removed");
                Ok(WorkerReply::Removed(removed))
            }
            CommandKind::Stats => {
                let mut stats = self.shared.stats.lock().clone();
                stats.inlets = self.shared.set.lock().len();
                Ok(WorkerReply::Stats(stats))
            }
            other @ (CommandKind::SendData { .. } | CommandKind::RecreateOutlet(_)) => {
                Err(other.unsupported(WorkerKind::Inlet))
            }
        }
    }

    fn start(&mut self) -> SyncResult<WorkerReply> {
        if self.poller.is_some() {
            return Ok(WorkerReply::Ack);
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let poller = thread::Builder::new()
            .name(format!("{}-poll", self.shared.name))
            .spawn(move || poll_loop(shared))
            .map_err(|e| SyncError::WorkerFailed(format!("poll thread: {e}")))?;
        self.poller = Some(poller);
        info!(worker = %self.shared.name, "inlet worker started");
        Ok(WorkerReply::Ack)
    }

    fn stop(&mut self) -> SyncResult<WorkerReply> {
        self.shared.running.store(false, Ordering::Release);
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                warn!(worker = %self.shared.name, "poll thread panicked");
            }
        }
        self.shared.set.lock().clear();
        self.shared.flush_batch()?;
        info!(worker = %self.shared.name, "inlet worker stopped");
        Ok(WorkerReply::Ack)
    }

    fn add_inlet(&mut self, handle: StreamHandle) -> SyncResult<WorkerReply> {
        if self.shared.set.lock().contains_address(handle.address()) {
            return Ok(WorkerReply::Ack);
        }
        // Created outside the lock; the transport call may block
        let inlet = self.transport.create_inlet(&handle)?;
        let mut set = self.shared.set.lock();
        set.push(
            inlet,
            ClockCorrection::new(self.shared.options.correction_refresh),
        );
        self.shared.stats.lock().inlets = set.len();
        info!(
            worker = %self.shared.name,
            source = %handle.source_id(),
            address = %handle.address(),
            "inlet added"
        );
        Ok(WorkerReply::Ack)
    }
}

/// Spawn the control thread of an inlet worker
///
/// Polling starts with the first `Start` command.
pub fn spawn_inlet_worker(
    name: String,
    transport: SharedTransport,
    options: WorkerOptions,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
) -> SyncResult<thread::JoinHandle<()>> {
    let shared = Arc::new(InletShared {
        name: name.clone(),
        options,
        set: Mutex::new(InletSet::default()),
        batch: Mutex::new(Vec::new()),
        paused: AtomicBool::new(false),
        running: AtomicBool::new(false),
        stats: Mutex::new(WorkerStats::default()),
        events,
    });
    let worker = InletWorker {
        shared,
        transport,
        poller: None,
    };
    thread::Builder::new()
        .name(name)
        .spawn(move || worker.run(commands))
        .map_err(|e| SyncError::WorkerFailed(format!("inlet worker thread: {e}")))
}
