//! Messages exchanged between the orchestrator and stream workers

use std::fmt;

use syncmesh_core::{RequestId, SyncError, SyncResult};
use syncmesh_transport::{SampleData, StreamHandle, StreamInfo};

/// Which side of a stream a worker serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Inlet,
    Outlet,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerKind::Inlet => "inlet",
            WorkerKind::Outlet => "outlet",
        })
    }
}

/// What a command asks the worker to do
#[derive(Clone, Debug)]
pub enum CommandKind {
    Start,
    Stop,
    Pause,
    Resume { flush_before_resume: bool },
    /// Deliver the pending batch now
    Flush,
    AddInlet(StreamHandle),
    /// Remove every inlet fed by `source_id`
    RemoveInlet { source_id: String },
    SendData {
        data: SampleData,
        timestamp: Option<f64>,
    },
    /// Rebind the outlet to a new stream description
    RecreateOutlet(StreamInfo),
    Stats,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::Pause => "pause",
            CommandKind::Resume { .. } => "resume",
            CommandKind::Flush => "flush",
            CommandKind::AddInlet(_) => "add_inlet",
            CommandKind::RemoveInlet { .. } => "remove_inlet",
            CommandKind::SendData { .. } => "send_data",
            CommandKind::RecreateOutlet(_) => "recreate_outlet",
            CommandKind::Stats => "stats",
        }
    }

    pub(crate) fn unsupported(&self, worker: WorkerKind) -> SyncError {
        SyncError::UnsupportedCommand {
            worker: worker.to_string(),
            command: self.name().to_string(),
        }
    }
}

/// Orchestrator to worker
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    /// Present when the orchestrator awaits a response
    pub request_id: Option<RequestId>,
    pub kind: CommandKind,
}

impl WorkerCommand {
    /// Fire-and-forget command
    pub fn notify(kind: CommandKind) -> Self {
        WorkerCommand {
            request_id: None,
            kind,
        }
    }

    /// Command expecting a response
    pub fn request(kind: CommandKind) -> Self {
        WorkerCommand {
            request_id: Some(RequestId::next()),
            kind,
        }
    }
}

/// One pulled sample with its provenance
#[derive(Clone, Debug, PartialEq)]
pub struct BatchedSample {
    pub source_id: String,
    /// Time stamp reported by the transport, on the producer's clock
    pub timestamp: f64,
    /// Latest correction for the source at pull time
    pub clock_correction: f64,
    pub channel_data: SampleData,
}

impl BatchedSample {
    /// Time stamp mapped onto the local clock
    pub fn corrected_timestamp(&self) -> f64 {
        self.timestamp + self.clock_correction
    }
}

/// Worker counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub samples_pulled: u64,
    pub batches_sent: u64,
    pub samples_sent: u64,
    pub dropped_sends: u64,
    pub discarded_on_resume: u64,
    pub errors: u64,
    pub inlets: usize,
}

/// Successful outcome of a command
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerReply {
    Ack,
    /// Number of samples delivered by a flush
    Flushed(usize),
    /// Number of inlets removed
    Removed(usize),
    /// Description of a recreated outlet, with its new uid
    Recreated(StreamInfo),
    Stats(WorkerStats),
}

/// Worker to orchestrator
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    Data(Vec<BatchedSample>),
    Error {
        source_id: Option<String>,
        error: SyncError,
    },
    Response {
        request_id: RequestId,
        result: SyncResult<WorkerReply>,
    },
}
