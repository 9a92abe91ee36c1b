//! In-process stream transport
//!
//! Every [`MemoryTransport`] clone shares one registry of outlets, so
//! several sessions in one process see each other exactly as they would over
//! a network. Each inlet owns a bounded queue; when it is full the oldest
//! sample is dropped. Per-source clock offsets simulate producers whose
//! clocks disagree with the consumer's.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use syncmesh_core::{local_clock, SyncError, SyncResult, Timestamp};

use crate::{
    ContinuousResolver, Inlet, Outlet, Predicate, Sample, SampleData, StreamHandle, StreamInfo,
    StreamTransport,
};

/// Default per-inlet queue capacity (samples)
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

struct InletQueue {
    samples: Mutex<QueueState>,
    available: Condvar,
}

struct QueueState {
    buffer: VecDeque<Sample>,
    source_lost: bool,
    dropped: u64,
}

impl InletQueue {
    fn new(capacity: usize) -> Self {
        InletQueue {
            samples: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                source_lost: false,
                dropped: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn push(&self, sample: Sample, capacity: usize) {
        let mut state = self.samples.lock();
        if state.buffer.len() >= capacity {
            state.buffer.pop_front();
            state.dropped += 1;
        }
        state.buffer.push_back(sample);
        self.available.notify_one();
    }

    fn mark_lost(&self) {
        self.samples.lock().source_lost = true;
        self.available.notify_all();
    }
}

struct OutletEntry {
    info: StreamInfo,
    subscribers: Vec<Weak<InletQueue>>,
}

#[derive(Default)]
struct RegistryState {
    outlets: BTreeMap<String, OutletEntry>,
    clock_offsets: HashMap<String, f64>,
    next_uid: u64,
}

struct Registry {
    state: Mutex<RegistryState>,
    changed: Condvar,
    queue_capacity: usize,
}

impl Registry {
    fn matching(&self, state: &RegistryState, predicate: &Predicate, max: usize) -> Vec<StreamInfo> {
        state
            .outlets
            .values()
            .filter(|e| predicate.matches(&e.info))
            .take(max)
            .map(|e| e.info.clone())
            .collect()
    }
}

/// Transport whose streams live in this process
#[derive(Clone)]
pub struct MemoryTransport {
    registry: Arc<Registry>,
}

impl MemoryTransport {
    /// Create a new, empty transport
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(capacity: usize) -> Self {
        MemoryTransport {
            registry: Arc::new(Registry {
                state: Mutex::new(RegistryState::default()),
                changed: Condvar::new(),
                queue_capacity: capacity.max(1),
            }),
        }
    }

    /// Make `source_id`'s clock run `offset` seconds ahead of ours
    pub fn set_clock_offset(&self, source_id: impl Into<String>, offset: f64) {
        self.registry
            .state
            .lock()
            .clock_offsets
            .insert(source_id.into(), offset);
    }

    /// Number of live outlets
    pub fn outlet_count(&self) -> usize {
        self.registry.state.lock().outlets.len()
    }

    /// Descriptions of every live outlet
    pub fn outlets(&self) -> Vec<StreamInfo> {
        let state = self.registry.state.lock();
        state.outlets.values().map(|e| e.info.clone()).collect()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("outlets", &self.outlet_count())
            .finish()
    }
}

impl StreamTransport for MemoryTransport {
    fn resolve_streams(
        &self,
        predicate: &Predicate,
        wait: Duration,
        max_streams: usize,
    ) -> SyncResult<Vec<StreamHandle>> {
        let max_streams = max_streams.max(1);
        let deadline = Instant::now() + wait;
        let mut state = self.registry.state.lock();
        loop {
            let found = self.registry.matching(&state, predicate, max_streams);
            if found.len() >= max_streams || Instant::now() >= deadline {
                trace!(%predicate, count = found.len(), "resolve finished");
                return Ok(found.into_iter().map(StreamHandle::new).collect());
            }
            self.registry.changed.wait_until(&mut state, deadline);
        }
    }

    fn create_continuous_resolver(
        &self,
        predicate: &Predicate,
        forget_after: Duration,
        max_streams: usize,
    ) -> SyncResult<Box<dyn ContinuousResolver>> {
        debug!(%predicate, ?forget_after, "continuous resolver created");
        Ok(Box::new(MemoryResolver {
            registry: Arc::clone(&self.registry),
            predicate: predicate.clone(),
            forget_after,
            max_streams: max_streams.max(1),
            seen: Mutex::new(BTreeMap::new()),
        }))
    }

    fn create_outlet(&self, mut info: StreamInfo) -> SyncResult<Box<dyn Outlet>> {
        if info.channel_count == 0 {
            return Err(SyncError::Transport(format!(
                "outlet {} has no channels",
                info.name
            )));
        }
        let clock_offset = {
            let mut state = self.registry.state.lock();
            state.next_uid += 1;
            info.uid = format!("mem-{:08x}", state.next_uid);
            state.outlets.insert(
                info.uid.clone(),
                OutletEntry {
                    info: info.clone(),
                    subscribers: Vec::new(),
                },
            );
            state.clock_offsets.get(&info.source_id).copied().unwrap_or(0.0)
        };
        self.registry.changed.notify_all();
        debug!(stream = %info.name, uid = %info.uid, source = %info.source_id, "outlet created");
        Ok(Box::new(MemoryOutlet {
            registry: Arc::clone(&self.registry),
            info,
            clock_offset,
        }))
    }

    fn create_inlet(&self, handle: &StreamHandle) -> SyncResult<Box<dyn Inlet>> {
        let queue = Arc::new(InletQueue::new(self.registry.queue_capacity));
        let (info, clock_offset) = {
            let mut state = self.registry.state.lock();
            let offset = state
                .clock_offsets
                .get(handle.source_id())
                .copied()
                .unwrap_or(0.0);
            let entry = state
                .outlets
                .get_mut(handle.address())
                .ok_or_else(|| SyncError::StreamUnavailable(handle.info.name.clone()))?;
            entry.subscribers.push(Arc::downgrade(&queue));
            (entry.info.clone(), offset)
        };
        debug!(stream = %info.name, uid = %info.uid, "inlet created");
        Ok(Box::new(MemoryInlet {
            info,
            queue,
            clock_offset,
        }))
    }
}

struct MemoryResolver {
    registry: Arc<Registry>,
    predicate: Predicate,
    forget_after: Duration,
    max_streams: usize,
    seen: Mutex<BTreeMap<String, StreamHandle>>,
}

impl ContinuousResolver for MemoryResolver {
    fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    fn results(&self) -> SyncResult<Vec<StreamHandle>> {
        let now = Timestamp::now();
        let live = {
            let state = self.registry.state.lock();
            self.registry.matching(&state, &self.predicate, usize::MAX)
        };
        let mut seen = self.seen.lock();
        for info in live {
            let handle = seen
                .entry(info.uid.clone())
                .or_insert_with(|| StreamHandle::new(info.clone()));
            handle.info = info;
            handle.observed_at = now;
        }
        seen.retain(|_, h| now.duration_since(h.observed_at) <= self.forget_after);
        Ok(seen.values().take(self.max_streams).cloned().collect())
    }
}

struct MemoryOutlet {
    registry: Arc<Registry>,
    info: StreamInfo,
    clock_offset: f64,
}

impl Outlet for MemoryOutlet {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn push_sample(&mut self, data: SampleData, timestamp: Option<f64>) -> SyncResult<()> {
        if data.data_type() != self.info.data_type {
            return Err(SyncError::DataTypeMismatch {
                expected: self.info.data_type,
                actual: data.data_type(),
            });
        }
        if data.len() != self.info.channel_count {
            return Err(SyncError::ChannelMismatch {
                expected: self.info.channel_count,
                actual: data.len(),
            });
        }
        let sample = Sample {
            data,
            timestamp: timestamp.unwrap_or_else(|| local_clock() + self.clock_offset),
        };

        let mut state = self.registry.state.lock();
        let entry = state
            .outlets
            .get_mut(&self.info.uid)
            .ok_or_else(|| SyncError::StreamUnavailable(self.info.name.clone()))?;
        entry.subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(sample.clone(), self.registry.queue_capacity);
                true
            }
            None => false,
        });
        Ok(())
    }

    fn have_consumers(&self) -> bool {
        let state = self.registry.state.lock();
        state
            .outlets
            .get(&self.info.uid)
            .map(|e| e.subscribers.iter().any(|w| w.strong_count() > 0))
            .unwrap_or(false)
    }
}

impl Drop for MemoryOutlet {
    fn drop(&mut self) {
        let removed = self.registry.state.lock().outlets.remove(&self.info.uid);
        if let Some(entry) = removed {
            for queue in entry.subscribers.iter().filter_map(Weak::upgrade) {
                queue.mark_lost();
            }
        }
        self.registry.changed.notify_all();
        debug!(stream = %self.info.name, uid = %self.info.uid, "outlet destroyed");
    }
}

struct MemoryInlet {
    info: StreamInfo,
    queue: Arc<InletQueue>,
    clock_offset: f64,
}

impl Inlet for MemoryInlet {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn pull_sample(&mut self, timeout: Duration) -> SyncResult<Option<Sample>> {
        let mut state = self.queue.samples.lock();
        if state.buffer.is_empty() && !state.source_lost && !timeout.is_zero() {
            self.queue.available.wait_for(&mut state, timeout);
        }
        match state.buffer.pop_front() {
            Some(sample) => Ok(Some(sample)),
            None if state.source_lost => Err(SyncError::StreamUnavailable(self.info.name.clone())),
            None => Ok(None),
        }
    }

    fn time_correction(&mut self, _timeout: Duration) -> SyncResult<f64> {
        Ok(-self.clock_offset)
    }

    fn flush(&mut self) -> usize {
        let mut state = self.queue.samples.lock();
        let count = state.buffer.len();
        state.buffer.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncmesh_core::DataType;

    fn eeg(source: &str) -> StreamInfo {
        StreamInfo::new("eeg", "EEG", 2, 100.0, DataType::Float32, source).with_session("lab")
    }

    #[test]
    fn test_push_pull() {
        let transport = MemoryTransport::new();
        let mut outlet = transport.create_outlet(eeg("a")).unwrap();
        let handles = transport
            .resolve_streams(&Predicate::name("eeg").unwrap(), Duration::from_millis(10), 4)
            .unwrap();
        assert_eq!(handles.len(), 1);
        assert!(handles[0].address().starts_with("mem-"));

        let mut inlet = transport.create_inlet(&handles[0]).unwrap();
        assert!(outlet.have_consumers());
        outlet
            .push_sample(SampleData::from(vec![1.0f32, 2.0]), Some(3.5))
            .unwrap();
        let sample = inlet.pull_sample(Duration::ZERO).unwrap().unwrap();
        assert_eq!(sample.data, SampleData::Float32(vec![1.0, 2.0]));
        assert_eq!(sample.timestamp, 3.5);
        assert!(inlet.pull_sample(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_push_validates_shape() {
        let transport = MemoryTransport::new();
        let mut outlet = transport.create_outlet(eeg("a")).unwrap();
        assert!(matches!(
            outlet.push_sample(SampleData::from(vec![1.0f32]), None),
            Err(SyncError::ChannelMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            outlet.push_sample(SampleData::from(vec![1i32, 2]), None),
            Err(SyncError::DataTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_resolve_returns_early_at_max() {
        let transport = MemoryTransport::new();
        let _a = transport.create_outlet(eeg("a")).unwrap();
        let started = Instant::now();
        let found = transport
            .resolve_streams(&Predicate::name("eeg").unwrap(), Duration::from_secs(5), 1)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_resolve_waits_for_late_outlet() {
        let transport = MemoryTransport::new();
        let publisher = transport.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.create_outlet(eeg("late")).unwrap()
        });
        let found = transport
            .resolve_streams(&Predicate::name("eeg").unwrap(), Duration::from_secs(2), 1)
            .unwrap();
        assert_eq!(found[0].source_id(), "late");
        drop(t.join().unwrap());
    }

    #[test]
    fn test_queue_drops_oldest() {
        let transport = MemoryTransport::with_queue_capacity(2);
        let mut outlet = transport.create_outlet(eeg("a")).unwrap();
        let handle = StreamHandle::new(outlet.info().clone());
        let mut inlet = transport.create_inlet(&handle).unwrap();
        for i in 0..3 {
            outlet
                .push_sample(SampleData::from(vec![i as f32, 0.0]), Some(i as f64))
                .unwrap();
        }
        assert_eq!(inlet.pull_sample(Duration::ZERO).unwrap().unwrap().timestamp, 1.0);
        assert_eq!(inlet.pull_sample(Duration::ZERO).unwrap().unwrap().timestamp, 2.0);
    }

    #[test]
    fn test_outlet_drop_loses_stream() {
        let transport = MemoryTransport::new();
        let outlet = transport.create_outlet(eeg("a")).unwrap();
        let handle = StreamHandle::new(outlet.info().clone());
        let mut inlet = transport.create_inlet(&handle).unwrap();
        drop(outlet);
        assert_eq!(transport.outlet_count(), 0);
        assert!(matches!(
            inlet.pull_sample(Duration::ZERO),
            Err(SyncError::StreamUnavailable(_))
        ));
        assert!(transport.create_inlet(&handle).is_err());
    }

    #[test]
    fn test_continuous_resolver_forgets() {
        let transport = MemoryTransport::new();
        let resolver = transport
            .create_continuous_resolver(
                &Predicate::name("eeg").unwrap(),
                Duration::from_millis(30),
                8,
            )
            .unwrap();
        let outlet = transport.create_outlet(eeg("a")).unwrap();
        assert_eq!(resolver.results().unwrap().len(), 1);
        drop(outlet);
        // Still remembered inside the forget window
        assert_eq!(resolver.results().unwrap().len(), 1);
        std::thread::sleep(Duration::from_millis(60));
        assert!(resolver.results().unwrap().is_empty());
    }

    #[test]
    fn test_clock_offset_and_correction() {
        let transport = MemoryTransport::new();
        transport.set_clock_offset("remote", 2.0);
        let mut outlet = transport.create_outlet(eeg("remote")).unwrap();
        let handle = StreamHandle::new(outlet.info().clone());
        let mut inlet = transport.create_inlet(&handle).unwrap();
        outlet
            .push_sample(SampleData::from(vec![0.0f32, 0.0]), None)
            .unwrap();
        let sample = inlet.pull_sample(Duration::ZERO).unwrap().unwrap();
        let correction = inlet.time_correction(Duration::from_millis(10)).unwrap();
        assert_eq!(correction, -2.0);
        let corrected = sample.timestamp + correction;
        assert!((corrected - local_clock()).abs() < 0.5);
    }

    #[test]
    fn test_flush_discards_queue() {
        let transport = MemoryTransport::new();
        let mut outlet = transport.create_outlet(eeg("a")).unwrap();
        let handle = StreamHandle::new(outlet.info().clone());
        let mut inlet = transport.create_inlet(&handle).unwrap();
        for _ in 0..5 {
            outlet
                .push_sample(SampleData::from(vec![0.0f32, 0.0]), None)
                .unwrap();
        }
        assert_eq!(inlet.flush(), 5);
        assert!(inlet.pull_sample(Duration::ZERO).unwrap().is_none());
    }
}
