//! Discovery engine
//!
//! Two ways to find streams:
//! - a bounded one-shot resolve, run on the blocking pool so the caller's
//!   executor thread never waits on the transport
//! - a continuous session: a transport resolver refreshed on a fixed
//!   interval by its own task, publishing [`DiscoveryEvent::PeriodicDiscovery`]
//!   and caching the latest results
//!
//! Refresh failures are published and logged; the next tick retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use syncmesh_core::{
    transport_keys, EventBus, Lifecycle, Resource, ResourceState, ResolverId, SessionConfig,
    SyncError, SyncResult,
};
use syncmesh_transport::{ContinuousResolver, Predicate, SharedTransport, StreamHandle};

use crate::DiscoveryEvent;

/// Discovery tuning
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryConfig {
    /// Age after which unobserved streams drop out of continuous results
    pub forget_after: Duration,
    /// Upper bound on handles per resolve
    pub max_streams: usize,
    /// Refresh interval of continuous sessions
    pub poll_interval: Duration,
    /// Wait used for one-shot resolves without an explicit timeout
    pub resolve_wait: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            forget_after: Duration::from_secs(5),
            max_streams: 32,
            poll_interval: Duration::from_secs(2),
            resolve_wait: Duration::from_secs(1),
        }
    }
}

impl DiscoveryConfig {
    /// Derive discovery settings from a session configuration
    ///
    /// Timing follows the coordination settings; `transport_config` keys
    /// override them. A resolve must be able to return every member of a
    /// full session plus this node's own advertisement, so `max_streams`
    /// never drops below `max_nodes + 1`.
    pub fn from_session(config: &SessionConfig) -> SyncResult<Self> {
        let coordination = config.coordination();
        let required = coordination.max_nodes().saturating_add(1);
        let mut discovery = DiscoveryConfig {
            forget_after: coordination.node_timeout(),
            // Headroom for outlets republished on a role change
            max_streams: DiscoveryConfig::default()
                .max_streams
                .max(coordination.max_nodes().saturating_mul(2))
                .max(required),
            poll_interval: coordination.discovery_interval(),
            resolve_wait: coordination.join_timeout(),
        };
        if let Some(max) = config.transport_setting::<usize>(transport_keys::MAX_STREAMS)? {
            if max < required {
                return Err(SyncError::InvalidConfig(format!(
                    "max_streams ({max}) must exceed max_nodes ({})",
                    coordination.max_nodes()
                )));
            }
            discovery.max_streams = max;
        }
        if let Some(ms) = config.transport_setting::<u64>(transport_keys::RESOLVE_WAIT_MS)? {
            discovery.resolve_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = config.transport_setting::<u64>(transport_keys::FORGET_AFTER_MS)? {
            discovery.forget_after = Duration::from_millis(ms);
        }
        Ok(discovery)
    }
}

struct DiscoverySession {
    predicate: Predicate,
    task: JoinHandle<()>,
}

type HandleCache = Arc<Mutex<HashMap<ResolverId, Vec<StreamHandle>>>>;

/// Predicate-based stream discovery over a transport
pub struct DiscoveryEngine {
    transport: SharedTransport,
    config: DiscoveryConfig,
    lifecycle: Lifecycle,
    events: EventBus<DiscoveryEvent>,
    sessions: Mutex<HashMap<ResolverId, DiscoverySession>>,
    cache: HandleCache,
    paused: Arc<AtomicBool>,
}

impl DiscoveryEngine {
    /// Create a new discovery engine
    pub fn new(transport: SharedTransport, config: DiscoveryConfig) -> Self {
        DiscoveryEngine {
            transport,
            config,
            lifecycle: Lifecycle::new("discovery"),
            events: EventBus::default(),
            sessions: Mutex::new(HashMap::new()),
            cache: Arc::new(Mutex::new(HashMap::new())),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<DiscoveryEvent> {
        &self.events
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Discover streams matching `predicate`
    ///
    /// Without a timeout, starts (or reuses) a continuous session and
    /// returns an empty list right away; results arrive as events. With a
    /// timeout, waits up to that long and returns what was resolved.
    pub async fn discover_by_predicate(
        &self,
        predicate: &Predicate,
        timeout: Option<Duration>,
    ) -> SyncResult<Vec<StreamHandle>> {
        self.lifecycle.ensure_not_disposed()?;
        match timeout {
            Some(wait) => self.resolve_once(predicate, wait).await,
            None => {
                if self.find_session(predicate).is_none() {
                    self.start_continuous_discovery(predicate.clone()).await?;
                }
                Ok(Vec::new())
            }
        }
    }

    /// One bounded resolve
    pub async fn resolve_once(
        &self,
        predicate: &Predicate,
        wait: Duration,
    ) -> SyncResult<Vec<StreamHandle>> {
        let transport = Arc::clone(&self.transport);
        let query = predicate.clone();
        let max_streams = self.config.max_streams;
        let resolved = tokio::task::spawn_blocking(move || {
            transport.resolve_streams(&query, wait, max_streams)
        })
        .await
        .map_err(|e| SyncError::Transport(format!("resolve task failed: {e}")))?;

        match resolved {
            Ok(handles) if handles.is_empty() => {
                debug!(%predicate, ?wait, "resolve timed out without results");
                self.events.emit(DiscoveryEvent::DiscoveryTimeout {
                    predicate: predicate.clone(),
                    duration: wait,
                });
                Ok(handles)
            }
            Ok(handles) => {
                debug!(%predicate, count = handles.len(), "streams resolved");
                self.events.emit(DiscoveryEvent::NodesDiscovered {
                    predicate: predicate.clone(),
                    count: handles.len(),
                });
                Ok(handles)
            }
            Err(err) => {
                warn!(%predicate, error = %err, "resolve failed");
                self.events.emit(DiscoveryEvent::DiscoveryError {
                    resolver_id: None,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Start a continuous discovery session
    pub async fn start_continuous_discovery(&self, predicate: Predicate) -> SyncResult<ResolverId> {
        self.lifecycle.ensure_not_disposed()?;
        let resolver = self.create_resolver(&predicate).await?;
        let id = ResolverId::next();
        let task = self.spawn_refresh(id, resolver);
        self.sessions.lock().insert(
            id,
            DiscoverySession {
                predicate: predicate.clone(),
                task,
            },
        );
        info!(resolver = %id, %predicate, "continuous discovery started");
        self.events.emit(DiscoveryEvent::ResolverCreated {
            resolver_id: id,
            predicate,
        });
        Ok(id)
    }

    /// Stop a continuous discovery session; returns whether it existed
    pub fn stop_continuous_discovery(&self, id: ResolverId) -> bool {
        let removed = self.sessions.lock().remove(&id);
        match removed {
            Some(session) => {
                session.task.abort();
                self.cache.lock().remove(&id);
                debug!(resolver = %id, predicate = %session.predicate, "continuous discovery stopped");
                self.events.emit(DiscoveryEvent::ResolverStopped { resolver_id: id });
                true
            }
            None => false,
        }
    }

    /// Swap the predicate of a running session
    ///
    /// The old resolver is destroyed and a new one created under the same id,
    /// announced again with [`DiscoveryEvent::ResolverCreated`].
    pub async fn replace_predicate(&self, id: ResolverId, predicate: Predicate) -> SyncResult<()> {
        if !self.sessions.lock().contains_key(&id) {
            return Err(SyncError::InvalidConfig(format!(
                "unknown discovery session {id}"
            )));
        }
        let resolver = self.create_resolver(&predicate).await?;
        let task = self.spawn_refresh(id, resolver);
        let previous = self.sessions.lock().insert(
            id,
            DiscoverySession {
                predicate: predicate.clone(),
                task,
            },
        );
        if let Some(old) = previous {
            old.task.abort();
        }
        self.cache.lock().remove(&id);
        info!(resolver = %id, %predicate, "discovery predicate replaced");
        self.events.emit(DiscoveryEvent::ResolverCreated {
            resolver_id: id,
            predicate,
        });
        Ok(())
    }

    /// Latest results of a continuous session
    pub fn results(&self, id: ResolverId) -> Option<Vec<StreamHandle>> {
        self.cache.lock().get(&id).cloned()
    }

    pub fn predicate_of(&self, id: ResolverId) -> Option<Predicate> {
        self.sessions.lock().get(&id).map(|s| s.predicate.clone())
    }

    /// Session currently running `predicate`, if any
    pub fn find_session(&self, predicate: &Predicate) -> Option<ResolverId> {
        self.sessions
            .lock()
            .iter()
            .find(|(_, s)| &s.predicate == predicate)
            .map(|(id, _)| *id)
    }

    pub fn active_sessions(&self) -> Vec<ResolverId> {
        self.sessions.lock().keys().copied().collect()
    }

    /// Move every cached handle matching `predicate` out to the caller
    ///
    /// Taken handles are not offered again until the owning session's next
    /// refresh.
    pub fn take_matching(&self, predicate: &Predicate) -> Vec<StreamHandle> {
        let mut taken: Vec<StreamHandle> = Vec::new();
        let mut cache = self.cache.lock();
        for handles in cache.values_mut() {
            let (matching, rest): (Vec<_>, Vec<_>) = handles
                .drain(..)
                .partition(|h| predicate.matches(&h.info));
            *handles = rest;
            for handle in matching {
                if !taken.iter().any(|t| t.address() == handle.address()) {
                    taken.push(handle);
                }
            }
        }
        taken
    }

    async fn create_resolver(&self, predicate: &Predicate) -> SyncResult<Arc<dyn ContinuousResolver>> {
        let transport = Arc::clone(&self.transport);
        let query = predicate.clone();
        let forget_after = self.config.forget_after;
        let max_streams = self.config.max_streams;
        let created = tokio::task::spawn_blocking(move || {
            transport.create_continuous_resolver(&query, forget_after, max_streams)
        })
        .await
        .map_err(|e| SyncError::Transport(format!("resolver task failed: {e}")))?;
        match created {
            Ok(resolver) => Ok(Arc::from(resolver)),
            Err(err) => {
                warn!(%predicate, error = %err, "resolver creation failed");
                self.events.emit(DiscoveryEvent::DiscoveryError {
                    resolver_id: None,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn spawn_refresh(&self, id: ResolverId, resolver: Arc<dyn ContinuousResolver>) -> JoinHandle<()> {
        let events = self.events.clone();
        let cache = Arc::clone(&self.cache);
        let paused = Arc::clone(&self.paused);
        let interval = self.config.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if paused.load(Ordering::Acquire) {
                    continue;
                }
                let current = Arc::clone(&resolver);
                match tokio::task::spawn_blocking(move || current.results()).await {
                    Ok(Ok(handles)) => {
                        cache.lock().insert(id, handles.clone());
                        events.emit(DiscoveryEvent::PeriodicDiscovery {
                            resolver_id: id,
                            count: handles.len(),
                            handles,
                        });
                    }
                    Ok(Err(err)) => {
                        warn!(resolver = %id, error = %err, "periodic discovery failed");
                        events.emit(DiscoveryEvent::DiscoveryError {
                            resolver_id: Some(id),
                            reason: err.to_string(),
                        });
                    }
                    Err(join_err) if join_err.is_cancelled() => break,
                    Err(join_err) => {
                        warn!(resolver = %id, error = %join_err, "periodic discovery panicked");
                        events.emit(DiscoveryEvent::DiscoveryError {
                            resolver_id: Some(id),
                            reason: join_err.to_string(),
                        });
                    }
                }
            }
        })
    }

    fn stop_all(&self) {
        let drained: Vec<ResolverId> = self.sessions.lock().keys().copied().collect();
        for id in drained {
            self.stop_continuous_discovery(id);
        }
    }
}

impl Resource for DiscoveryEngine {
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
        self.lifecycle.transition(ResourceState::Active, "ready")?;
        Ok(ResourceState::Active)
    }

    async fn activate(&mut self) -> SyncResult<()> {
        self.lifecycle.transition(ResourceState::Active, "activate")?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn deactivate(&mut self) -> SyncResult<()> {
        self.lifecycle.transition(ResourceState::Idle, "deactivate")?;
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn dispose(&mut self) -> SyncResult<()> {
        let state = self.lifecycle.state();
        if state.is_terminal() {
            return Ok(());
        }
        self.stop_all();
        if !matches!(
            state,
            ResourceState::Created | ResourceState::Stopped | ResourceState::Error
        ) {
            self.lifecycle.transition(ResourceState::Stopping, "dispose")?;
            self.lifecycle.transition(ResourceState::Stopped, "sessions stopped")?;
        }
        self.lifecycle.transition(ResourceState::Disposed, "disposed")
    }

    fn health_check(&self) -> bool {
        self.lifecycle.state().is_running()
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        for (_, session) in self.sessions.get_mut().drain() {
            session.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use syncmesh_core::{CoordinationConfig, DataType};
    use syncmesh_transport::{Inlet, MemoryTransport, Outlet, StreamInfo, StreamTransport};
    use tokio::sync::broadcast;

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            forget_after: Duration::from_millis(200),
            max_streams: 8,
            poll_interval: Duration::from_millis(20),
            resolve_wait: Duration::from_millis(50),
        }
    }

    fn eeg(source: &str) -> StreamInfo {
        StreamInfo::new("eeg", "EEG", 2, 100.0, DataType::Float32, source)
    }

    async fn next_matching<F>(
        rx: &mut broadcast::Receiver<syncmesh_core::Envelope<DiscoveryEvent>>,
        mut pred: F,
    ) -> DiscoveryEvent
    where
        F: FnMut(&DiscoveryEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(env) = rx.recv().await {
                    if pred(&env.event) {
                        return env.event;
                    }
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_one_shot_timeout() {
        let engine = DiscoveryEngine::new(Arc::new(MemoryTransport::new()), fast_config());
        let mut rx = engine.events().subscribe();
        let found = engine
            .discover_by_predicate(&Predicate::name("eeg").unwrap(), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(found.is_empty());
        let event = rx.recv().await.unwrap().event;
        assert!(matches!(
            event,
            DiscoveryEvent::DiscoveryTimeout { duration, .. } if duration == Duration::from_millis(30)
        ));
    }

    #[tokio::test]
    async fn test_one_shot_finds_outlet() {
        let transport = MemoryTransport::new();
        let _outlet = transport.create_outlet(eeg("a")).unwrap();
        let engine = DiscoveryEngine::new(Arc::new(transport), fast_config());
        let mut rx = engine.events().subscribe();
        let found = engine
            .discover_by_predicate(&Predicate::name("eeg").unwrap(), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap().event,
            DiscoveryEvent::NodesDiscovered { count: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_continuous_discovery_reuses_session() {
        let transport = MemoryTransport::new();
        let engine = DiscoveryEngine::new(Arc::new(transport.clone()), fast_config());
        let mut rx = engine.events().subscribe();
        let predicate = Predicate::name("eeg").unwrap();

        assert!(engine.discover_by_predicate(&predicate, None).await.unwrap().is_empty());
        assert!(engine.discover_by_predicate(&predicate, None).await.unwrap().is_empty());
        assert_eq!(engine.active_sessions().len(), 1);

        let _outlet = transport.create_outlet(eeg("a")).unwrap();
        let event = next_matching(&mut rx, |e| {
            matches!(e, DiscoveryEvent::PeriodicDiscovery { count, .. } if *count == 1)
        })
        .await;
        let DiscoveryEvent::PeriodicDiscovery { resolver_id, .. } = event else {
            unreachable!()
        };
        assert_eq!(engine.results(resolver_id).unwrap().len(), 1);

        let taken = engine.take_matching(&predicate);
        assert_eq!(taken.len(), 1);
        assert!(engine.results(resolver_id).unwrap().is_empty());
        assert!(engine.take_matching(&predicate).is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_replace() {
        let transport = MemoryTransport::new();
        let _eeg = transport.create_outlet(eeg("a")).unwrap();
        let _emg = transport
            .create_outlet(StreamInfo::new("emg", "EMG", 1, 10.0, DataType::Int16, "b"))
            .unwrap();
        let engine = DiscoveryEngine::new(Arc::new(transport), fast_config());
        let mut rx = engine.events().subscribe();

        let id = engine
            .start_continuous_discovery(Predicate::name("eeg").unwrap())
            .await
            .unwrap();
        engine
            .replace_predicate(id, Predicate::name("emg").unwrap())
            .await
            .unwrap();
        assert_eq!(engine.predicate_of(id), Some(Predicate::name("emg").unwrap()));
        let emg = Predicate::name("emg").unwrap();
        let created = next_matching(&mut rx, |e| {
            matches!(e, DiscoveryEvent::ResolverCreated { predicate, .. } if *predicate == emg)
        })
        .await;
        assert!(matches!(created, DiscoveryEvent::ResolverCreated { resolver_id, .. } if resolver_id == id));
        next_matching(&mut rx, |e| match e {
            DiscoveryEvent::PeriodicDiscovery { handles, .. } => {
                handles.len() == 1 && handles[0].stream_name() == "emg"
            }
            _ => false,
        })
        .await;

        assert!(engine.stop_continuous_discovery(id));
        assert!(!engine.stop_continuous_discovery(id));
        assert!(engine.results(id).is_none());
        assert!(engine
            .replace_predicate(id, Predicate::any())
            .await
            .is_err());
    }

    struct FlakyTransport {
        inner: MemoryTransport,
        failures: Arc<AtomicUsize>,
    }

    struct FlakyResolver {
        inner: Box<dyn ContinuousResolver>,
        failures: Arc<AtomicUsize>,
    }

    impl ContinuousResolver for FlakyResolver {
        fn predicate(&self) -> &Predicate {
            self.inner.predicate()
        }

        fn results(&self) -> SyncResult<Vec<StreamHandle>> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::Transport("network unreachable".into()));
            }
            self.inner.results()
        }
    }

    impl StreamTransport for FlakyTransport {
        fn resolve_streams(
            &self,
            predicate: &Predicate,
            wait: Duration,
            max_streams: usize,
        ) -> SyncResult<Vec<StreamHandle>> {
            self.inner.resolve_streams(predicate, wait, max_streams)
        }

        fn create_continuous_resolver(
            &self,
            predicate: &Predicate,
            forget_after: Duration,
            max_streams: usize,
        ) -> SyncResult<Box<dyn ContinuousResolver>> {
            Ok(Box::new(FlakyResolver {
                inner: self
                    .inner
                    .create_continuous_resolver(predicate, forget_after, max_streams)?,
                failures: Arc::clone(&self.failures),
            }))
        }

        fn create_outlet(&self, info: StreamInfo) -> SyncResult<Box<dyn Outlet>> {
            self.inner.create_outlet(info)
        }

        fn create_inlet(&self, handle: &StreamHandle) -> SyncResult<Box<dyn Inlet>> {
            self.inner.create_inlet(handle)
        }
    }

    #[tokio::test]
    async fn test_refresh_errors_do_not_stop_timer() {
        let inner = MemoryTransport::new();
        let _outlet = inner.create_outlet(eeg("a")).unwrap();
        let transport = FlakyTransport {
            inner,
            failures: Arc::new(AtomicUsize::new(2)),
        };
        let engine = DiscoveryEngine::new(Arc::new(transport), fast_config());
        let mut rx = engine.events().subscribe();
        engine
            .start_continuous_discovery(Predicate::name("eeg").unwrap())
            .await
            .unwrap();

        next_matching(&mut rx, |e| matches!(e, DiscoveryEvent::DiscoveryError { resolver_id: Some(_), .. })).await;
        next_matching(&mut rx, |e| matches!(e, DiscoveryEvent::PeriodicDiscovery { count: 1, .. })).await;
    }

    #[tokio::test]
    async fn test_lifecycle_and_double_dispose() {
        let mut engine = DiscoveryEngine::new(Arc::new(MemoryTransport::new()), fast_config());
        assert_eq!(engine.initialize().await.unwrap(), ResourceState::Active);
        assert!(engine.health_check());
        engine
            .start_continuous_discovery(Predicate::any())
            .await
            .unwrap();
        engine.deactivate().await.unwrap();
        assert_eq!(engine.resource_state(), ResourceState::Idle);
        engine.activate().await.unwrap();

        engine.dispose().await.unwrap();
        engine.dispose().await.unwrap();
        assert_eq!(engine.resource_state(), ResourceState::Disposed);
        assert!(engine.active_sessions().is_empty());
        assert!(engine
            .discover_by_predicate(&Predicate::any(), None)
            .await
            .is_err());
    }

    #[test]
    fn test_config_from_session_overrides() {
        let small = CoordinationConfig::builder().max_nodes(3).build().unwrap();
        let config = SessionConfig::builder("lab", "node")
            .coordination(small)
            .transport_setting(transport_keys::MAX_STREAMS, "4")
            .transport_setting(transport_keys::FORGET_AFTER_MS, "750")
            .build()
            .unwrap();
        let discovery = DiscoveryConfig::from_session(&config).unwrap();
        assert_eq!(discovery.max_streams, 4);
        assert_eq!(discovery.forget_after, Duration::from_millis(750));
        assert_eq!(discovery.poll_interval, Duration::from_secs(2));

        let bad = SessionConfig::builder("lab", "node")
            .transport_setting(transport_keys::MAX_STREAMS, "many")
            .build()
            .unwrap();
        assert!(DiscoveryConfig::from_session(&bad).is_err());
    }

    #[test]
    fn test_max_streams_covers_every_member() {
        let large = CoordinationConfig::builder().max_nodes(100).build().unwrap();
        let config = SessionConfig::builder("lab", "node")
            .coordination(large.clone())
            .build()
            .unwrap();
        assert!(DiscoveryConfig::from_session(&config).unwrap().max_streams > 100);

        let defaults = SessionConfig::builder("lab", "node").build().unwrap();
        let max_nodes = defaults.coordination().max_nodes();
        assert!(DiscoveryConfig::from_session(&defaults).unwrap().max_streams > max_nodes);

        let capped = SessionConfig::builder("lab", "node")
            .coordination(large)
            .transport_setting(transport_keys::MAX_STREAMS, "100")
            .build()
            .unwrap();
        assert!(matches!(
            DiscoveryConfig::from_session(&capped),
            Err(SyncError::InvalidConfig(_))
        ));
    }
}
