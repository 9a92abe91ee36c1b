//! Session and stream configuration
//!
//! All configuration values are immutable once built and validated in their
//! constructors, so an invalid combination fails at construction time and
//! never at use time. The serde representations route through the same
//! validation (`try_from`), with durations expressed in milliseconds.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Capability, NodeId, NodeRole, SessionId, SyncError, SyncResult};

/// Connection shape of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Every node connects to every other node
    Peer2Peer,
    /// One server, many clients
    Hierarchical,
    /// A leader plus a peer mesh
    Hybrid,
}

impl Topology {
    /// Whether a coordinator must be elected in this topology
    pub fn supports_election(self) -> bool {
        !matches!(self, Topology::Peer2Peer)
    }

    /// Role of the node that creates the network
    pub fn creator_role(self) -> NodeRole {
        match self {
            Topology::Peer2Peer => NodeRole::Peer,
            Topology::Hierarchical => NodeRole::Server,
            Topology::Hybrid => NodeRole::Leader,
        }
    }

    /// Role of a node joining an existing network
    pub fn joiner_role(self) -> NodeRole {
        match self {
            Topology::Peer2Peer => NodeRole::Peer,
            Topology::Hierarchical | Topology::Hybrid => NodeRole::Client,
        }
    }

    /// Role taken by a node that wins an election
    pub fn elected_role(self) -> NodeRole {
        match self {
            Topology::Peer2Peer => NodeRole::Peer,
            Topology::Hierarchical => NodeRole::Coordinator,
            Topology::Hybrid => NodeRole::Leader,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topology::Peer2Peer => "peer2peer",
            Topology::Hierarchical => "hierarchical",
            Topology::Hybrid => "hybrid",
        })
    }
}

impl FromStr for Topology {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "peer2peer" => Ok(Topology::Peer2Peer),
            "hierarchical" => Ok(Topology::Hierarchical),
            "hybrid" => Ok(Topology::Hybrid),
            _ => Err(SyncError::InvalidConfig(format!("unknown topology: {s:?}"))),
        }
    }
}

/// Channel value type of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float32,
    Double64,
    Int8,
    Int16,
    Int32,
    Int64,
    String,
}

impl DataType {
    /// Size of one channel value on the wire; `None` for variable-size strings
    pub fn value_size(self) -> Option<usize> {
        match self {
            DataType::Float32 | DataType::Int32 => Some(4),
            DataType::Double64 | DataType::Int64 => Some(8),
            DataType::Int8 => Some(1),
            DataType::Int16 => Some(2),
            DataType::String => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataType::Float32 => "float32",
            DataType::Double64 => "double64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::String => "string",
        })
    }
}

impl FromStr for DataType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" => Ok(DataType::Float32),
            "double64" => Ok(DataType::Double64),
            "int8" => Ok(DataType::Int8),
            "int16" => Ok(DataType::Int16),
            "int32" => Ok(DataType::Int32),
            "int64" => Ok(DataType::Int64),
            "string" => Ok(DataType::String),
            _ => Err(SyncError::InvalidConfig(format!(
                "unsupported data type: {s:?}"
            ))),
        }
    }
}

/// Which side(s) of a stream this node runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationMode {
    /// Outlet only
    Producer,
    /// Inlet only
    Consumer,
    /// Outlet and inlet
    #[default]
    Both,
}

impl ParticipationMode {
    pub fn produces(self) -> bool {
        matches!(self, ParticipationMode::Producer | ParticipationMode::Both)
    }

    pub fn consumes(self) -> bool {
        matches!(self, ParticipationMode::Consumer | ParticipationMode::Both)
    }
}

/// How a coordinator is chosen when none is known
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStrategy {
    /// Earliest started node wins
    #[default]
    FirstReady,
    /// Lowest locally generated roll wins (best effort)
    RandomRoll,
}

// ============================================================================
// STREAM CONFIG
// ============================================================================

/// Immutable configuration of one data stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStreamConfig")]
pub struct StreamConfig {
    name: String,
    channels: u32,
    sample_rate: f64,
    data_type: DataType,
    participation_mode: ParticipationMode,
    precise_polling: bool,
    content_type: String,
}

impl StreamConfig {
    /// Validate and build a stream configuration with default mode
    /// (`Both`), timer polling and content type `"data"`
    pub fn new(
        name: impl Into<String>,
        channels: u32,
        sample_rate: f64,
        data_type: DataType,
    ) -> SyncResult<Self> {
        StreamConfigBuilder::new(name)
            .channels(channels)
            .sample_rate(sample_rate)
            .data_type(data_type)
            .build()
    }

    pub fn builder(name: impl Into<String>) -> StreamConfigBuilder {
        StreamConfigBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn participation_mode(&self) -> ParticipationMode {
        self.participation_mode
    }

    pub fn precise_polling(&self) -> bool {
        self.precise_polling
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Nominal interval between two samples
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sample_rate)
    }
}

/// Builder for [`StreamConfig`]; validation happens in [`build`](Self::build)
#[derive(Clone, Debug)]
pub struct StreamConfigBuilder {
    raw: RawStreamConfig,
}

impl StreamConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        StreamConfigBuilder {
            raw: RawStreamConfig {
                name: name.into(),
                channels: 1,
                sample_rate: 1.0,
                data_type: DataType::Float32,
                participation_mode: ParticipationMode::default(),
                precise_polling: false,
                content_type: default_content_type(),
            },
        }
    }

    pub fn channels(mut self, channels: u32) -> Self {
        self.raw.channels = channels as i64;
        self
    }

    pub fn sample_rate(mut self, sample_rate: f64) -> Self {
        self.raw.sample_rate = sample_rate;
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.raw.data_type = data_type;
        self
    }

    pub fn participation_mode(mut self, mode: ParticipationMode) -> Self {
        self.raw.participation_mode = mode;
        self
    }

    pub fn precise_polling(mut self, precise: bool) -> Self {
        self.raw.precise_polling = precise;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.raw.content_type = content_type.into();
        self
    }

    pub fn build(self) -> SyncResult<StreamConfig> {
        StreamConfig::try_from(self.raw)
    }
}

/// Serialized form of [`StreamConfig`]
#[derive(Clone, Debug, Deserialize)]
pub struct RawStreamConfig {
    pub name: String,
    pub channels: i64,
    pub sample_rate: f64,
    pub data_type: DataType,
    #[serde(default)]
    pub participation_mode: ParticipationMode,
    #[serde(default)]
    pub precise_polling: bool,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "data".to_string()
}

fn validate_label(field: &str, value: &str) -> SyncResult<()> {
    if value.trim().is_empty() {
        return Err(SyncError::InvalidConfig(format!("{field} must not be empty")));
    }
    // Labels are embedded in quoted discovery predicates
    if value.contains('\'') {
        return Err(SyncError::InvalidConfig(format!(
            "{field} must not contain quotes: {value:?}"
        )));
    }
    Ok(())
}

impl TryFrom<RawStreamConfig> for StreamConfig {
    type Error = SyncError;

    fn try_from(raw: RawStreamConfig) -> Result<Self, Self::Error> {
        validate_label("stream name", &raw.name)?;
        validate_label("content type", &raw.content_type)?;
        if raw.channels <= 0 || raw.channels > u32::MAX as i64 {
            return Err(SyncError::InvalidConfig(format!(
                "channel count must be positive, got {}",
                raw.channels
            )));
        }
        if !raw.sample_rate.is_finite() || raw.sample_rate <= 0.0 {
            return Err(SyncError::InvalidConfig(format!(
                "sample rate must be positive and finite, got {}",
                raw.sample_rate
            )));
        }
        Ok(StreamConfig {
            name: raw.name,
            channels: raw.channels as u32,
            sample_rate: raw.sample_rate,
            data_type: raw.data_type,
            participation_mode: raw.participation_mode,
            precise_polling: raw.precise_polling,
            content_type: raw.content_type,
        })
    }
}

// ============================================================================
// COORDINATION CONFIG
// ============================================================================

/// Timing and size limits of a coordination session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinationConfig", into = "RawCoordinationConfig")]
pub struct CoordinationConfig {
    min_nodes: usize,
    max_nodes: usize,
    heartbeat_interval: Duration,
    discovery_interval: Duration,
    node_timeout: Duration,
    join_timeout: Duration,
}

impl CoordinationConfig {
    pub fn builder() -> CoordinationConfigBuilder {
        CoordinationConfigBuilder::default()
    }

    pub fn min_nodes(&self) -> usize {
        self.min_nodes
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn discovery_interval(&self) -> Duration {
        self.discovery_interval
    }

    pub fn node_timeout(&self) -> Duration {
        self.node_timeout
    }

    /// Bounded wait for an existing network during `join`
    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        CoordinationConfig {
            min_nodes: 1,
            max_nodes: 64,
            heartbeat_interval: Duration::from_secs(1),
            discovery_interval: Duration::from_secs(2),
            node_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(1),
        }
    }
}

/// Builder for [`CoordinationConfig`]
#[derive(Clone, Debug)]
pub struct CoordinationConfigBuilder {
    raw: RawCoordinationConfig,
}

impl Default for CoordinationConfigBuilder {
    fn default() -> Self {
        CoordinationConfigBuilder {
            raw: CoordinationConfig::default().into(),
        }
    }
}

impl CoordinationConfigBuilder {
    pub fn min_nodes(mut self, n: usize) -> Self {
        self.raw.min_nodes = n;
        self
    }

    pub fn max_nodes(mut self, n: usize) -> Self {
        self.raw.max_nodes = n;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.raw.heartbeat_interval_ms = duration_ms(d);
        self
    }

    pub fn discovery_interval(mut self, d: Duration) -> Self {
        self.raw.discovery_interval_ms = duration_ms(d);
        self
    }

    pub fn node_timeout(mut self, d: Duration) -> Self {
        self.raw.node_timeout_ms = duration_ms(d);
        self
    }

    pub fn join_timeout(mut self, d: Duration) -> Self {
        self.raw.join_timeout_ms = duration_ms(d);
        self
    }

    pub fn build(self) -> SyncResult<CoordinationConfig> {
        CoordinationConfig::try_from(self.raw)
    }
}

/// Serialized form of [`CoordinationConfig`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawCoordinationConfig {
    #[serde(default = "default_min_nodes")]
    pub min_nodes: usize,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_discovery_ms")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

/// Whole milliseconds, saturating at `u64::MAX`
fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn default_min_nodes() -> usize {
    1
}

fn default_max_nodes() -> usize {
    64
}

fn default_heartbeat_ms() -> u64 {
    1_000
}

fn default_discovery_ms() -> u64 {
    2_000
}

fn default_node_timeout_ms() -> u64 {
    5_000
}

fn default_join_timeout_ms() -> u64 {
    1_000
}

impl From<CoordinationConfig> for RawCoordinationConfig {
    fn from(c: CoordinationConfig) -> Self {
        RawCoordinationConfig {
            min_nodes: c.min_nodes,
            max_nodes: c.max_nodes,
            heartbeat_interval_ms: duration_ms(c.heartbeat_interval),
            discovery_interval_ms: duration_ms(c.discovery_interval),
            node_timeout_ms: duration_ms(c.node_timeout),
            join_timeout_ms: duration_ms(c.join_timeout),
        }
    }
}

impl TryFrom<RawCoordinationConfig> for CoordinationConfig {
    type Error = SyncError;

    fn try_from(raw: RawCoordinationConfig) -> Result<Self, Self::Error> {
        if raw.min_nodes == 0 {
            return Err(SyncError::InvalidConfig("min_nodes must be at least 1".into()));
        }
        if raw.max_nodes < raw.min_nodes {
            return Err(SyncError::InvalidConfig(format!(
                "max_nodes ({}) must be >= min_nodes ({})",
                raw.max_nodes, raw.min_nodes
            )));
        }
        if raw.heartbeat_interval_ms == 0 {
            return Err(SyncError::InvalidConfig("heartbeat interval must be positive".into()));
        }
        if raw.discovery_interval_ms == 0 {
            return Err(SyncError::InvalidConfig("discovery interval must be positive".into()));
        }
        let min_timeout_ms = raw.heartbeat_interval_ms.checked_mul(2).ok_or_else(|| {
            SyncError::InvalidConfig(format!(
                "heartbeat interval ({} ms) out of range",
                raw.heartbeat_interval_ms
            ))
        })?;
        if raw.node_timeout_ms < min_timeout_ms {
            return Err(SyncError::InvalidConfig(format!(
                "node timeout ({} ms) must be at least twice the heartbeat interval ({} ms)",
                raw.node_timeout_ms, raw.heartbeat_interval_ms
            )));
        }
        if raw.discovery_interval_ms >= raw.node_timeout_ms {
            return Err(SyncError::InvalidConfig(format!(
                "discovery interval ({} ms) must be shorter than node timeout ({} ms)",
                raw.discovery_interval_ms, raw.node_timeout_ms
            )));
        }
        if raw.join_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig("join timeout must be positive".into()));
        }
        Ok(CoordinationConfig {
            min_nodes: raw.min_nodes,
            max_nodes: raw.max_nodes,
            heartbeat_interval: Duration::from_millis(raw.heartbeat_interval_ms),
            discovery_interval: Duration::from_millis(raw.discovery_interval_ms),
            node_timeout: Duration::from_millis(raw.node_timeout_ms),
            join_timeout: Duration::from_millis(raw.join_timeout_ms),
        })
    }
}

// ============================================================================
// SESSION CONFIG
// ============================================================================

/// Recognised `transport_config` keys
pub mod transport_keys {
    /// Upper bound on handles returned by one resolve
    pub const MAX_STREAMS: &str = "max_streams";
    /// Wait used by one-shot resolves without an explicit timeout
    pub const RESOLVE_WAIT_MS: &str = "resolve_wait_ms";
    /// Age after which unobserved discovery results are dropped
    pub const FORGET_AFTER_MS: &str = "forget_after_ms";
}

/// Immutable configuration of one coordination session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSessionConfig", into = "RawSessionConfig")]
pub struct SessionConfig {
    session_id: SessionId,
    node_id: NodeId,
    node_name: String,
    topology: Topology,
    coordination: CoordinationConfig,
    election: ElectionStrategy,
    capabilities: BTreeSet<Capability>,
    transport_config: BTreeMap<String, String>,
}

impl SessionConfig {
    pub fn builder(session_id: impl Into<String>, node_name: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder::new(session_id, node_name)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn coordination(&self) -> &CoordinationConfig {
        &self.coordination
    }

    pub fn election(&self) -> ElectionStrategy {
        self.election
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn transport_config(&self) -> &BTreeMap<String, String> {
        &self.transport_config
    }

    /// Parse a typed value out of `transport_config`
    pub fn transport_setting<T: FromStr>(&self, key: &str) -> SyncResult<Option<T>> {
        match self.transport_config.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                SyncError::InvalidConfig(format!("invalid transport setting {key}={raw:?}"))
            }),
        }
    }
}

/// Builder for [`SessionConfig`]
#[derive(Clone, Debug)]
pub struct SessionConfigBuilder {
    session_id: String,
    node_id: Option<NodeId>,
    node_name: String,
    topology: Topology,
    coordination: CoordinationConfig,
    election: ElectionStrategy,
    capabilities: BTreeSet<Capability>,
    transport_config: BTreeMap<String, String>,
}

impl SessionConfigBuilder {
    pub fn new(session_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        SessionConfigBuilder {
            session_id: session_id.into(),
            node_id: None,
            node_name: node_name.into(),
            topology: Topology::Peer2Peer,
            coordination: CoordinationConfig::default(),
            election: ElectionStrategy::default(),
            capabilities: Capability::all(),
            transport_config: BTreeMap::new(),
        }
    }

    pub fn node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn coordination(mut self, coordination: CoordinationConfig) -> Self {
        self.coordination = coordination;
        self
    }

    pub fn election(mut self, election: ElectionStrategy) -> Self {
        self.election = election;
        self
    }

    pub fn capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn transport_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.transport_config.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> SyncResult<SessionConfig> {
        validate_label("session id", &self.session_id)?;
        validate_label("node name", &self.node_name)?;
        let node_id = self.node_id.unwrap_or_else(NodeId::random);
        if node_id == NodeId::ZERO {
            return Err(SyncError::InvalidConfig("node id must be non-zero".into()));
        }
        Ok(SessionConfig {
            session_id: SessionId::new(self.session_id),
            node_id,
            node_name: self.node_name,
            topology: self.topology,
            coordination: self.coordination,
            election: self.election,
            capabilities: self.capabilities,
            transport_config: self.transport_config,
        })
    }
}

/// Serialized form of [`SessionConfig`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawSessionConfig {
    pub session_id: String,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub node_name: String,
    #[serde(default = "default_topology")]
    pub topology: Topology,
    #[serde(flatten)]
    pub coordination: RawCoordinationConfig,
    #[serde(default)]
    pub election: ElectionStrategy,
    #[serde(default = "Capability::all")]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub transport_config: BTreeMap<String, String>,
}

fn default_topology() -> Topology {
    Topology::Peer2Peer
}

impl From<SessionConfig> for RawSessionConfig {
    fn from(c: SessionConfig) -> Self {
        RawSessionConfig {
            session_id: c.session_id.as_str().to_string(),
            node_id: Some(c.node_id),
            node_name: c.node_name,
            topology: c.topology,
            coordination: c.coordination.into(),
            election: c.election,
            capabilities: c.capabilities,
            transport_config: c.transport_config,
        }
    }
}

impl TryFrom<RawSessionConfig> for SessionConfig {
    type Error = SyncError;

    fn try_from(raw: RawSessionConfig) -> Result<Self, Self::Error> {
        let coordination = CoordinationConfig::try_from(raw.coordination)?;
        let mut builder = SessionConfigBuilder::new(raw.session_id, raw.node_name)
            .topology(raw.topology)
            .coordination(coordination)
            .election(raw.election)
            .capabilities(raw.capabilities);
        if let Some(id) = raw.node_id {
            builder = builder.node_id(id);
        }
        builder.transport_config = raw.transport_config;
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stream_config_valid() {
        let cfg = StreamConfig::new("eeg", 4, 100.0, DataType::Float32).unwrap();
        assert_eq!(cfg.name(), "eeg");
        assert_eq!(cfg.channels(), 4);
        assert_eq!(cfg.participation_mode(), ParticipationMode::Both);
        assert!(!cfg.precise_polling());
        assert_eq!(cfg.sample_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_stream_config_rejects_bad_values() {
        assert!(StreamConfig::new("", 4, 100.0, DataType::Float32).is_err());
        assert!(StreamConfig::new("   ", 4, 100.0, DataType::Float32).is_err());
        assert!(StreamConfig::new("it's", 4, 100.0, DataType::Float32).is_err());
        assert!(StreamConfig::new("eeg", 0, 100.0, DataType::Float32).is_err());
        assert!(StreamConfig::new("eeg", 4, 0.0, DataType::Float32).is_err());
        assert!(StreamConfig::new("eeg", 4, -1.0, DataType::Float32).is_err());
        assert!(StreamConfig::new("eeg", 4, f64::NAN, DataType::Float32).is_err());
        assert!(StreamConfig::new("eeg", 4, f64::INFINITY, DataType::Float32).is_err());
    }

    #[test]
    fn test_stream_config_from_json() {
        let cfg: StreamConfig = serde_json::from_str(
            r#"{"name":"emg","channels":8,"sample_rate":2000.0,"data_type":"int16",
                "participation_mode":"consumer","precise_polling":true}"#,
        )
        .unwrap();
        assert_eq!(cfg.data_type(), DataType::Int16);
        assert_eq!(cfg.participation_mode(), ParticipationMode::Consumer);
        assert!(cfg.precise_polling());
        assert_eq!(cfg.content_type(), "data");

        let negative = serde_json::from_str::<StreamConfig>(
            r#"{"name":"emg","channels":-2,"sample_rate":2000.0,"data_type":"int16"}"#,
        );
        assert!(negative.is_err());
        let unsupported = serde_json::from_str::<StreamConfig>(
            r#"{"name":"emg","channels":2,"sample_rate":2000.0,"data_type":"float16"}"#,
        );
        assert!(unsupported.is_err());
    }

    #[test]
    fn test_coordination_timeout_relationship() {
        let ok = CoordinationConfig::builder()
            .heartbeat_interval(Duration::from_millis(100))
            .discovery_interval(Duration::from_millis(150))
            .node_timeout(Duration::from_millis(200))
            .build();
        assert!(ok.is_ok());

        let too_short = CoordinationConfig::builder()
            .heartbeat_interval(Duration::from_millis(100))
            .discovery_interval(Duration::from_millis(50))
            .node_timeout(Duration::from_millis(199))
            .build();
        assert!(too_short.is_err());

        let slow_discovery = CoordinationConfig::builder()
            .heartbeat_interval(Duration::from_millis(100))
            .discovery_interval(Duration::from_millis(300))
            .node_timeout(Duration::from_millis(300))
            .build();
        assert!(slow_discovery.is_err());

        let bad_bounds = CoordinationConfig::builder().min_nodes(3).max_nodes(2).build();
        assert!(bad_bounds.is_err());
    }

    #[test]
    fn test_huge_heartbeat_rejected_not_wrapped() {
        let json = format!(
            r#"{{"heartbeat_interval_ms": {}, "node_timeout_ms": 5000}}"#,
            u64::MAX / 2 + 1
        );
        let err = serde_json::from_str::<CoordinationConfig>(&json).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");

        // Saturates instead of truncating the high bits
        let huge = CoordinationConfig::builder()
            .heartbeat_interval(Duration::MAX)
            .node_timeout(Duration::from_secs(5))
            .build();
        assert!(huge.is_err());
    }

    #[test]
    fn test_session_config_json_roundtrip() {
        let json = r#"{
            "session_id": "lab-7",
            "node_id": "00000000000000aa",
            "node_name": "amp-1",
            "topology": "hierarchical",
            "heartbeat_interval_ms": 250,
            "discovery_interval_ms": 400,
            "node_timeout_ms": 1000,
            "transport_config": {"max_streams": "16"}
        }"#;
        let cfg: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.session_id().as_str(), "lab-7");
        assert_eq!(cfg.node_id(), NodeId(0xaa));
        assert_eq!(cfg.topology(), Topology::Hierarchical);
        assert_eq!(cfg.coordination().heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(cfg.election(), ElectionStrategy::FirstReady);
        assert_eq!(cfg.capabilities(), &Capability::all());
        assert_eq!(
            cfg.transport_setting::<usize>(transport_keys::MAX_STREAMS).unwrap(),
            Some(16)
        );

        let back: SessionConfig =
            serde_json::from_str(&serde_json::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(back, cfg);

        let invalid = json.replace("\"node_timeout_ms\": 1000", "\"node_timeout_ms\": 450");
        assert!(serde_json::from_str::<SessionConfig>(&invalid).is_err());
    }

    #[test]
    fn test_topology_roles() {
        assert_eq!(Topology::Hierarchical.creator_role(), NodeRole::Server);
        assert_eq!(Topology::Peer2Peer.creator_role(), NodeRole::Peer);
        assert_eq!(Topology::Hybrid.creator_role(), NodeRole::Leader);
        assert_eq!(Topology::Hierarchical.joiner_role(), NodeRole::Client);
        assert_eq!(Topology::Peer2Peer.joiner_role(), NodeRole::Peer);
        assert_eq!(Topology::Hybrid.joiner_role(), NodeRole::Client);
        assert!(!Topology::Peer2Peer.supports_election());
        assert!(Topology::Hybrid.supports_election());
    }

    proptest! {
        #[test]
        fn prop_stream_config_validation(channels in -8i64..64, rate in -100.0f64..10_000.0) {
            let raw = RawStreamConfig {
                name: "s".into(),
                channels,
                sample_rate: rate,
                data_type: DataType::Double64,
                participation_mode: ParticipationMode::Both,
                precise_polling: false,
                content_type: "data".into(),
            };
            let result = StreamConfig::try_from(raw);
            prop_assert_eq!(result.is_ok(), channels > 0 && rate > 0.0);
        }

        #[test]
        fn prop_node_timeout_at_least_twice_heartbeat(hb in 1u64..1_000, timeout in 1u64..4_000) {
            let result = CoordinationConfig::builder()
                .heartbeat_interval(Duration::from_millis(hb))
                .discovery_interval(Duration::from_millis(1))
                .node_timeout(Duration::from_millis(timeout))
                .build();
            prop_assert_eq!(result.is_ok(), timeout >= 2 * hb && timeout > 1);
        }
    }
}
