//! Stream descriptions and discovered handles

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use syncmesh_core::{DataType, StreamConfig, Timestamp};

/// Well-known description keys
pub mod desc_keys {
    pub const SESSION_ID: &str = "session_id";
}

/// Description of a stream as published by its outlet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub content_type: String,
    pub channel_count: usize,
    /// Nominal rate in Hz; 0.0 for irregular streams
    pub nominal_srate: f64,
    pub data_type: DataType,
    /// Identity of the producer, stable across outlet re-creation
    pub source_id: String,
    pub hostname: String,
    /// Assigned by the transport when the outlet is created
    pub uid: String,
    pub desc: BTreeMap<String, String>,
}

impl StreamInfo {
    /// Create a new stream description
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        channel_count: usize,
        nominal_srate: f64,
        data_type: DataType,
        source_id: impl Into<String>,
    ) -> Self {
        StreamInfo {
            name: name.into(),
            content_type: content_type.into(),
            channel_count,
            nominal_srate,
            data_type,
            source_id: source_id.into(),
            hostname: "localhost".to_string(),
            uid: String::new(),
            desc: BTreeMap::new(),
        }
    }

    /// Description of a data stream produced by `source_id`
    pub fn for_stream(config: &StreamConfig, source_id: impl Into<String>) -> Self {
        StreamInfo::new(
            config.name(),
            config.content_type(),
            config.channels() as usize,
            config.sample_rate(),
            config.data_type(),
            source_id,
        )
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_desc(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.desc.insert(key.into(), value.into());
        self
    }

    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        self.with_desc(desc_keys::SESSION_ID, session_id)
    }

    /// Look up an attribute by predicate key
    ///
    /// Fixed fields use their own names (`type` for the content type); any
    /// other key is looked up in the description map.
    pub fn attribute(&self, key: &str) -> Option<String> {
        match key {
            "name" => Some(self.name.clone()),
            "type" => Some(self.content_type.clone()),
            "channel_count" => Some(self.channel_count.to_string()),
            "channel_format" => Some(self.data_type.to_string()),
            "source_id" => Some(self.source_id.clone()),
            "hostname" => Some(self.hostname.clone()),
            "uid" => Some(self.uid.clone()),
            other => self.desc.get(other.strip_prefix("desc.").unwrap_or(other)).cloned(),
        }
    }
}

/// A discovered stream
///
/// Dropping a handle releases it; handles taken out of a discovery cache
/// belong to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamHandle {
    pub info: StreamInfo,
    /// Last time the stream was observed by a resolver
    pub observed_at: Timestamp,
}

impl StreamHandle {
    pub fn new(info: StreamInfo) -> Self {
        StreamHandle {
            info,
            observed_at: Timestamp::now(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.info.name
    }

    pub fn source_id(&self) -> &str {
        &self.info.source_id
    }

    /// Transport address of the outlet
    pub fn address(&self) -> &str {
        &self.info.uid
    }
}
