//! Typed sample messages
//!
//! A [`Message`] carries one multi-channel sample. Its length always matches
//! the channel count declared by its [`MessageType`]. Construction and
//! deserialization share one shape check, so a mismatched message cannot
//! exist.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{DataType, MessageId, StreamConfig, SyncError, SyncResult, Timestamp};

/// Shape of the samples a stream carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType {
    pub data_type: DataType,
    pub channel_count: usize,
}

impl MessageType {
    pub fn new(data_type: DataType, channel_count: usize) -> Self {
        MessageType {
            data_type,
            channel_count,
        }
    }

    /// Shape declared by a stream configuration
    pub fn of_stream(config: &StreamConfig) -> Self {
        MessageType::new(config.data_type(), config.channels() as usize)
    }
}

/// Rust value types that map onto a stream [`DataType`]
pub trait SampleValue: Clone + Send + 'static {
    const DATA_TYPE: DataType;
}

impl SampleValue for f32 {
    const DATA_TYPE: DataType = DataType::Float32;
}

impl SampleValue for f64 {
    const DATA_TYPE: DataType = DataType::Double64;
}

impl SampleValue for i8 {
    const DATA_TYPE: DataType = DataType::Int8;
}

impl SampleValue for i16 {
    const DATA_TYPE: DataType = DataType::Int16;
}

impl SampleValue for i32 {
    const DATA_TYPE: DataType = DataType::Int32;
}

impl SampleValue for i64 {
    const DATA_TYPE: DataType = DataType::Int64;
}

impl SampleValue for String {
    const DATA_TYPE: DataType = DataType::String;
}

/// One typed multi-channel sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "RawMessage<T>",
    bound(deserialize = "T: SampleValue + Deserialize<'de>")
)]
pub struct Message<T> {
    id: MessageId,
    message_type: MessageType,
    data: Vec<T>,
    timestamp: Timestamp,
    metadata: BTreeMap<String, String>,
}

impl<T: SampleValue> Message<T> {
    /// Create a message stamped now
    ///
    /// Fails if `data` does not hold exactly one value per channel or if `T`
    /// is not the declared data type.
    pub fn new(message_type: MessageType, data: Vec<T>) -> SyncResult<Self> {
        Self::with_timestamp(message_type, data, Timestamp::now())
    }

    pub fn with_timestamp(
        message_type: MessageType,
        data: Vec<T>,
        timestamp: Timestamp,
    ) -> SyncResult<Self> {
        check_shape::<T>(message_type, data.len())?;
        Ok(Message {
            id: MessageId::next(),
            message_type,
            data,
            timestamp,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn check_shape<T: SampleValue>(message_type: MessageType, len: usize) -> SyncResult<()> {
    if T::DATA_TYPE != message_type.data_type {
        return Err(SyncError::DataTypeMismatch {
            expected: message_type.data_type,
            actual: T::DATA_TYPE,
        });
    }
    if len != message_type.channel_count {
        return Err(SyncError::ChannelMismatch {
            expected: message_type.channel_count,
            actual: len,
        });
    }
    Ok(())
}

/// Wire form of a [`Message`], checked before it becomes one
#[derive(Deserialize)]
struct RawMessage<T> {
    id: MessageId,
    message_type: MessageType,
    data: Vec<T>,
    timestamp: Timestamp,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl<T: SampleValue> TryFrom<RawMessage<T>> for Message<T> {
    type Error = SyncError;

    fn try_from(raw: RawMessage<T>) -> SyncResult<Self> {
        check_shape::<T>(raw.message_type, raw.data.len())?;
        Ok(Message {
            id: raw.id,
            message_type: raw.message_type,
            data: raw.data,
            timestamp: raw.timestamp,
            metadata: raw.metadata,
        })
    }
}

impl<T> Message<T> {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_message_matches_channels() {
        let ty = MessageType::new(DataType::Float32, 4);
        let msg = Message::new(ty, vec![0.1f32, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(msg.data().len(), 4);
        assert_eq!(msg.message_type(), ty);
    }

    #[test]
    fn test_message_rejects_short_sample() {
        let ty = MessageType::new(DataType::Float32, 4);
        let err = Message::new(ty, vec![0.1f32, 0.2, 0.3]).unwrap_err();
        assert_eq!(
            err,
            SyncError::ChannelMismatch {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn test_message_rejects_wrong_type() {
        let ty = MessageType::new(DataType::Int16, 2);
        let err = Message::new(ty, vec![1i32, 2]).unwrap_err();
        assert!(matches!(err, SyncError::DataTypeMismatch { .. }));
    }

    #[test]
    fn test_message_ids_distinct() {
        let ty = MessageType::new(DataType::String, 1);
        let a = Message::new(ty, vec!["x".to_string()]).unwrap();
        let b = Message::new(ty, vec!["y".to_string()]).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_deserialize_checks_shape() {
        let ty = MessageType::new(DataType::Float32, 4);
        let msg = Message::new(ty, vec![1.0f32, 2.0, 3.0, 4.0])
            .unwrap()
            .with_metadata("unit", "uV");
        let json = serde_json::to_value(&msg).unwrap();
        let back: Message<f32> = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, msg);

        let mut short = json.clone();
        short["data"] = serde_json::json!([1.0]);
        assert!(serde_json::from_value::<Message<f32>>(short).is_err());

        // Same payload read back as the wrong value type
        assert!(serde_json::from_value::<Message<f64>>(json).is_err());
    }

    proptest! {
        #[test]
        fn prop_length_must_equal_channels(channels in 1usize..32, len in 0usize..32) {
            let ty = MessageType::new(DataType::Double64, channels);
            let result = Message::new(ty, vec![0.0f64; len]);
            prop_assert_eq!(result.is_ok(), len == channels);
        }
    }
}
