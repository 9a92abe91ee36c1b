//! Channel data carried by the transport

use serde::{Deserialize, Serialize};

use syncmesh_core::{DataType, Message, SampleValue};

/// One sample's channel values, typed by the stream's data type
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SampleData {
    Float32(Vec<f32>),
    Double64(Vec<f64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    String(Vec<String>),
}

impl SampleData {
    pub fn data_type(&self) -> DataType {
        match self {
            SampleData::Float32(_) => DataType::Float32,
            SampleData::Double64(_) => DataType::Double64,
            SampleData::Int8(_) => DataType::Int8,
            SampleData::Int16(_) => DataType::Int16,
            SampleData::Int32(_) => DataType::Int32,
            SampleData::Int64(_) => DataType::Int64,
            SampleData::String(_) => DataType::String,
        }
    }

    /// Number of channel values
    pub fn len(&self) -> usize {
        match self {
            SampleData::Float32(v) => v.len(),
            SampleData::Double64(v) => v.len(),
            SampleData::Int8(v) => v.len(),
            SampleData::Int16(v) => v.len(),
            SampleData::Int32(v) => v.len(),
            SampleData::Int64(v) => v.len(),
            SampleData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Numeric channels widened to f64; `None` for string samples
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        Some(match self {
            SampleData::Float32(v) => v.iter().map(|&x| x as f64).collect(),
            SampleData::Double64(v) => v.clone(),
            SampleData::Int8(v) => v.iter().map(|&x| x as f64).collect(),
            SampleData::Int16(v) => v.iter().map(|&x| x as f64).collect(),
            SampleData::Int32(v) => v.iter().map(|&x| x as f64).collect(),
            SampleData::Int64(v) => v.iter().map(|&x| x as f64).collect(),
            SampleData::String(_) => return None,
        })
    }

    /// First channel of a string sample
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SampleData::String(v) => v.first().map(String::as_str),
            _ => None,
        }
    }
}

/// Values that can travel as [`SampleData`]
pub trait ChannelValue: SampleValue {
    fn into_sample_data(values: Vec<Self>) -> SampleData;
}

macro_rules! channel_value {
    ($ty:ty, $variant:ident) => {
        impl ChannelValue for $ty {
            fn into_sample_data(values: Vec<Self>) -> SampleData {
                SampleData::$variant(values)
            }
        }

        impl From<Vec<$ty>> for SampleData {
            fn from(values: Vec<$ty>) -> Self {
                SampleData::$variant(values)
            }
        }
    };
}

channel_value!(f32, Float32);
channel_value!(f64, Double64);
channel_value!(i8, Int8);
channel_value!(i16, Int16);
channel_value!(i32, Int32);
channel_value!(i64, Int64);
channel_value!(String, String);

impl<T: ChannelValue> From<Message<T>> for SampleData {
    fn from(message: Message<T>) -> Self {
        T::into_sample_data(message.into_data())
    }
}

/// A sample pulled from an inlet
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub data: SampleData,
    /// Producer-side time stamp in seconds on the producer's local clock
    pub timestamp: f64,
}
