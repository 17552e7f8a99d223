//! Serialization of user values.
//!
//! The real platform's codec supports several wire formats (pickle-compatible
//! included) and is explicitly out of scope here. `Codec` is the seam the
//! rest of the crate depends on; `JsonCodec` is a production-shaped default
//! for values that round-trip through `serde_json::Value`.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

/// Negotiated wire format for a payload, carried alongside the bytes so the
/// receiver knows how to decode them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFormat {
    Json,
}

pub trait Codec: Send + Sync {
    fn serialize(&self, value: &Value, format: DataFormat) -> Result<Vec<u8>, CodecError>;
    fn deserialize(&self, bytes: &[u8], format: DataFormat) -> Result<Value, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize(&self, value: &Value, format: DataFormat) -> Result<Vec<u8>, CodecError> {
        match format {
            DataFormat::Json => {
                serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))
            }
        }
    }

    fn deserialize(&self, bytes: &[u8], format: DataFormat) -> Result<Value, CodecError> {
        match format {
            DataFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
            }
        }
    }
}
