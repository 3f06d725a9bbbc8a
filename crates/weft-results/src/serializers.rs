//! Value serializers and the tag registry used to decode blobs.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::ResultError;

/// Bytes ↔ value encoding, identified by a stable type tag.
///
/// The tag is embedded in every persisted blob so payloads remain decodable
/// without out-of-band knowledge of how they were written.
pub trait ResultSerializer: Send + Sync + std::fmt::Debug {
    /// Stable tag identifying this encoding on the wire.
    fn tag(&self) -> &'static str;

    /// Encode `value` into bytes.
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes produced by [`ResultSerializer::to_bytes`].
    fn from_bytes(&self, data: &[u8]) -> Result<Value>;
}

/// MessagePack encoding via `rmp-serde`. The general-purpose default.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackSerializer;

impl ResultSerializer for MessagePackSerializer {
    fn tag(&self) -> &'static str {
        "msgpack"
    }

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn from_bytes(&self, data: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Human-readable JSON encoding via `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl ResultSerializer for JsonSerializer {
    fn tag(&self) -> &'static str {
        "json"
    }

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_bytes(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Resolve a serializer tag to a constructor.
///
/// This is the decode-side registry: blobs carry a tag, readers look the
/// implementation up here.
pub fn serializer_for(tag: &str) -> Result<Arc<dyn ResultSerializer>, ResultError> {
    match tag {
        "msgpack" => Ok(Arc::new(MessagePackSerializer)),
        "json" => Ok(Arc::new(JsonSerializer)),
        other => Err(ResultError::UnknownSerializer(other.to_string())),
    }
}
