//! The on-disk envelope wrapped around every persisted payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::serializers::serializer_for;
use crate::ResultError;

/// Self-describing serializer descriptor embedded in the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializerSpec {
    /// Tag resolvable through [`serializer_for`](crate::serializer_for).
    #[serde(rename = "type")]
    pub kind: String,
}

impl SerializerSpec {
    /// Descriptor for the serializer identified by `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self { kind: tag.into() }
    }
}

/// The format of the content stored by a persisted result.
///
/// Encoded as UTF-8 JSON so the envelope stays readable regardless of the
/// payload encoding; `data` holds the serializer-specific bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedResultBlob {
    /// How `data` was encoded.
    pub serializer: SerializerSpec,
    /// Serializer-specific payload bytes.
    pub data: Vec<u8>,
    /// Version of the engine that produced the blob.
    pub engine_version: String,
    /// When the payload stops being valid, if ever.
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl PersistedResultBlob {
    /// Wrap encoded payload bytes in an envelope stamped with this crate's
    /// version.
    pub fn new(serializer: SerializerSpec, data: Vec<u8>, expiration: Option<DateTime<Utc>>) -> Self {
        Self {
            serializer,
            data,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            expiration,
        }
    }

    /// Decode the payload with the serializer the envelope describes.
    pub fn load(&self) -> Result<Value, ResultError> {
        let serializer = serializer_for(&self.serializer.kind)?;
        serializer
            .from_bytes(&self.data)
            .map_err(|source| ResultError::Deserialization {
                tag: self.serializer.kind.clone(),
                source,
            })
    }

    /// Encode the envelope as UTF-8 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ResultError> {
        serde_json::to_vec(self).map_err(|e| ResultError::MalformedBlob(e.to_string()))
    }

    /// Parse an envelope previously produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ResultError> {
        serde_json::from_slice(bytes).map_err(|e| ResultError::MalformedBlob(e.to_string()))
    }
}
