#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-results** – Result persistence for Weft.
//!
//! A *result* is a typed reference to the value a task or flow produced. It
//! may live purely in memory (`unpersisted`), point at a serialized payload
//! written through a storage block (`reference`), or stand in for a value
//! that was never captured (`unknown`). The [`ResultFactory`] decides how a
//! value is serialized, where it is stored and under what key, resolving its
//! configuration from ambient run contexts and process settings.
//!
//! Payloads are written as a self-describing envelope
//! ([`PersistedResultBlob`]) so a reference can be decoded without knowing in
//! advance which serializer produced it.

mod blob;
mod context;
mod factory;
mod results;
mod serializers;
mod settings;

pub use blob::{PersistedResultBlob, SerializerSpec};
pub use context::{Flow, FlowRunContext, Task, TaskRunContext};
pub use factory::{
    bound_storage_key, default_storage_key_fn, FactoryOverrides, ResultFactory, ResultStorage,
    SerializerChoice, StorageKeyFn,
};
pub use results::{PersistedResult, ResultRef, UnknownResult, UnpersistedResult};
pub use serializers::{serializer_for, JsonSerializer, MessagePackSerializer, ResultSerializer};
pub use settings::{default_result_storage, task_scheduling_storage, ResultSettings};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors produced while creating, persisting or recovering results.
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    /// The result was never persisted and its in-memory value is gone.
    #[error("the result was not persisted and is no longer available")]
    MissingResult,
    /// No serializer is registered under the requested tag.
    #[error("unknown result serializer {0:?}")]
    UnknownSerializer(String),
    /// The payload could not be encoded by the chosen serializer.
    #[error(
        "failed to serialize object with serializer {tag:?}: {source}. You can try the \"json\" \
         serializer (result_serializer=\"json\") or disable persistence (persist_result=false) \
         for this run"
    )]
    Serialization {
        /// Serializer tag that rejected the payload.
        tag: String,
        /// Underlying encoder error.
        #[source]
        source: anyhow::Error,
    },
    /// A persisted payload could not be decoded back into a value.
    #[error("failed to decode persisted payload with serializer {tag:?}: {source}")]
    Deserialization {
        /// Serializer tag recorded in the blob.
        tag: String,
        /// Underlying decoder error.
        #[source]
        source: anyhow::Error,
    },
    /// An unknown result only ever holds null.
    #[error("unsupported value for an unknown result; only null is allowed, got {0}")]
    UnsupportedValue(String),
    /// `write()` was invoked with no argument and no cached value.
    #[error("cannot write a result that has no value cached")]
    NoCachedValue,
    /// The storage key function could not produce a key.
    #[error("could not produce a result storage key: {0}")]
    StorageKey(String),
    /// The stored envelope does not parse as a result blob.
    #[error("malformed result blob: {0}")]
    MalformedBlob(String),
    /// The underlying storage block failed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
