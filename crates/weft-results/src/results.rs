//! The polymorphic result-reference family.
//!
//! Every reference carries a `type` discriminator on the wire
//! (`"unpersisted"`, `"reference"`, `"unknown"`) and an in-memory cache slot.
//! References are cheap cloneable handles: clones share cache and persistence
//! state, so a reference staged on a transaction and the copy held by the
//! caller observe the same writes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use weft_storage::WritableFileSystem;

use crate::blob::{PersistedResultBlob, SerializerSpec};
use crate::serializers::{serializer_for, ResultSerializer};
use crate::settings::{default_result_storage, ResultSettings};
use crate::ResultError;

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//─────────────────────────────
//  Unpersisted results
//─────────────────────────────

/// Result that lives only in local memory.
///
/// The cache slot distinguishes "never cached" from a cached null, so a task
/// that legitimately returned null is still recoverable while it stays in
/// memory.
#[derive(Debug, Clone, Default)]
pub struct UnpersistedResult {
    cache: Arc<Mutex<Option<Value>>>,
}

impl UnpersistedResult {
    /// Wrap `obj`, caching it in memory iff `cache_object`.
    pub fn create(obj: Value, cache_object: bool) -> Self {
        Self {
            cache: Arc::new(Mutex::new(cache_object.then_some(obj))),
        }
    }

    /// Return the cached value, or fail if it is gone.
    pub fn get(&self) -> Result<Value, ResultError> {
        relock(&self.cache).clone().ok_or(ResultError::MissingResult)
    }

    /// Whether a value is currently cached.
    pub fn has_cached_value(&self) -> bool {
        relock(&self.cache).is_some()
    }

    pub(crate) fn cached_value(&self) -> Option<Value> {
        relock(&self.cache).clone()
    }
}

impl PartialEq for UnpersistedResult {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cache, &other.cache) || self.cached_value() == other.cached_value()
    }
}

//─────────────────────────────
//  Unknown results
//─────────────────────────────

/// Result for values that were never captured, e.g. a run forced from a
/// failed state into a completed one. The value is always null and counts as
/// cached, so orchestration treats it like any other recovered result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnknownResult;

impl UnknownResult {
    /// Build an unknown result. Only null is accepted.
    pub fn create(obj: Value) -> Result<Self, ResultError> {
        if obj.is_null() {
            Ok(Self)
        } else {
            Err(ResultError::UnsupportedValue(value_kind(&obj).to_string()))
        }
    }

    /// The value of an unknown result, always null.
    pub fn get(&self) -> Value {
        Value::Null
    }

    /// Always true; the null value is inherently in memory.
    pub fn has_cached_value(&self) -> bool {
        true
    }
}

//─────────────────────────────
//  Persisted references
//─────────────────────────────

#[derive(Default)]
struct RuntimeSlots {
    cache: Option<Value>,
    storage_block: Option<Arc<dyn WritableFileSystem>>,
    serializer: Option<Arc<dyn ResultSerializer>>,
}

struct PersistedInner {
    serializer_type: String,
    storage_key: String,
    storage_block_id: Option<Uuid>,
    expiration: Mutex<Option<DateTime<Utc>>>,
    should_cache_object: AtomicBool,
    persisted: AtomicBool,
    runtime: Mutex<RuntimeSlots>,
}

/// Reference to a payload persisted through a storage block.
///
/// The reference carries the metadata needed for retrieval (serializer tag,
/// storage key, optional block id) plus non-serialized back-pointers to the
/// block and serializer it was created with. The back-pointers are a cache,
/// not an ownership edge: a deserialized reference rehydrates them on demand.
#[derive(Clone)]
pub struct PersistedResult {
    inner: Arc<PersistedInner>,
}

impl PersistedResult {
    /// Build a reference from its wire metadata, with empty runtime state.
    ///
    /// The reference is not considered persisted; callers that know better
    /// attach block and serializer handles via [`hydrate`](Self::hydrate).
    pub fn from_parts(
        serializer_type: String,
        storage_key: String,
        storage_block_id: Option<Uuid>,
        expiration: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            inner: Arc::new(PersistedInner {
                serializer_type,
                storage_key,
                storage_block_id,
                expiration: Mutex::new(expiration),
                should_cache_object: AtomicBool::new(true),
                persisted: AtomicBool::new(false),
                runtime: Mutex::new(RuntimeSlots::default()),
            }),
        }
    }

    /// Create a new reference from a user's value.
    ///
    /// Unless `defer_persistence` is set the value is serialized and written
    /// immediately; a deferred reference keeps the value cached so a later
    /// [`write`](Self::write) can find it.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        obj: Value,
        storage_block: Arc<dyn WritableFileSystem>,
        storage_block_id: Option<Uuid>,
        key: String,
        serializer: Arc<dyn ResultSerializer>,
        cache_object: bool,
        expiration: Option<DateTime<Utc>>,
        defer_persistence: bool,
    ) -> Result<Self, ResultError> {
        // Without a stable block id the key is rewritten to an absolute path
        // so the reference stays locatable against an anonymous block.
        let key = if storage_block_id.is_none() {
            match storage_block.resolve_path(&key) {
                Some(path) => path.to_string_lossy().into_owned(),
                None => key,
            }
        } else {
            key
        };

        let result = Self::from_parts(
            serializer.tag().to_string(),
            key,
            storage_block_id,
            expiration,
        );
        result
            .inner
            .should_cache_object
            .store(cache_object, Ordering::SeqCst);
        {
            let mut slots = relock(&result.inner.runtime);
            if cache_object || defer_persistence {
                slots.cache = Some(obj.clone());
            }
            slots.storage_block = Some(storage_block);
            slots.serializer = Some(serializer);
        }

        if !defer_persistence {
            result.write(Some(obj)).await?;
        }
        Ok(result)
    }

    /// Attach a storage block and serializer to a rehydrated reference.
    pub fn hydrate(
        &self,
        storage_block: Arc<dyn WritableFileSystem>,
        serializer: Arc<dyn ResultSerializer>,
    ) {
        let mut slots = relock(&self.inner.runtime);
        slots.storage_block = Some(storage_block);
        slots.serializer = Some(serializer);
    }

    /// Serializer tag recorded on the reference.
    pub fn serializer_type(&self) -> &str {
        &self.inner.serializer_type
    }

    /// Key the payload is stored under.
    pub fn storage_key(&self) -> &str {
        &self.inner.storage_key
    }

    /// Stable id of the block the payload was written through, if any.
    pub fn storage_block_id(&self) -> Option<Uuid> {
        self.inner.storage_block_id
    }

    /// Expiration attached to the payload, if any.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        *relock(&self.inner.expiration)
    }

    /// Whether the payload has been written to storage.
    pub fn is_persisted(&self) -> bool {
        self.inner.persisted.load(Ordering::SeqCst)
    }

    /// Whether a value is currently cached in memory.
    pub fn has_cached_value(&self) -> bool {
        relock(&self.inner.runtime).cache.is_some()
    }

    pub(crate) fn cached_value(&self) -> Option<Value> {
        relock(&self.inner.runtime).cache.clone()
    }

    fn storage_block(&self) -> Result<Arc<dyn WritableFileSystem>, ResultError> {
        if let Some(block) = relock(&self.inner.runtime).storage_block.clone() {
            return Ok(block);
        }
        // Rehydration path for references deserialized outside any store:
        // id-keyed lookups belong to the orchestration client, so fall back
        // to the process default storage.
        let block = default_result_storage(&ResultSettings::from_env())?;
        relock(&self.inner.runtime).storage_block = Some(block.clone());
        Ok(block)
    }

    async fn read_blob(&self) -> Result<PersistedResultBlob, ResultError> {
        let block = self.storage_block()?;
        let content = block.read_path(&self.inner.storage_key).await?;
        PersistedResultBlob::from_bytes(&content)
    }

    /// Retrieve the payload and decode it into the original value.
    pub async fn get(&self) -> Result<Value, ResultError> {
        if let Some(value) = self.cached_value() {
            return Ok(value);
        }

        let blob = self.read_blob().await?;
        let obj = blob.load()?;
        *relock(&self.inner.expiration) = blob.expiration;

        if self.inner.should_cache_object.load(Ordering::SeqCst) {
            relock(&self.inner.runtime).cache = Some(obj.clone());
        }
        Ok(obj)
    }

    /// Write the payload through the storage block.
    ///
    /// Idempotent: once persisted, further calls return without touching
    /// storage. With no argument the cached value is written.
    pub async fn write(&self, obj: Option<Value>) -> Result<(), ResultError> {
        if self.inner.persisted.load(Ordering::SeqCst) {
            return Ok(());
        }

        let obj = match obj.or_else(|| self.cached_value()) {
            Some(value) => value,
            None => return Err(ResultError::NoCachedValue),
        };

        let block = self.storage_block()?;
        let serializer = match relock(&self.inner.runtime).serializer.clone() {
            Some(serializer) => serializer,
            None => serializer_for(&self.inner.serializer_type)?,
        };

        let data = serializer
            .to_bytes(&obj)
            .map_err(|source| ResultError::Serialization {
                tag: serializer.tag().to_string(),
                source,
            })?;
        let blob = PersistedResultBlob::new(
            SerializerSpec::new(serializer.tag()),
            data,
            self.expiration(),
        );
        block
            .write_path(&self.inner.storage_key, &blob.to_bytes()?)
            .await?;
        self.inner.persisted.store(true, Ordering::SeqCst);

        if !self.inner.should_cache_object.load(Ordering::SeqCst) {
            relock(&self.inner.runtime).cache = None;
        }
        Ok(())
    }
}

impl PartialEq for PersistedResult {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        // Two references are equal iff they point at the same artifact.
        self.inner.serializer_type == other.inner.serializer_type
            && self.inner.storage_key == other.inner.storage_key
            && self.inner.storage_block_id == other.inner.storage_block_id
            && self.expiration() == other.expiration()
    }
}

impl fmt::Debug for PersistedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistedResult")
            .field("serializer_type", &self.inner.serializer_type)
            .field("storage_key", &self.inner.storage_key)
            .field("storage_block_id", &self.inner.storage_block_id)
            .field("expiration", &self.expiration())
            .field("persisted", &self.is_persisted())
            .finish_non_exhaustive()
    }
}

//─────────────────────────────
//  Tagged reference family
//─────────────────────────────

/// A result reference of any variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultRef {
    /// In-memory only.
    Unpersisted(UnpersistedResult),
    /// Reference to a persisted payload.
    Persisted(PersistedResult),
    /// Placeholder for a value that was never captured.
    Unknown(UnknownResult),
}

impl ResultRef {
    /// The wire discriminator for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ResultRef::Unpersisted(_) => "unpersisted",
            ResultRef::Persisted(_) => "reference",
            ResultRef::Unknown(_) => "unknown",
        }
    }

    /// Recover the value this reference points at.
    pub async fn get(&self) -> Result<Value, ResultError> {
        match self {
            ResultRef::Unpersisted(result) => result.get(),
            ResultRef::Persisted(result) => result.get().await,
            ResultRef::Unknown(result) => Ok(result.get()),
        }
    }

    /// Whether the value is available without touching storage.
    pub fn has_cached_value(&self) -> bool {
        match self {
            ResultRef::Unpersisted(result) => result.has_cached_value(),
            ResultRef::Persisted(result) => result.has_cached_value(),
            ResultRef::Unknown(result) => result.has_cached_value(),
        }
    }

    /// Borrow the persisted reference, if that is what this is.
    pub fn as_persisted(&self) -> Option<&PersistedResult> {
        match self {
            ResultRef::Persisted(result) => Some(result),
            _ => None,
        }
    }
}

impl From<UnpersistedResult> for ResultRef {
    fn from(result: UnpersistedResult) -> Self {
        ResultRef::Unpersisted(result)
    }
}

impl From<PersistedResult> for ResultRef {
    fn from(result: PersistedResult) -> Self {
        ResultRef::Persisted(result)
    }
}

impl From<UnknownResult> for ResultRef {
    fn from(result: UnknownResult) -> Self {
        ResultRef::Unknown(result)
    }
}

// Wire form: the `type` field is the dispatch key, runtime state (caches,
// block handles) never crosses the wire.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum ResultRefWire {
    #[serde(rename = "unpersisted")]
    Unpersisted,
    #[serde(rename = "reference")]
    Reference {
        serializer_type: String,
        storage_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        storage_block_id: Option<Uuid>,
        #[serde(default)]
        expiration: Option<DateTime<Utc>>,
    },
    #[serde(rename = "unknown")]
    Unknown {
        value: (),
    },
}

impl Serialize for ResultRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            ResultRef::Unpersisted(_) => ResultRefWire::Unpersisted,
            ResultRef::Persisted(result) => ResultRefWire::Reference {
                serializer_type: result.serializer_type().to_string(),
                storage_key: result.storage_key().to_string(),
                storage_block_id: result.storage_block_id(),
                expiration: result.expiration(),
            },
            ResultRef::Unknown(_) => ResultRefWire::Unknown { value: () },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResultRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match ResultRefWire::deserialize(deserializer)? {
            ResultRefWire::Unpersisted => ResultRef::Unpersisted(UnpersistedResult::default()),
            ResultRefWire::Reference {
                serializer_type,
                storage_key,
                storage_block_id,
                expiration,
            } => ResultRef::Persisted(PersistedResult::from_parts(
                serializer_type,
                storage_key,
                storage_block_id,
                expiration,
            )),
            ResultRefWire::Unknown { value: () } => ResultRef::Unknown(UnknownResult),
        })
    }
}
