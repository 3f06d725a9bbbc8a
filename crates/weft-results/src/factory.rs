//! The result factory: resolves *how* a value is serialized, *where* it is
//! stored and under what key, and mints result references.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use weft_storage::WritableFileSystem;

use crate::blob::{PersistedResultBlob, SerializerSpec};
use crate::context::{Flow, FlowRunContext, Task, TaskRunContext};
use crate::results::{PersistedResult, ResultRef, UnpersistedResult};
use crate::serializers::{serializer_for, ResultSerializer};
use crate::settings::{default_result_storage, task_scheduling_storage, ResultSettings};
use crate::ResultError;

/// Produces the storage key a result is written under.
pub type StorageKeyFn = Arc<dyn Fn() -> Result<String, ResultError> + Send + Sync>;

/// The default key function: a random 128-bit hex string.
pub fn default_storage_key_fn() -> StorageKeyFn {
    Arc::new(|| Ok(Uuid::new_v4().simple().to_string()))
}

/// Bind a storage-key template to the ambient task-run variables.
///
/// The template is formatted at call time, so the same task definition yields
/// a different key per run: `"users/{parameters.name}"`.
pub fn bound_storage_key(template: String) -> StorageKeyFn {
    Arc::new(move || format_storage_key(&template))
}

fn format_storage_key(template: &str) -> Result<String, ResultError> {
    let ctx = TaskRunContext::current().ok_or_else(|| {
        ResultError::StorageKey(
            "a task run context is required to format a result storage key".to_string(),
        )
    })?;

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(ch) => name.push(ch),
                None => {
                    return Err(ResultError::StorageKey(format!(
                        "unterminated placeholder in storage key template {template:?}"
                    )))
                }
            }
        }
        out.push_str(&ctx.storage_key_variable(&name)?);
    }
    Ok(out)
}

//─────────────────────────────
//  Storage / serializer inputs
//─────────────────────────────

/// Where results go: a live block handle, or a registry slug to resolve.
#[derive(Clone)]
pub enum ResultStorage {
    /// An already-constructed storage block.
    Block(Arc<dyn WritableFileSystem>),
    /// A slug resolved through the block registry.
    Slug(String),
}

/// How results are encoded: a live serializer, or a tag to resolve.
#[derive(Clone)]
pub enum SerializerChoice {
    /// An already-constructed serializer.
    Instance(Arc<dyn ResultSerializer>),
    /// A tag resolved through the serializer registry.
    Tag(String),
}

/// Optional overrides for [`ResultFactory::default_factory`]; unset fields
/// fall back to the process settings.
#[derive(Clone, Default)]
pub struct FactoryOverrides {
    /// Override the persist flag.
    pub persist_result: Option<bool>,
    /// Override in-memory caching of resolved values.
    pub cache_result_in_memory: Option<bool>,
    /// Override the storage block.
    pub result_storage: Option<ResultStorage>,
    /// Override the serializer.
    pub result_serializer: Option<SerializerChoice>,
    /// Override the storage-key function.
    pub storage_key_fn: Option<StorageKeyFn>,
}

//─────────────────────────────
//  Factory
//─────────────────────────────

/// A utility to generate result references.
///
/// Immutable after construction; derived factories are produced by the
/// `with_*` copies.
#[derive(Clone)]
pub struct ResultFactory {
    persist_result: bool,
    cache_result_in_memory: bool,
    serializer: Arc<dyn ResultSerializer>,
    storage_block_id: Option<Uuid>,
    storage_block: Arc<dyn WritableFileSystem>,
    storage_key_fn: StorageKeyFn,
}

impl fmt::Debug for ResultFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultFactory")
            .field("persist_result", &self.persist_result)
            .field("cache_result_in_memory", &self.cache_result_in_memory)
            .field("serializer", &self.serializer.tag())
            .field("storage_block_id", &self.storage_block_id)
            .finish_non_exhaustive()
    }
}

impl ResultFactory {
    /// A factory with default options, filled from `settings` where
    /// `overrides` leaves fields unset.
    pub fn default_factory(
        settings: &ResultSettings,
        overrides: FactoryOverrides,
    ) -> Result<Self, ResultError> {
        let storage = match overrides.result_storage {
            Some(storage) => storage,
            None => ResultStorage::Block(default_result_storage(settings)?),
        };
        let serializer = overrides
            .result_serializer
            .unwrap_or_else(|| SerializerChoice::Tag(settings.default_serializer.clone()));
        Self::from_settings(
            storage,
            serializer,
            overrides.persist_result,
            overrides.cache_result_in_memory.unwrap_or(true),
            overrides
                .storage_key_fn
                .unwrap_or_else(default_storage_key_fn),
            settings,
        )
    }

    /// A factory for a flow run.
    ///
    /// Inside an ambient flow run the child inherits the parent factory's
    /// storage and serializer for any field the flow leaves unset; a root
    /// flow run falls through to the defaults.
    pub fn from_flow(flow: &Flow, settings: &ResultSettings) -> Result<Self, ResultError> {
        if let Some(ctx) = FlowRunContext::current() {
            let parent = &ctx.result_factory;
            Self::from_settings(
                flow.result_storage
                    .clone()
                    .unwrap_or_else(|| ResultStorage::Block(parent.storage_block())),
                flow.result_serializer
                    .clone()
                    .unwrap_or_else(|| SerializerChoice::Instance(parent.serializer())),
                flow.persist_result,
                flow.cache_result_in_memory,
                default_storage_key_fn(),
                settings,
            )
        } else {
            Self::default_factory(
                settings,
                FactoryOverrides {
                    persist_result: flow.persist_result,
                    cache_result_in_memory: Some(flow.cache_result_in_memory),
                    result_storage: flow.result_storage.clone(),
                    result_serializer: flow.result_serializer.clone(),
                    storage_key_fn: None,
                },
            )
        }
    }

    /// A factory for a task run inside (or outside) a flow.
    pub fn from_task(task: &Task, settings: &ResultSettings) -> Result<Self, ResultError> {
        Self::task_factory(task, default_result_storage, settings)
    }

    /// A factory for a task scheduled to run on its own, using the
    /// task-scheduling default storage.
    pub fn from_autonomous_task(
        task: &Task,
        settings: &ResultSettings,
    ) -> Result<Self, ResultError> {
        Self::task_factory(task, task_scheduling_storage, settings)
    }

    fn task_factory(
        task: &Task,
        default_storage: fn(&ResultSettings) -> Result<Arc<dyn WritableFileSystem>, ResultError>,
        settings: &ResultSettings,
    ) -> Result<Self, ResultError> {
        let ctx = FlowRunContext::current();

        let result_storage = match (&task.result_storage, &ctx) {
            (Some(storage), _) => storage.clone(),
            (None, Some(ctx)) => ResultStorage::Block(ctx.result_factory.storage_block()),
            (None, None) => ResultStorage::Block(default_storage(settings)?),
        };
        let result_serializer = match (&task.result_serializer, &ctx) {
            (Some(serializer), _) => serializer.clone(),
            (None, Some(ctx)) => SerializerChoice::Instance(ctx.result_factory.serializer()),
            (None, None) => SerializerChoice::Tag(settings.default_serializer.clone()),
        };
        let persist_result = match (task.persist_result, &ctx) {
            (Some(persist), _) => persist,
            (None, Some(ctx)) => ctx.result_factory.persist_result(),
            (None, None) => settings.persist_by_default,
        };
        let storage_key_fn = match &task.result_storage_key {
            Some(template) => bound_storage_key(template.clone()),
            None => default_storage_key_fn(),
        };

        Self::from_settings(
            result_storage,
            result_serializer,
            Some(persist_result),
            task.cache_result_in_memory,
            storage_key_fn,
            settings,
        )
    }

    /// Resolve storage and serializer inputs and assemble a factory.
    pub fn from_settings(
        result_storage: ResultStorage,
        result_serializer: SerializerChoice,
        persist_result: Option<bool>,
        cache_result_in_memory: bool,
        storage_key_fn: StorageKeyFn,
        settings: &ResultSettings,
    ) -> Result<Self, ResultError> {
        let persist_result = persist_result.unwrap_or(settings.persist_by_default);
        let (storage_block_id, storage_block) =
            Self::resolve_storage_block(result_storage, settings)?;
        let serializer = Self::resolve_serializer(result_serializer)?;

        Ok(Self {
            persist_result,
            cache_result_in_memory,
            serializer,
            storage_block_id,
            storage_block,
            storage_key_fn,
        })
    }

    /// Resolve a [`ResultStorage`] input into a block-id/block pair.
    pub fn resolve_storage_block(
        result_storage: ResultStorage,
        settings: &ResultSettings,
    ) -> Result<(Option<Uuid>, Arc<dyn WritableFileSystem>), ResultError> {
        match result_storage {
            ResultStorage::Block(block) => Ok((block.block_id(), block)),
            ResultStorage::Slug(slug) => {
                let block = settings.registry.load(&slug).ok_or_else(|| {
                    ResultError::Storage(anyhow::anyhow!(
                        "storage block {slug:?} is not registered"
                    ))
                })?;
                let id = block.block_id().ok_or_else(|| {
                    ResultError::Storage(anyhow::anyhow!(
                        "storage block {slug:?} has no stable id"
                    ))
                })?;
                Ok((Some(id), block))
            }
        }
    }

    /// Resolve a [`SerializerChoice`] input into a serializer instance.
    pub fn resolve_serializer(
        choice: SerializerChoice,
    ) -> Result<Arc<dyn ResultSerializer>, ResultError> {
        match choice {
            SerializerChoice::Instance(serializer) => Ok(serializer),
            SerializerChoice::Tag(tag) => serializer_for(&tag),
        }
    }

    /// Whether values handed to [`create_result`](Self::create_result) are
    /// persisted.
    pub fn persist_result(&self) -> bool {
        self.persist_result
    }

    /// Whether resolved values stay cached in memory.
    pub fn cache_result_in_memory(&self) -> bool {
        self.cache_result_in_memory
    }

    /// The serializer this factory encodes payloads with.
    pub fn serializer(&self) -> Arc<dyn ResultSerializer> {
        self.serializer.clone()
    }

    /// The block this factory writes through.
    pub fn storage_block(&self) -> Arc<dyn WritableFileSystem> {
        self.storage_block.clone()
    }

    /// Stable id of the storage block, when it has one.
    pub fn storage_block_id(&self) -> Option<Uuid> {
        self.storage_block_id
    }

    /// Copy of this factory with the persist flag replaced.
    pub fn with_persist_result(&self, persist_result: bool) -> Self {
        let mut factory = self.clone();
        factory.persist_result = persist_result;
        factory
    }

    /// Copy of this factory writing through a different block.
    pub fn with_storage(
        &self,
        storage_block: Arc<dyn WritableFileSystem>,
        storage_block_id: Option<Uuid>,
    ) -> Self {
        let mut factory = self.clone();
        factory.storage_block = storage_block;
        factory.storage_block_id = storage_block_id;
        factory
    }

    /// Create a result reference for `obj`.
    ///
    /// With persistence disabled the value is wrapped in an unpersisted
    /// result; otherwise it is serialized and written (unless deferred) and a
    /// persisted reference is returned.
    pub async fn create_result(
        &self,
        obj: Value,
        key: Option<String>,
        expiration: Option<DateTime<Utc>>,
        defer_persistence: bool,
    ) -> Result<ResultRef, ResultError> {
        // Null values are cached in memory at no cost.
        let should_cache = self.cache_result_in_memory || obj.is_null();

        if !self.persist_result {
            return Ok(UnpersistedResult::create(obj, should_cache).into());
        }

        let key = match key {
            Some(key) => key,
            None => (self.storage_key_fn)()?,
        };
        debug!(key = %key, "creating persisted result reference");

        let result = PersistedResult::create(
            obj,
            self.storage_block.clone(),
            self.storage_block_id,
            key,
            self.serializer.clone(),
            should_cache,
            expiration,
            defer_persistence,
        )
        .await?;
        Ok(result.into())
    }

    /// Persist a parameter mapping under `parameters/{identifier}` so a
    /// scheduler can hand parameters across process boundaries.
    pub async fn store_parameters(
        &self,
        identifier: Uuid,
        parameters: &Map<String, Value>,
    ) -> Result<(), ResultError> {
        let data = self
            .serializer
            .to_bytes(&Value::Object(parameters.clone()))
            .map_err(|source| ResultError::Serialization {
                tag: self.serializer.tag().to_string(),
                source,
            })?;
        let blob = PersistedResultBlob::new(SerializerSpec::new(self.serializer.tag()), data, None);
        self.storage_block
            .write_path(&format!("parameters/{identifier}"), &blob.to_bytes()?)
            .await?;
        Ok(())
    }

    /// Read back a parameter mapping stored by
    /// [`store_parameters`](Self::store_parameters).
    pub async fn read_parameters(
        &self,
        identifier: Uuid,
    ) -> Result<Map<String, Value>, ResultError> {
        let content = self
            .storage_block
            .read_path(&format!("parameters/{identifier}"))
            .await?;
        let blob = PersistedResultBlob::from_bytes(&content)?;
        match blob.load()? {
            Value::Object(parameters) => Ok(parameters),
            _ => Err(ResultError::MalformedBlob(
                "expected a parameter mapping".to_string(),
            )),
        }
    }
}
