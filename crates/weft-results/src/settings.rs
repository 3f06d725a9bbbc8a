//! Process-wide defaults consumed when a factory field is left unset.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;

use weft_storage::{BlockRegistry, LocalFileSystem, WritableFileSystem};

use crate::ResultError;

/// Defaults for result persistence, overridable through the environment.
///
/// Carries a handle to the in-process [`BlockRegistry`] so slug-configured
/// storage can be resolved without a global.
#[derive(Clone)]
pub struct ResultSettings {
    /// Slug of the default result storage block, if one is configured.
    pub default_storage_block: Option<String>,
    /// Base path for the local-filesystem fallback storage.
    pub local_storage_path: PathBuf,
    /// Tag of the default serializer.
    pub default_serializer: String,
    /// Whether results are persisted when nothing says otherwise.
    pub persist_by_default: bool,
    /// Slug of the storage block used for scheduled-task parameters/results.
    pub task_scheduling_storage_block: Option<String>,
    /// Registry slug-configured blocks are resolved against.
    pub registry: Arc<BlockRegistry>,
}

impl Default for ResultSettings {
    fn default() -> Self {
        Self {
            default_storage_block: None,
            local_storage_path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".weft")
                .join("storage"),
            default_serializer: "msgpack".to_string(),
            persist_by_default: false,
            task_scheduling_storage_block: None,
            registry: Arc::new(BlockRegistry::new()),
        }
    }
}

impl ResultSettings {
    /// Defaults overlaid with `WEFT_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(slug) = std::env::var("WEFT_DEFAULT_RESULT_STORAGE_BLOCK") {
            settings.default_storage_block = Some(slug);
        }
        if let Ok(path) = std::env::var("WEFT_LOCAL_STORAGE_PATH") {
            settings.local_storage_path = PathBuf::from(path);
        }
        if let Ok(tag) = std::env::var("WEFT_DEFAULT_SERIALIZER") {
            settings.default_serializer = tag;
        }
        if let Ok(flag) = std::env::var("WEFT_PERSIST_RESULT_BY_DEFAULT") {
            settings.persist_by_default = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Ok(slug) = std::env::var("WEFT_TASK_SCHEDULING_STORAGE_BLOCK") {
            settings.task_scheduling_storage_block = Some(slug);
        }
        settings
    }

    /// Replace the registry handle, keeping everything else.
    pub fn with_registry(mut self, registry: Arc<BlockRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

fn storage_for_slug(
    settings: &ResultSettings,
    slug: &Option<String>,
) -> Result<Arc<dyn WritableFileSystem>, ResultError> {
    match slug {
        Some(slug) => settings
            .registry
            .load(slug)
            .ok_or_else(|| ResultError::Storage(anyhow!("storage block {slug:?} is not registered"))),
        None => Ok(Arc::new(LocalFileSystem::new(&settings.local_storage_path)?)),
    }
}

/// The default file system for result storage: the configured block, else a
/// local filesystem rooted at the configured path.
pub fn default_result_storage(
    settings: &ResultSettings,
) -> Result<Arc<dyn WritableFileSystem>, ResultError> {
    storage_for_slug(settings, &settings.default_storage_block)
}

/// The default file system for scheduled-task parameter/result storage.
pub fn task_scheduling_storage(
    settings: &ResultSettings,
) -> Result<Arc<dyn WritableFileSystem>, ResultError> {
    storage_for_slug(settings, &settings.task_scheduling_storage_block)
}
