#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-storage** – Writable file-system blocks for Weft.
//!
//! A *block* is a named byte store addressed by string keys. Result
//! persistence writes serialized payloads through a block and reads them back
//! by key; everything above this crate treats storage as opaque. The crate
//! ships the trait, a local-filesystem driver, and an in-process registry
//! that maps block slugs to shared handles. Remote drivers (object stores,
//! remote file systems) implement [`WritableFileSystem`] in their own crates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

//─────────────────────────────
//  Block trait
//─────────────────────────────

/// A named writable byte store.
///
/// Implementations may be backed by anything that can resolve a string key to
/// bytes. A block that has been registered (or loaded from a registry)
/// carries a stable *block id* so references to its contents stay locatable
/// after serialization; an anonymous block returns `None` and callers fall
/// back to absolute paths where the driver can produce them.
#[async_trait]
pub trait WritableFileSystem: Send + Sync {
    /// Stable identifier for a registered block, if one has been assigned.
    fn block_id(&self) -> Option<Uuid> {
        None
    }

    /// Resolve `key` to an absolute path, for drivers that have one.
    fn resolve_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    /// Read the bytes stored under `key`.
    async fn read_path(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `content` under `key`, replacing any previous content.
    async fn write_path(&self, key: &str, content: &[u8]) -> Result<()>;
}

//─────────────────────────────
//  Local file-system driver
//─────────────────────────────

/// Local-filesystem block rooted at a base path.
///
/// Keys are treated as relative paths below the base path; parent directories
/// are created on write. An absolute key bypasses the base path, which is how
/// references created against an anonymous block stay readable later.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    basepath: PathBuf,
    block_id: Option<Uuid>,
}

impl LocalFileSystem {
    /// Create a block rooted at `basepath` (created if absent).
    pub fn new(basepath: impl Into<PathBuf>) -> Result<Self> {
        let basepath = basepath.into();
        std::fs::create_dir_all(&basepath)
            .with_context(|| format!("failed to create storage root {}", basepath.display()))?;
        Ok(Self {
            basepath,
            block_id: None,
        })
    }

    /// Assign a stable block id, as the registry does on registration.
    pub fn with_block_id(mut self, id: Uuid) -> Self {
        self.block_id = Some(id);
        self
    }

    /// The base path this block is rooted at.
    pub fn basepath(&self) -> &Path {
        &self.basepath
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let key_path = Path::new(key);
        if key_path.is_absolute() {
            key_path.to_path_buf()
        } else {
            self.basepath.join(key_path)
        }
    }
}

#[async_trait]
impl WritableFileSystem for LocalFileSystem {
    fn block_id(&self) -> Option<Uuid> {
        self.block_id
    }

    fn resolve_path(&self, key: &str) -> Option<PathBuf> {
        Some(self.path_for(key))
    }

    async fn read_path(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }

    async fn write_path(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(content).await?;
        file.flush().await?;
        Ok(())
    }
}

//─────────────────────────────
//  Block registry
//─────────────────────────────

/// In-process registry mapping block slugs to shared block handles.
///
/// This stands in for an external block-document service at its interface:
/// registering a block requires a stable id, and loading by slug hands back
/// the same shared handle every time.
#[derive(Default)]
pub struct BlockRegistry {
    blocks: RwLock<HashMap<String, Arc<dyn WritableFileSystem>>>,
}

impl BlockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `block` under `slug`, returning its stable id.
    ///
    /// Blocks must carry an id before registration so that references created
    /// against them remain resolvable.
    pub fn register(&self, slug: impl Into<String>, block: Arc<dyn WritableFileSystem>) -> Result<Uuid> {
        let id = block
            .block_id()
            .context("blocks must carry a stable id to be registered")?;
        self.blocks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slug.into(), block);
        Ok(id)
    }

    /// Look up a block by slug.
    pub fn load(&self, slug: &str) -> Option<Arc<dyn WritableFileSystem>> {
        self.blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(slug)
            .cloned()
    }

    /// Look up a block by its stable id.
    pub fn find_by_id(&self, id: Uuid) -> Option<Arc<dyn WritableFileSystem>> {
        self.blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|block| block.block_id() == Some(id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let block = LocalFileSystem::new(dir.path()).unwrap();

        block.write_path("results/abc", b"payload").await.unwrap();
        let bytes = block.read_path("results/abc").await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let block = LocalFileSystem::new(dir.path()).unwrap();

        block.write_path("a/b/c/key", b"deep").await.unwrap();
        assert!(dir.path().join("a/b/c/key").exists());
    }

    #[tokio::test]
    async fn test_read_missing_key_errors() {
        let dir = tempdir().unwrap();
        let block = LocalFileSystem::new(dir.path()).unwrap();

        assert!(block.read_path("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_absolute_key_bypasses_basepath() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let block = LocalFileSystem::new(dir.path()).unwrap();

        let abs = other.path().join("elsewhere");
        block
            .write_path(abs.to_str().unwrap(), b"abs")
            .await
            .unwrap();
        let bytes = block.read_path(abs.to_str().unwrap()).await.unwrap();
        assert_eq!(bytes, b"abs");
    }

    #[tokio::test]
    async fn test_resolve_path_is_absolute() {
        let dir = tempdir().unwrap();
        let block = LocalFileSystem::new(dir.path()).unwrap();

        let resolved = block.resolve_path("some/key").unwrap();
        assert!(resolved.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_registry_register_and_load() {
        let dir = tempdir().unwrap();
        let id = Uuid::new_v4();
        let block = Arc::new(LocalFileSystem::new(dir.path()).unwrap().with_block_id(id));

        let registry = BlockRegistry::new();
        let registered = registry.register("local/test", block).unwrap();
        assert_eq!(registered, id);

        let loaded = registry.load("local/test").unwrap();
        assert_eq!(loaded.block_id(), Some(id));
        assert!(registry.find_by_id(id).is_some());
        assert!(registry.load("unknown/slug").is_none());
    }

    #[test]
    fn test_registry_rejects_anonymous_blocks() {
        let dir = tempdir().unwrap();
        let block = Arc::new(LocalFileSystem::new(dir.path()).unwrap());

        let registry = BlockRegistry::new();
        assert!(registry.register("local/anon", block).is_err());
    }
}
