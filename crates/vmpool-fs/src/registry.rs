//! Named filesystem backends.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::FsError;
use crate::local::LocalFileSystem;
use crate::FileSystem;

/// Name of the default local backend.
pub const SYSTEM: &str = "system";

/// Registry of filesystem backends, looked up by name.
///
/// Root backends form a second, privileged namespace consulted first by
/// [`FsRegistry::root_get`]; plain lookups never see them.
#[derive(Default)]
pub struct FsRegistry {
    filesystems: DashMap<String, Arc<dyn FileSystem>>,
    root_filesystems: DashMap<String, Arc<dyn FileSystem>>,
}

impl FsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `system` backend rooted at `root`.
    pub fn with_system(root: impl Into<PathBuf>) -> Self {
        let registry = Self::new();
        registry.register(SYSTEM, Arc::new(LocalFileSystem::new(root)));
        registry
    }

    /// Register (or replace) a backend.
    pub fn register(&self, id: impl Into<String>, fs: Arc<dyn FileSystem>) -> Arc<dyn FileSystem> {
        let id = id.into();
        tracing::debug!(filesystem = %id, "registering filesystem");
        self.filesystems.insert(id, fs.clone());
        fs
    }

    /// Register (or replace) a root backend.
    pub fn register_root(
        &self,
        id: impl Into<String>,
        fs: Arc<dyn FileSystem>,
    ) -> Arc<dyn FileSystem> {
        let id = id.into();
        tracing::debug!(filesystem = %id, "registering root filesystem");
        self.root_filesystems.insert(id, fs.clone());
        fs
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn FileSystem>, FsError> {
        self.filesystems
            .get(name)
            .map(|fs| fs.value().clone())
            .ok_or_else(|| FsError::NotRegistered(name.to_string()))
    }

    /// Look up a backend, preferring root backends.
    pub fn root_get(&self, name: &str) -> Result<Arc<dyn FileSystem>, FsError> {
        if let Some(fs) = self.root_filesystems.get(name) {
            return Ok(fs.value().clone());
        }
        self.get(name)
    }

    /// Names of the regular backends, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.filesystems.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
