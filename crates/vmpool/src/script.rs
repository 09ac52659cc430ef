//! Scripts and the registry that holds them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use vmpool_fs::{ext_name, FileSystem, FsError};

use crate::config::ROOT_SCRIPT_TIMEOUT;

/// A named source text. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    /// Source file name, used in stack traces.
    pub file: String,
    pub source: String,
    /// Advisory execution timeout. `None` uses the per-kind default.
    pub timeout: Option<Duration>,
    /// Privileged script.
    pub root: bool,
}

impl Script {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            file: name.clone(),
            name,
            source: source.into(),
            timeout: None,
            root: false,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn as_root(mut self) -> Self {
        self.root = true;
        self
    }

    /// Load a script from a filesystem backend. The name is the path without
    /// its leading `/` and extension.
    pub fn from_fs(fs: &dyn FileSystem, path: &str) -> Result<Self, FsError> {
        let data = fs.read_file(path)?;
        let source = String::from_utf8_lossy(&data).into_owned();

        let trimmed = path.trim_start_matches('/');
        let ext = ext_name(trimmed);
        let name = if ext.is_empty() {
            trimmed
        } else {
            &trimmed[..trimmed.len() - ext.len() - 1]
        };

        Ok(Script::new(name, source).with_file(path))
    }

    /// The timeout that applies to this script.
    pub fn effective_timeout(&self, context_timeout: Duration) -> Duration {
        match self.timeout {
            Some(timeout) => timeout,
            None if self.root => ROOT_SCRIPT_TIMEOUT,
            None => context_timeout,
        }
    }
}

/// Registry of scripts by name.
///
/// Root scripts live in their own namespace; [`ScriptRegistry::root_get`]
/// consults it before the user namespace.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: DashMap<String, Arc<Script>>,
    root_scripts: DashMap<String, Arc<Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a script in the namespace its `root` flag picks.
    pub fn register(&self, script: Script) -> Arc<Script> {
        let script = Arc::new(script);
        let namespace = if script.root {
            &self.root_scripts
        } else {
            &self.scripts
        };
        tracing::debug!(script = %script.name, root = script.root, "registering script");
        namespace.insert(script.name.clone(), script.clone());
        script
    }

    pub fn get(&self, name: &str) -> Option<Arc<Script>> {
        self.scripts.get(name).map(|s| s.value().clone())
    }

    /// Look up a script, preferring root scripts.
    pub fn root_get(&self, name: &str) -> Option<Arc<Script>> {
        self.root_scripts
            .get(name)
            .map(|s| s.value().clone())
            .or_else(|| self.get(name))
    }

    /// Every registered script, root scripts first, each group sorted by name.
    pub fn all(&self) -> Vec<Arc<Script>> {
        let mut root: Vec<_> = self.root_scripts.iter().map(|e| e.value().clone()).collect();
        let mut user: Vec<_> = self.scripts.iter().map(|e| e.value().clone()).collect();
        root.sort_by(|a, b| a.name.cmp(&b.name));
        user.sort_by(|a, b| a.name.cmp(&b.name));
        root.extend(user);
        root
    }

    pub fn len(&self) -> usize {
        self.scripts.len() + self.root_scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every `.js` file below `dir`. Returns how many were loaded.
    pub fn load_dir(&self, fs: &dyn FileSystem, dir: &str, root: bool) -> Result<usize, FsError> {
        let mut loaded = 0;
        for path in fs.read_dir(dir, true)? {
            if ext_name(&path) != "js" || !fs.is_file(&path) {
                continue;
            }
            let script = Script::from_fs(fs, &path)?;
            self.register(if root { script.as_root() } else { script });
            loaded += 1;
        }
        tracing::info!(dir, loaded, root, "loaded scripts");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vmpool_fs::LocalFileSystem;

    #[test]
    fn test_effective_timeout() {
        let default = Duration::from_millis(200);

        assert_eq!(Script::new("a", "").effective_timeout(default), default);
        assert_eq!(
            Script::new("a", "").as_root().effective_timeout(default),
            ROOT_SCRIPT_TIMEOUT
        );
        assert_eq!(
            Script::new("a", "")
                .as_root()
                .with_timeout(Duration::from_secs(2))
                .effective_timeout(default),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_root_scripts_shadow_user_scripts() {
        let registry = ScriptRegistry::new();
        registry.register(Script::new("main", "user"));
        registry.register(Script::new("main", "root").as_root());

        assert_eq!(registry.get("main").unwrap().source, "user");
        assert_eq!(registry.root_get("main").unwrap().source, "root");
        assert_eq!(registry.len(), 2);
        assert!(registry.root_get("missing").is_none());

        let names: Vec<_> = registry.all().iter().map(|s| s.root).collect();
        assert_eq!(names, vec![true, false]);
    }

    #[test]
    fn test_load_dir() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(dir.path());
        fs.write_file("/jobs/sync.js", b"function run() {}", 0o644).unwrap();
        fs.write_file("/jobs/readme.md", b"# jobs", 0o644).unwrap();
        fs.write_file("/main.js", b"const x = 1;", 0o644).unwrap();

        let registry = ScriptRegistry::new();
        let loaded = registry.load_dir(&fs, "/", false).unwrap();
        assert_eq!(loaded, 2);

        let script = registry.get("jobs/sync").unwrap();
        assert_eq!(script.file, "/jobs/sync.js");
        assert_eq!(script.source, "function run() {}");
        assert!(registry.get("main").is_some());
    }
}
