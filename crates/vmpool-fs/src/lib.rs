//! Pluggable filesystem backends for scripts.
//!
//! Scripts never touch the host filesystem directly. They go through a named
//! backend looked up in an [`FsRegistry`]; the default `system` backend is a
//! [`LocalFileSystem`] rooted at the application's data directory.

mod error;
mod local;
mod path;
mod registry;

pub use error::FsError;
pub use local::LocalFileSystem;
pub use path::{base_name, dir_name, ext_name};
pub use registry::{FsRegistry, SYSTEM};

use chrono::{DateTime, Utc};

/// A filesystem backend.
///
/// Paths are backend-relative and use `/` as the separator. Directory listings
/// and generated names come back in the same form.
pub trait FileSystem: Send + Sync + 'static {
    /// Read the whole file.
    fn read_file(&self, file: &str) -> Result<Vec<u8>, FsError>;

    /// Write `data` to `file`, creating it (and its parent directories) with
    /// `perm` if needed. Returns the number of bytes written.
    fn write_file(&self, file: &str, data: &[u8], perm: u32) -> Result<usize, FsError>;

    /// List a directory, sorted by name. With `recursive`, nested entries are
    /// included as well.
    fn read_dir(&self, dir: &str, recursive: bool) -> Result<Vec<String>, FsError>;

    /// Create a single directory.
    fn mkdir(&self, dir: &str, perm: u32) -> Result<(), FsError>;

    /// Create a directory along with any missing parents.
    fn mkdir_all(&self, dir: &str, perm: u32) -> Result<(), FsError>;

    /// Create a new uniquely named directory inside `dir`.
    ///
    /// A random string replaces the last `*` in `pattern`, or is appended when
    /// the pattern has none.
    fn mkdir_temp(&self, dir: &str, pattern: &str) -> Result<String, FsError>;

    fn chmod(&self, name: &str, mode: u32) -> Result<(), FsError>;

    /// Remove a file or an empty directory.
    fn remove(&self, name: &str) -> Result<(), FsError>;

    /// Remove a path and everything below it. Missing paths are not an error.
    fn remove_all(&self, name: &str) -> Result<(), FsError>;

    fn move_to(&self, name: &str, dst: &str) -> Result<(), FsError>;

    /// Copy a file, or a directory tree.
    fn copy(&self, name: &str, dst: &str) -> Result<(), FsError>;

    fn exists(&self, name: &str) -> Result<bool, FsError>;

    fn size(&self, name: &str) -> Result<u64, FsError>;

    /// Permission bits of the path.
    fn mode(&self, name: &str) -> Result<u32, FsError>;

    fn mod_time(&self, name: &str) -> Result<DateTime<Utc>, FsError>;

    fn is_dir(&self, name: &str) -> bool;

    fn is_file(&self, name: &str) -> bool;

    fn is_link(&self, name: &str) -> bool;

    fn mime_type(&self, name: &str) -> Result<String, FsError>;
}
