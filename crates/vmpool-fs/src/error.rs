//! Error types for filesystem backends.

/// Errors returned by filesystem backends and the registry.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("filesystem {0} is not registered")]
    NotRegistered(String),

    #[error("{0}: path escapes the filesystem root")]
    OutsideRoot(String),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub(crate) fn io(path: &str, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.to_string(),
            source,
        }
    }
}
