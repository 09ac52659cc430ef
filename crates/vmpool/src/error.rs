//! Error types for the pool.

use std::path::PathBuf;
use std::time::Duration;

use vmpool_fs::FsError;
use vmpool_runtime::RuntimeError;

use crate::instance::InstanceId;

/// Errors surfaced by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is at capacity ({max} instances)")]
    Capacity { max: usize },

    #[error("no instance became ready within {0:?}")]
    Timeout(Duration),

    #[error("failed to compile {script}: {message}")]
    Compile { script: String, message: String },

    #[error("failed to run {script}: {message}")]
    Run { script: String, message: String },

    #[error("readiness queue is full")]
    QueueFull,

    #[error("instance {0} has been disposed")]
    Disposed(InstanceId),

    #[error("pool has been shut down")]
    Closed,

    #[error(transparent)]
    Runtime(RuntimeError),

    #[error(transparent)]
    Filesystem(#[from] FsError),
}

impl From<RuntimeError> for PoolError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Compile { script, message } => PoolError::Compile { script, message },
            RuntimeError::Run { script, message } => PoolError::Run { script, message },
            other => PoolError::Runtime(other),
        }
    }
}

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("configuration error: {0}")]
    Load(String),
}
