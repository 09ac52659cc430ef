//! Error types for the JavaScript runtime.

/// Errors that can occur in the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Runtime has terminated")]
    Terminated,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Runtime thread panicked")]
    ThreadPanic,

    #[error("Failed to compile {script}: {message}")]
    Compile { script: String, message: String },

    #[error("Failed to run {script}: {message}")]
    Run { script: String, message: String },

    #[error("JavaScript error: {0}")]
    JavaScript(String),

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Errors returned by host capabilities to the script that called them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("{0} is not available in this runtime")]
    NotAvailable(&'static str),

    #[error("{0} is not registered")]
    NotRegistered(String),

    #[error("{0}")]
    Failed(String),
}
