//! Commands sent to the runtime worker thread.

use tokio::sync::oneshot;

use crate::error::RuntimeError;
use crate::types::{ContextId, HeapStatistics};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

/// Requests handled by the worker, one at a time.
pub(crate) enum RuntimeCommand {
    /// Bind a script to a fresh V8 context built from the binding template
    /// and run its top level.
    MakeContext {
        name: String,
        source: String,
        reply: Reply<ContextId>,
    },

    /// Compile a script into the runtime's script cache without running it.
    Precompile {
        name: String,
        source: String,
        reply: Reply<()>,
    },

    /// Call a top-level function of a context and wait for it to settle.
    Call {
        context: ContextId,
        function: String,
        args: Vec<serde_json::Value>,
        reply: Reply<serde_json::Value>,
    },

    /// Drop a context. Without a reply channel the close is fire-and-forget.
    CloseContext {
        context: ContextId,
        reply: Option<Reply<()>>,
    },

    /// Sample the isolate's heap.
    HeapStatistics { reply: Reply<HeapStatistics> },
}
