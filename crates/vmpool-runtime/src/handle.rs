//! Host-side handle to a runtime thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use deno_core::v8;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::command::{Reply, RuntimeCommand};
use crate::error::RuntimeError;
use crate::types::{ContextId, HeapStatistics};

/// Shuts a runtime down from any thread, without owning its handle.
#[derive(Clone)]
pub struct Terminator {
    pub(crate) shutdown_tx: Arc<watch::Sender<bool>>,
    pub(crate) terminated: Arc<AtomicBool>,
    pub(crate) isolate_handle: v8::IsolateHandle,
}

impl Terminator {
    /// Signal the worker to stop and interrupt any running script.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.isolate_handle.terminate_execution();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Handle to a spawned JavaScript runtime.
///
/// Dropping the handle terminates the runtime but does not wait for its
/// thread; call [`RuntimeHandle::join`] for that.
pub struct RuntimeHandle {
    pub(crate) name: String,
    pub(crate) cmd_tx: mpsc::Sender<RuntimeCommand>,
    pub(crate) terminator: Terminator,
    pub(crate) thread_handle: Mutex<Option<thread::JoinHandle<Result<(), RuntimeError>>>>,
}

impl RuntimeHandle {
    /// Helper to send a command and wait for reply.
    async fn send_command<T, F>(&self, make_cmd: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(Reply<T>) -> RuntimeCommand,
    {
        if self.terminator.is_terminated() {
            return Err(RuntimeError::Terminated);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;

        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compile `source` as script `name` and run its top level in a new
    /// execution context. Each context has its own global object.
    pub async fn make_context(&self, name: &str, source: &str) -> Result<ContextId, RuntimeError> {
        let name = name.to_string();
        let source = source.to_string();
        self.send_command(|reply| RuntimeCommand::MakeContext {
            name,
            source,
            reply,
        })
        .await
    }

    /// Compile `source` without running it. Later contexts for the same
    /// `name` and source reuse the compiled script.
    pub async fn precompile(&self, name: &str, source: &str) -> Result<(), RuntimeError> {
        let name = name.to_string();
        let source = source.to_string();
        self.send_command(|reply| RuntimeCommand::Precompile {
            name,
            source,
            reply,
        })
        .await
    }

    /// Call a top-level function of a context. Promises are awaited.
    pub async fn call(
        &self,
        context: ContextId,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, RuntimeError> {
        let function = function.to_string();
        self.send_command(|reply| RuntimeCommand::Call {
            context,
            function,
            args,
            reply,
        })
        .await
    }

    pub async fn close_context(&self, context: ContextId) -> Result<(), RuntimeError> {
        self.send_command(|reply| RuntimeCommand::CloseContext {
            context,
            reply: Some(reply),
        })
        .await
    }

    /// Queue a context close without waiting. Used from `Drop`.
    pub fn close_context_detached(&self, context: ContextId) {
        if self.terminator.is_terminated() {
            return;
        }
        if self
            .cmd_tx
            .try_send(RuntimeCommand::CloseContext {
                context,
                reply: None,
            })
            .is_err()
        {
            tracing::warn!(runtime = %self.name, context, "could not queue context close");
        }
    }

    pub async fn heap_statistics(&self) -> Result<HeapStatistics, RuntimeError> {
        self.send_command(|reply| RuntimeCommand::HeapStatistics { reply })
            .await
    }

    /// A cloneable handle that can terminate this runtime.
    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    pub fn terminate(&self) {
        self.terminator.terminate();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator.is_terminated()
    }

    /// Terminate the runtime and wait for its thread to finish. Blocks.
    pub fn join(self) -> Result<(), RuntimeError> {
        self.terminate();
        if let Some(handle) = self.thread_handle.lock().take() {
            handle.join().map_err(|_| RuntimeError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}
