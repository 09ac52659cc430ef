//! Execution contexts: a script bound to an instance.

use std::time::{Duration, Instant};

use tracing::{debug, warn};
use vmpool_runtime::ContextId;

use crate::error::PoolError;
use crate::instance::{rename_script, VmInstance};
use crate::script::Script;

/// A compiled script whose top level has run once inside an instance.
///
/// The context borrows its instance, so it cannot outlive it, and has to be
/// closed (or dropped) before the instance is released.
pub struct ExecutionContext<'a> {
    instance: &'a VmInstance,
    id: ContextId,
    script: String,
    timeout: Duration,
    closed: bool,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) async fn create(
        instance: &'a VmInstance,
        script: &Script,
        timeout: Duration,
    ) -> Result<ExecutionContext<'a>, PoolError> {
        if instance.is_disposed() {
            return Err(PoolError::Disposed(instance.id()));
        }

        // The engine closes the context itself when compiling or running fails
        let id = instance
            .runtime()
            .make_context(&script.file, &script.source)
            .await
            .map_err(|e| rename_script(e.into(), &script.name))?;

        debug!(instance = %instance.id(), script = %script.name, context = id, "created execution context");

        Ok(ExecutionContext {
            instance,
            id,
            script: script.name.clone(),
            timeout,
            closed: false,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// Advisory execution timeout. Calls running past it are logged, not cut off.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call a top-level function declared by the script. A returned promise is
    /// awaited.
    pub async fn call(
        &self,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, PoolError> {
        let started = Instant::now();
        let result = self
            .instance
            .runtime()
            .call(self.id, function, args)
            .await
            .map_err(PoolError::from);

        let elapsed = started.elapsed();
        if elapsed > self.timeout {
            warn!(
                instance = %self.instance.id(),
                script = %self.script,
                function,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = self.timeout.as_millis() as u64,
                "script call exceeded its timeout"
            );
        }
        result
    }

    /// Close the context and wait for the engine to drop it.
    pub async fn close(mut self) -> Result<(), PoolError> {
        self.closed = true;
        if self.instance.is_disposed() {
            return Ok(());
        }
        self.instance.runtime().close_context(self.id).await?;
        Ok(())
    }
}

impl Drop for ExecutionContext<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.instance.runtime().close_context_detached(self.id);
        }
    }
}
