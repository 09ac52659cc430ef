//! A VM instance: one engine thread plus its status.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};
use vmpool_runtime::{
    spawn_runtime, EngineOptions, HeapStatistics, RuntimeHandle, RuntimeServices, Terminator,
};

use crate::context::ExecutionContext;
use crate::error::PoolError;
use crate::script::Script;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Busy,
}

/// Heap thresholds that decide whether a released instance is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub heap_size_release: usize,
    pub heap_available_size: usize,
}

impl HealthPolicy {
    pub fn is_healthy(&self, stats: &HeapStatistics) -> bool {
        !stats.exhausted
            && stats.total_heap_size <= self.heap_size_release
            && stats.total_available_size >= self.heap_available_size
    }
}

/// Settings for [`VmInstance::create`].
#[derive(Clone)]
pub struct InstanceOptions {
    pub heap_size_limit: usize,
    pub context_timeout: Duration,
    pub services: RuntimeServices,
    /// Pool generation the instance belongs to.
    pub generation: u64,
}

/// An engine owned by exactly one holder at a time.
///
/// Instances move by value between the readiness queue and callers, so the
/// status changes through `&mut self`. Disposal consumes the instance.
pub struct VmInstance {
    id: InstanceId,
    generation: u64,
    status: Status,
    context_timeout: Duration,
    runtime: RuntimeHandle,
}

impl VmInstance {
    /// Spawn an engine with the binding template installed. Blocks while the
    /// engine boots, so call it from a blocking context.
    pub fn create(options: InstanceOptions) -> Result<Self, PoolError> {
        let id = InstanceId::next();
        let runtime = spawn_runtime(
            id.to_string(),
            EngineOptions {
                heap_size_limit: options.heap_size_limit,
                services: options.services,
            },
        )?;

        info!(instance = %id, generation = options.generation, "created VM instance");

        Ok(Self {
            id,
            generation: options.generation,
            status: Status::Ready,
            context_timeout: options.context_timeout,
            runtime,
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn adopt(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// `Ready -> Busy`. The instance must already be out of the queue.
    pub(crate) fn lock(&mut self) {
        debug_assert_eq!(self.status, Status::Ready, "locking a busy instance");
        self.status = Status::Busy;
    }

    /// `Busy -> Ready`. Only the pool calls this, right before requeueing.
    pub(crate) fn unlock(&mut self) {
        self.status = Status::Ready;
    }

    pub fn is_disposed(&self) -> bool {
        self.runtime.is_terminated()
    }

    /// Stops this instance's engine from anywhere, without owning the instance.
    pub fn terminator(&self) -> Terminator {
        self.runtime.terminator()
    }

    pub(crate) fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    pub async fn heap_statistics(&self) -> Result<HeapStatistics, PoolError> {
        if self.is_disposed() {
            return Err(PoolError::Disposed(self.id));
        }
        Ok(self.runtime.heap_statistics().await?)
    }

    /// Whether the instance can be reused. A gone engine is unhealthy.
    pub async fn health(&self, policy: &HealthPolicy) -> bool {
        match self.heap_statistics().await {
            Ok(stats) => {
                let healthy = policy.is_healthy(&stats);
                debug!(
                    instance = %self.id,
                    total_heap_size = stats.total_heap_size,
                    total_available_size = stats.total_available_size,
                    exhausted = stats.exhausted,
                    healthy,
                    "sampled heap"
                );
                healthy
            }
            Err(e) => {
                debug!(instance = %self.id, error = %e, "health check failed");
                false
            }
        }
    }

    /// Compile `script` and run its top level in a fresh execution context.
    pub async fn make_context(&self, script: &Script) -> Result<ExecutionContext<'_>, PoolError> {
        ExecutionContext::create(self, script, script.effective_timeout(self.context_timeout)).await
    }

    /// Compile `script` into the engine's script cache without running it.
    pub async fn precompile(&self, script: &Script) -> Result<(), PoolError> {
        if self.is_disposed() {
            return Err(PoolError::Disposed(self.id));
        }
        self.runtime
            .precompile(&script.file, &script.source)
            .await
            .map_err(|e| rename_script(e.into(), &script.name))
    }

    /// Shut the engine down and wait for its thread. Blocks.
    pub fn dispose(self) -> Result<(), PoolError> {
        let id = self.id;
        self.runtime.join()?;
        debug!(instance = %id, "disposed VM instance");
        Ok(())
    }
}

impl fmt::Debug for VmInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmInstance")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("status", &self.status)
            .finish()
    }
}

/// Errors from the engine carry the source file; callers know scripts by name.
pub(crate) fn rename_script(err: PoolError, name: &str) -> PoolError {
    match err {
        PoolError::Compile { message, .. } => PoolError::Compile {
            script: name.to_string(),
            message,
        },
        PoolError::Run { message, .. } => PoolError::Run {
            script: name.to_string(),
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: usize, available: usize) -> HeapStatistics {
        HeapStatistics {
            total_heap_size: total,
            total_available_size: available,
            ..Default::default()
        }
    }

    #[test]
    fn test_health_policy() {
        let policy = HealthPolicy {
            heap_size_release: 100,
            heap_available_size: 50,
        };

        assert!(policy.is_healthy(&stats(100, 50)));
        assert!(!policy.is_healthy(&stats(101, 500)));
        assert!(!policy.is_healthy(&stats(10, 49)));

        let exhausted = HeapStatistics {
            exhausted: true,
            ..stats(10, 500)
        };
        assert!(!policy.is_healthy(&exhausted));
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = InstanceId::next();
        let b = InstanceId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{}", a), format!("vm-{}", a.as_u64()));
    }
}
