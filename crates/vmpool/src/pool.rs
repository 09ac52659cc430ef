//! The instance pool.
//!
//! The pool tracks every live instance, keeps between `min_size` and
//! `max_size` of them around, and hands them out through the readiness queue.
//!
//! # Generations
//!
//! Every resize bumps the pool generation and swaps in a new readiness queue.
//! Instances carry the generation they were created in; one from an older
//! generation is disposed instead of being handed out or requeued.
//!
//! # Locking
//!
//! Registry, counts, queue pointer and generation sit behind one
//! `parking_lot::Mutex` that is never held across an `.await`. Resizes are
//! serialized by an async mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vmpool_runtime::{RuntimeError, RuntimeServices, Terminator};

use crate::config::{clamp_sizes, PoolConfig};
use crate::error::PoolError;
use crate::instance::{InstanceId, InstanceOptions, VmInstance};
use crate::queue::ReadyQueue;
use crate::script::ScriptRegistry;

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub generation: u64,
    pub min_size: usize,
    pub max_size: usize,
    /// Registered instances, ready or busy.
    pub live: usize,
    /// Instances waiting in the readiness queue.
    pub ready: usize,
    /// Creations that hold a reserved slot.
    pub in_flight: usize,
    pub created: u64,
    pub retired: u64,
    pub creation_attempts: u64,
    pub creation_failures: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    retired: AtomicU64,
    creation_attempts: AtomicU64,
    creation_failures: AtomicU64,
}

struct PoolState {
    generation: u64,
    min_size: usize,
    max_size: usize,
    queue: Arc<ReadyQueue>,
    live: HashMap<InstanceId, Terminator>,
    /// Reserved slots for creations in flight.
    pending: usize,
    /// Callers inside `select_instance`.
    waiters: usize,
}

struct PoolInner {
    config: PoolConfig,
    services: RuntimeServices,
    scripts: Arc<ScriptRegistry>,
    state: Mutex<PoolState>,
    resize_lock: tokio::sync::Mutex<()>,
    creation_permits: Semaphore,
    counters: Counters,
}

/// Pool of VM instances. Cheap to clone; clones share the pool.
///
/// Every method must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct VmPool {
    inner: Arc<PoolInner>,
}

/// Counts a caller as waiting until dropped.
struct Waiter<'a> {
    inner: &'a PoolInner,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
    }
}

/// A reserved creation slot. Dropping it unused gives the slot back.
struct Reservation {
    inner: Arc<PoolInner>,
    generation: u64,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            if state.generation == self.generation {
                state.pending = state.pending.saturating_sub(1);
            }
        }
    }
}

impl VmPool {
    /// Build an empty pool. Call [`VmPool::start`] (or [`VmPool::resize`]) to
    /// create the first instances.
    pub fn new(config: PoolConfig, services: RuntimeServices, scripts: Arc<ScriptRegistry>) -> Self {
        let config = config.validate();
        let state = PoolState {
            generation: 0,
            min_size: config.min_size,
            max_size: config.max_size,
            queue: Arc::new(ReadyQueue::new(config.max_size)),
            live: HashMap::new(),
            pending: 0,
            waiters: 0,
        };

        Self {
            inner: Arc::new(PoolInner {
                creation_permits: Semaphore::new(config.max_concurrent_creations),
                config,
                services,
                scripts,
                state: Mutex::new(state),
                resize_lock: tokio::sync::Mutex::new(()),
                counters: Counters::default(),
            }),
        }
    }

    /// Populate the pool with the configured bounds.
    pub async fn start(&self) -> Result<(), PoolError> {
        let (min_size, max_size) = (self.inner.config.min_size, self.inner.config.max_size);
        self.resize(min_size, max_size).await
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn scripts(&self) -> &Arc<ScriptRegistry> {
        &self.inner.scripts
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        let state = self.inner.state.lock();
        PoolStats {
            generation: state.generation,
            min_size: state.min_size,
            max_size: state.max_size,
            live: state.live.len(),
            ready: state.queue.len(),
            in_flight: state.pending,
            created: counters.created.load(Ordering::Relaxed),
            retired: counters.retired.load(Ordering::Relaxed),
            creation_attempts: counters.creation_attempts.load(Ordering::Relaxed),
            creation_failures: counters.creation_failures.load(Ordering::Relaxed),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Register an instance and publish it to the readiness queue.
    ///
    /// The instance joins the current generation. Past the ceiling, or when
    /// the queue is full, the instance is disposed and an error returned.
    pub fn add(&self, mut instance: VmInstance) -> Result<(), PoolError> {
        let id = instance.id();
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.live.len() + state.pending >= state.max_size {
                Some((instance, PoolError::Capacity { max: state.max_size }))
            } else {
                instance.adopt(state.generation);
                instance.unlock();
                state.live.insert(id, instance.terminator());
                match state.queue.publish(instance) {
                    Ok(()) => None,
                    Err(instance) => {
                        state.live.remove(&id);
                        Some((instance, PoolError::QueueFull))
                    }
                }
            }
        };

        match rejected {
            None => {
                debug!(instance = %id, "added instance");
                Ok(())
            }
            Some((instance, err)) => {
                warn!(instance = %id, error = %err, "rejected instance");
                dispose_in_background(instance);
                Err(err)
            }
        }
    }

    /// Unregister and dispose an instance. The readiness queue is untouched.
    pub fn remove(&self, instance: VmInstance) {
        let removed = self.inner.state.lock().live.remove(&instance.id()).is_some();
        if removed {
            self.inner.counters.retired.fetch_add(1, Ordering::Relaxed);
        }
        debug!(instance = %instance.id(), "removed instance");
        dispose_in_background(instance);
    }

    /// Dispose every instance and replace the queue with one sized for the new
    /// bounds, then create `min_size` instances.
    ///
    /// Acquisitions waiting on the old queue wake up and retry on the new one.
    pub async fn resize(&self, min_size: usize, max_size: usize) -> Result<(), PoolError> {
        let _guard = self.inner.resize_lock.lock().await;
        if self.inner.creation_permits.is_closed() {
            return Err(PoolError::Closed);
        }

        let (min_size, max_size) = clamp_sizes(min_size, max_size);
        // The new generation's slots are reserved in the same critical section
        // that swaps the queue, so waiters woken by the swap see them in flight
        let (generation, old_queue, old_live, reservations) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.min_size = min_size;
            state.max_size = max_size;
            state.pending = min_size;
            let old_queue =
                std::mem::replace(&mut state.queue, Arc::new(ReadyQueue::new(max_size)));
            let old_live = std::mem::take(&mut state.live);
            let reservations: Vec<Reservation> = (0..min_size)
                .map(|_| Reservation {
                    inner: self.inner.clone(),
                    generation: state.generation,
                    armed: true,
                })
                .collect();
            (state.generation, old_queue, old_live, reservations)
        };

        info!(min_size, max_size, generation, retiring = old_live.len(), "resizing pool");
        self.retire_generation(old_queue, old_live).await;

        let results = futures::future::join_all(
            reservations
                .into_iter()
                .map(|reservation| self.create_reserved(reservation)),
        )
        .await;
        let failures: Vec<PoolError> = results.into_iter().filter_map(Result::err).collect();
        let created = min_size - failures.len();

        info!(generation, created, failed = failures.len(), "pool resized");
        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Dispose every instance and refuse further creations.
    pub async fn shutdown(&self) {
        let _guard = self.inner.resize_lock.lock().await;
        self.inner.creation_permits.close();

        let (old_queue, old_live) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.pending = 0;
            let max_size = state.max_size;
            let old_queue =
                std::mem::replace(&mut state.queue, Arc::new(ReadyQueue::new(max_size)));
            (old_queue, std::mem::take(&mut state.live))
        };

        info!(retiring = old_live.len(), "shutting down pool");
        self.retire_generation(old_queue, old_live).await;
    }

    async fn retire_generation(
        &self,
        old_queue: Arc<ReadyQueue>,
        old_live: HashMap<InstanceId, Terminator>,
    ) {
        old_queue.retire();
        for terminator in old_live.values() {
            terminator.terminate();
        }
        self.inner
            .counters
            .retired
            .fetch_add(old_live.len() as u64, Ordering::Relaxed);

        for instance in old_queue.drain().await {
            dispose_in_background(instance);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creation
    // ─────────────────────────────────────────────────────────────────────────

    /// Create one instance and add it, unless live plus in-flight instances
    /// already reach `max_size`.
    pub async fn create_if_below_ceiling(&self) -> Result<InstanceId, PoolError> {
        let reservation = self.reserve()?;
        self.create_reserved(reservation).await
    }

    fn reserve(&self) -> Result<Reservation, PoolError> {
        if self.inner.creation_permits.is_closed() {
            return Err(PoolError::Closed);
        }
        let mut state = self.inner.state.lock();
        if state.live.len() + state.pending >= state.max_size {
            return Err(PoolError::Capacity {
                max: state.max_size,
            });
        }
        state.pending += 1;
        Ok(Reservation {
            inner: self.inner.clone(),
            generation: state.generation,
            armed: true,
        })
    }

    /// Reserve a replacement only while the queue plus in-flight creations
    /// stay under the floor.
    fn reserve_replacement(&self, state: &mut PoolState) -> Option<Reservation> {
        if state.queue.len() + state.pending >= state.min_size
            || state.live.len() + state.pending >= state.max_size
        {
            return None;
        }
        state.pending += 1;
        Some(Reservation {
            inner: self.inner.clone(),
            generation: state.generation,
            armed: true,
        })
    }

    async fn create_reserved(&self, reservation: Reservation) -> Result<InstanceId, PoolError> {
        let counters = &self.inner.counters;
        counters.creation_attempts.fetch_add(1, Ordering::Relaxed);

        let instance = match self.spawn_instance(reservation.generation).await {
            Ok(instance) => instance,
            Err(err) => {
                counters.creation_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        if self.inner.config.precompile {
            self.precompile(&instance).await;
        }

        self.admit(instance, reservation)
    }

    async fn spawn_instance(&self, generation: u64) -> Result<VmInstance, PoolError> {
        let _permit = self
            .inner
            .creation_permits
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;

        let options = InstanceOptions {
            heap_size_limit: self.inner.config.heap_size_limit,
            context_timeout: self.inner.config.context_timeout(),
            services: self.inner.services.clone(),
            generation,
        };

        tokio::task::spawn_blocking(move || VmInstance::create(options))
            .await
            .map_err(|_| PoolError::Runtime(RuntimeError::ThreadPanic))?
    }

    /// Compile every registered script into a fresh instance's script cache.
    async fn precompile(&self, instance: &VmInstance) {
        for script in self.inner.scripts.all() {
            if let Err(e) = instance.precompile(&script).await {
                warn!(instance = %instance.id(), script = %script.name, error = %e, "precompile failed");
            }
        }
    }

    /// Turn a reservation into a live, ready instance.
    fn admit(&self, instance: VmInstance, mut reservation: Reservation) -> Result<InstanceId, PoolError> {
        let id = instance.id();
        let rejected = {
            let mut state = self.inner.state.lock();
            reservation.armed = false;
            if state.generation != instance.generation() {
                // A resize released every reservation of the old generation
                Some((instance, PoolError::Disposed(id)))
            } else {
                state.pending = state.pending.saturating_sub(1);
                state.live.insert(id, instance.terminator());
                match state.queue.publish(instance) {
                    Ok(()) => None,
                    Err(instance) => {
                        state.live.remove(&id);
                        Some((instance, PoolError::QueueFull))
                    }
                }
            }
        };

        match rejected {
            None => {
                self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Some((instance, err)) => {
                debug!(instance = %id, error = %err, "discarding new instance");
                dispose_in_background(instance);
                Err(err)
            }
        }
    }

    fn spawn_create(&self, reservation: Option<Reservation>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let result = match reservation {
                Some(reservation) => pool.create_reserved(reservation).await,
                None => pool.create_if_below_ceiling().await,
            };
            match result {
                Ok(id) => debug!(instance = %id, "background creation finished"),
                Err(PoolError::Capacity { max }) => {
                    debug!(max, "pool at capacity, skipped background creation")
                }
                Err(err) => warn!(error = %err, "background creation failed"),
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Acquisition / Release
    // ─────────────────────────────────────────────────────────────────────────

    /// Take a ready instance, waiting at most `timeout`.
    ///
    /// When the queue plus creations in flight hold fewer instances than there
    /// are waiting callers, a background creation is triggered. On timeout
    /// nothing is consumed.
    pub async fn select_instance(&self, timeout: Duration) -> Result<VmInstance, PoolError> {
        let deadline = Instant::now() + timeout;
        let _waiter = {
            self.inner.state.lock().waiters += 1;
            Waiter { inner: &self.inner }
        };

        loop {
            let (queue, generation, short) = {
                let state = self.inner.state.lock();
                let short = state.queue.len() + state.pending < state.waiters;
                (state.queue.clone(), state.generation, short)
            };

            if short {
                self.spawn_create(None);
            }

            match tokio::time::timeout_at(deadline, queue.recv()).await {
                Err(_) => {
                    debug!(?timeout, "acquisition timed out");
                    return Err(PoolError::Timeout(timeout));
                }
                // Retired by a resize; retry on the new queue
                Ok(None) => continue,
                Ok(Some(mut instance)) => {
                    if instance.is_disposed() || instance.generation() != generation {
                        debug!(instance = %instance.id(), "discarding stale instance");
                        self.remove(instance);
                        continue;
                    }
                    instance.lock();
                    debug!(instance = %instance.id(), "instance acquired");
                    return Ok(instance);
                }
            }
        }
    }

    /// Hand an instance back.
    ///
    /// A healthy instance is requeued while the queue is below `min_size`;
    /// otherwise it is retired and, if the queue is still under the floor, one
    /// replacement is created in the background.
    pub async fn release(&self, mut instance: VmInstance) {
        let policy = self.inner.config.health_policy();
        let healthy = instance.health(&policy).await;
        let id = instance.id();

        let retired = {
            let state = self.inner.state.lock();
            if instance.generation() != state.generation {
                Some((instance, "stale generation"))
            } else if !healthy {
                Some((instance, "unhealthy"))
            } else if state.queue.len() < state.min_size {
                instance.unlock();
                state
                    .queue
                    .publish(instance)
                    .err()
                    .map(|instance| (instance, "queue full"))
            } else {
                Some((instance, "enough instances ready"))
            }
        };

        match retired {
            None => debug!(instance = %id, "instance requeued"),
            Some((instance, reason)) => {
                debug!(instance = %id, reason, "retiring instance");
                self.retire(instance);
            }
        }
    }

    fn retire(&self, instance: VmInstance) {
        let (registered, replacement) = {
            let mut state = self.inner.state.lock();
            let registered = state.live.remove(&instance.id()).is_some();
            let replacement = if registered && state.generation == instance.generation() {
                self.reserve_replacement(&mut state)
            } else {
                None
            };
            (registered, replacement)
        };

        // Instances of an older generation were counted by the resize
        if registered {
            self.inner.counters.retired.fetch_add(1, Ordering::Relaxed);
        }
        dispose_in_background(instance);

        if let Some(reservation) = replacement {
            self.spawn_create(Some(reservation));
        }
    }
}

/// Join the engine thread off the async workers.
fn dispose_in_background(instance: VmInstance) {
    let id = instance.id();
    // Stop the engine right away; joining the thread can wait
    instance.terminator().terminate();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = instance.dispose() {
            warn!(instance = %id, error = %e, "failed to dispose instance");
        }
    });
}
