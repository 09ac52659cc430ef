//! Readiness queue: the hand-off point between producers of ready instances
//! and acquisitions waiting for one.

use tokio::sync::{mpsc, watch, Mutex};

use crate::instance::VmInstance;

/// Bounded queue of `Ready` instances.
///
/// A resize replaces the whole queue. The old one is retired, which wakes its
/// waiters with `None` so they can move on to the new queue.
pub(crate) struct ReadyQueue {
    tx: mpsc::Sender<VmInstance>,
    rx: Mutex<mpsc::Receiver<VmInstance>>,
    retired: watch::Sender<bool>,
}

impl ReadyQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (retired, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            retired,
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish without waiting. A full or retired queue hands the instance back.
    pub fn publish(&self, instance: VmInstance) -> Result<(), VmInstance> {
        if *self.retired.borrow() {
            return Err(instance);
        }
        self.tx.try_send(instance).map_err(|e| match e {
            mpsc::error::TrySendError::Full(instance) => instance,
            mpsc::error::TrySendError::Closed(instance) => instance,
        })
    }

    /// Wait for an instance. `None` once the queue is retired. Cancel safe.
    pub async fn recv(&self) -> Option<VmInstance> {
        let mut retired = self.retired.subscribe();
        if *retired.borrow_and_update() {
            return None;
        }

        let mut rx = tokio::select! {
            rx = self.rx.lock() => rx,
            _ = retired.wait_for(|retired| *retired) => return None,
        };

        tokio::select! {
            biased;
            _ = retired.wait_for(|retired| *retired) => None,
            instance = rx.recv() => instance,
        }
    }

    pub fn retire(&self) {
        self.retired.send_replace(true);
    }

    /// Take everything still queued. Waits for in-flight receivers to let go.
    pub async fn drain(&self) -> Vec<VmInstance> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(instance) = rx.try_recv() {
            drained.push(instance);
        }
        drained
    }
}
