//! Bounded cooperative worker pool.
//!
//! Two instances run in the process: a general pool and a smaller one
//! dedicated to cluster API calls, which is what caps concurrent pressure
//! on any one apiserver. Naked `tokio::spawn` outside this module is
//! forbidden by convention (and CI grep); going through the pool is what
//! guarantees bounded concurrency and uniform panic capture.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{error, info, warn};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use shepherd_definitions::Error as DomainError;

use crate::{Error, Result};

/// Point-in-time pool gauges.
#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics {
    pub capacity: usize,
    pub running: usize,
    pub free: usize,
}

/// A named, bounded executor with cooperative shutdown.
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = watch::channel(false);
        WorkerPool {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(AtomicUsize::new(0)),
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    /// A receiver tasks can select on to notice shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let running = self.running.load(Ordering::Relaxed);
        PoolMetrics {
            capacity: self.capacity,
            running,
            free: self.capacity.saturating_sub(running),
        }
    }

    /// Reserve a slot, waiting until one frees up. Used by drain loops
    /// that want to claim work only when they can run it.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        if self.is_shutting_down() {
            return Err(shutting_down(self.name));
        }
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| shutting_down(self.name))
    }

    /// Run a task on the pool, waiting for a free slot first.
    ///
    /// Every task runs under panic capture; a panicking task logs and
    /// releases its slot, it never takes the process down.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.acquire().await?;
        self.spawn_with_permit(permit, task);
        Ok(())
    }

    /// Submit a task bound to the pool lifecycle rather than the caller's.
    ///
    /// The task keeps running after the submitting request completes and
    /// is only signalled at pool shutdown. Long-lived loops (watchers,
    /// sweeps, cleaners) go through here.
    pub async fn submit_detached<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(task).await
    }

    /// Spawn onto an already-acquired slot; drain loops use this to claim
    /// work only once they hold capacity for it.
    pub(crate) fn spawn_with_permit<F>(&self, permit: OwnedSemaphorePermit, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let running = Arc::clone(&self.running);
        let name = self.name;
        running.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(task).catch_unwind().await;
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".into());
                error!("worker pool '{}': task panicked: {}", name, msg);
            }
            running.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    /// Graceful drain: stop accepting work, signal tasks, wait for the
    /// running set to empty up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("worker pool '{}': shutting down", self.name);
        let _ = self.shutdown_tx.send(true);
        self.semaphore.close();
        let start = tokio::time::Instant::now();
        while self.running.load(Ordering::Relaxed) > 0 {
            if start.elapsed() >= deadline {
                warn!(
                    "worker pool '{}': {} tasks still running at drain deadline",
                    self.name,
                    self.running.load(Ordering::Relaxed)
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("worker pool '{}': drained", self.name);
    }
}

fn shutting_down(name: &str) -> Error {
    Error::Domain(DomainError::ServiceUnavailable(format!(
        "worker pool '{}' is shutting down",
        name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_submitted_tasks_bounded() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            pool.submit(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn panicking_task_does_not_poison_the_pool() {
        let pool = WorkerPool::new("test", 1);
        pool.submit(async {
            panic!("boom");
        })
        .await
        .unwrap();
        // the slot must come back despite the panic
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        pool.submit(async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_after_shutdown_errors_immediately() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown(Duration::from_secs(1)).await;
        let res = pool.submit(async {}).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn metrics_reflect_capacity() {
        let pool = WorkerPool::new("test", 4);
        let m = pool.metrics();
        assert_eq!(m.capacity, 4);
        assert_eq!(m.free, 4);
        assert_eq!(m.running, 0);
    }
}
