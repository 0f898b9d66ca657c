//! Bounded worker pools.
//!
//! Simulations are synchronous, CPU-bound calls. Each pool runs a fixed
//! number of named threads draining a bounded queue, so a burst of requests
//! produces backpressure (`QueueFull`) instead of unbounded thread growth.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use tracing::{debug, error};

use crate::error::{CacheError, CacheResult, ExecutionError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A fixed set of worker threads fed by a bounded queue.
pub struct WorkerPool {
    name: &'static str,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
    submit_timeout: Duration,
}

impl WorkerPool {
    /// Start `workers` threads named `impactcache-{name}-{idx}`.
    ///
    /// # Errors
    /// Returns an internal error if a thread cannot be spawned.
    pub fn start(
        name: &'static str,
        workers: usize,
        queue_capacity: usize,
        submit_timeout: Duration,
    ) -> CacheResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("impactcache-{name}-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        // A panicking job must not take the worker down with it.
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                            error!(pool = name, panic = %panic_message(payload.as_ref()), "worker job panicked");
                        }
                    }
                })
                .map_err(|e| CacheError::internal(format!("failed to spawn {name} worker: {e}")))?;
            handles.push(handle);
        }
        debug!(pool = name, workers, queue_capacity, "worker pool started");

        Ok(Self {
            name,
            tx: Some(tx),
            workers: handles,
            queue_capacity,
            submit_timeout,
        })
    }

    /// Queue `job`, waiting up to the submit timeout for a free slot.
    ///
    /// # Errors
    /// - `QueueFull` if no slot frees up in time
    /// - `Disconnected` if the pool is shutting down
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> CacheResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(self.disconnected());
        };
        match tx.send_timeout(Box::new(job), self.submit_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(ExecutionError::QueueFull {
                pool: self.name.to_string(),
                capacity: self.queue_capacity,
            }
            .into()),
            Err(SendTimeoutError::Disconnected(_)) => Err(self.disconnected()),
        }
    }

    fn disconnected(&self) -> CacheError {
        ExecutionError::Disconnected {
            pool: self.name.to_string(),
        }
        .into()
    }

    /// Pool name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Number of jobs waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.as_ref().map_or(0, Sender::len)
    }

    /// Maximum number of waiting jobs.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain queued jobs, then exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!(pool = self.name, "worker pool stopped");
    }
}
