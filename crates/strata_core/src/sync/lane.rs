//! # Worker Lanes
//!
//! A fixed set of named worker threads draining one FIFO job queue.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::error::{PoolError, PoolResult};
use crate::sync::task::run_guarded;

/// A unit of work for a lane.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size group of worker threads sharing one queue.
///
/// Dropping the lane closes the queue, lets the workers finish what is
/// already queued, then joins them.
pub(crate) struct WorkerLane {
    /// Lane name, used for thread names and logs.
    name: &'static str,
    /// Job queue. `None` once shut down.
    sender: Option<Sender<Job>>,
    /// Worker thread handles.
    workers: Vec<JoinHandle<()>>,
}

impl WorkerLane {
    /// Spawns `threads` workers.
    pub(crate) fn spawn(name: &'static str, threads: usize) -> PoolResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);

        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("strata-{name}-{index}"))
                .spawn(move || Self::worker_loop(name, &receiver))
                .map_err(|e| PoolError::Spawn(e.to_string()))?;
            workers.push(handle);
        }

        Ok(Self {
            name,
            sender: Some(sender),
            workers,
        })
    }

    /// Worker thread main loop.
    fn worker_loop(name: &'static str, receiver: &Receiver<Job>) {
        while let Ok(job) = receiver.recv() {
            if let Err(error) = run_guarded(job) {
                tracing::error!(lane = name, %error, "worker job failed");
            }
        }
        tracing::trace!(lane = name, "worker exiting");
    }

    /// Queues a job.
    pub(crate) fn execute(&self, job: Job) -> PoolResult<()> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|_| PoolError::ShutDown(self.name)),
            None => Err(PoolError::ShutDown(self.name)),
        }
    }

    /// Number of worker threads.
    pub(crate) fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs waiting in the queue.
    pub(crate) fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }
}

impl Drop for WorkerLane {
    fn drop(&mut self) {
        // Closing the queue makes every worker's recv() fail once it is drained
        self.sender.take();

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last owner may be one of our own workers
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}
