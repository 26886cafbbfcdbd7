//! Worker threads that run queries.

use std::any::type_name;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of worker threads fed by one shared job channel.
///
/// When the pool is dropped, jobs that have not started are dropped without running and the
/// drop blocks until the running jobs complete.
pub(crate) struct QueryPool {
    sender: Option<Sender<Job>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for QueryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("worker_count", &self.workers.len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl QueryPool {
    pub(crate) fn new(worker_count: NonZero<u32>) -> Self {
        let (sender, receiver) = channel::unbounded::<Job>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count.get())
            .map(|worker_index| {
                let receiver = receiver.clone();
                let shutdown = Arc::clone(&shutdown);

                thread::Builder::new()
                    .name(format!("alloc-trace-query-{worker_index}"))
                    .spawn(move || {
                        debug!(worker_index, "query worker started");
                        worker_loop(&receiver, &shutdown, worker_index);
                        debug!(worker_index, "query worker exiting");
                    })
                    .expect("failed to spawn query worker: thread spawning failure is not supported")
            })
            .collect();

        Self {
            sender: Some(sender),
            shutdown,
            workers,
        }
    }

    /// Queues `job` to run on one of the workers.
    ///
    /// If the pool is shutting down, the job is dropped without running.
    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let Some(sender) = &self.sender else {
            return;
        };

        // Fails only after every worker has exited, and shutdown drops queued jobs anyway.
        if sender.send(Box::new(job)).is_err() {
            trace!("query pool is shut down, job dropped");
        }
    }
}

impl Drop for QueryPool {
    #[cfg_attr(test, mutants::skip)] // Mutations here hang the process instead of failing a test.
    fn drop(&mut self) {
        // Release pairs with the Acquire in the worker loop, so workers that see the flag also
        // see everything that happened before shutdown started.
        self.shutdown.store(true, Ordering::Release);

        // Disconnecting the channel wakes up idle workers.
        drop(self.sender.take());

        for worker in mem::take(&mut self.workers) {
            if let Err(payload) = worker.join() {
                // Jobs run inside a panic trap, so a panicking worker is a defect of the pool.
                panic::resume_unwind(payload);
            }
        }
    }
}

fn worker_loop(receiver: &Receiver<Job>, shutdown: &AtomicBool, worker_index: u32) {
    while let Ok(job) = receiver.recv() {
        if shutdown.load(Ordering::Acquire) {
            trace!(worker_index, "dropping queued job during shutdown");
            drop(job);
            continue;
        }

        trace!(worker_index, "running job");

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker_index, "query job panicked");
        }
    }
}
