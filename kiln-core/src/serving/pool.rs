//! Fixed bank of blocking worker threads behind a shared FIFO.
//!
//! Engine executions block for the duration of a token step, so they run on
//! dedicated OS threads rather than the async runtime. No priorities, no
//! work stealing: one multi-consumer queue, `worker_threads` drainers.

use std::io;
use std::thread;

use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    /// `None` only during shutdown.
    jobs: Option<crossbeam_channel::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("kiln-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    debug!(worker = i, "worker pool thread exiting");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    /// Enqueue a job. Jobs run in FIFO order on whichever worker frees up
    /// first.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.jobs {
            if tx.send(Box::new(job)).is_err() {
                warn!("worker pool already shut down; job dropped");
            }
        }
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    /// Closing the channel lets workers drain every pending job, then exit;
    /// joining afterwards makes shutdown deterministic.
    fn drop(&mut self) {
        drop(self.jobs.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
