//! Fixed-size worker pool
//!
//! One thread per worker slot. Each worker owns the [`ExecutionEngine`]
//! opened for it at construction; engines never move between threads.
//! [`WorkerPool::execute`] hands a job to whichever worker is free and
//! blocks the caller until that worker replies.

use crate::error::{DpuError, Result};
use crate::exec::ExecutionEngine;
use crate::platform::Platform;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce(&mut ExecutionEngine) + Send>;

/// Worker threads, each owning one execution engine
#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Open one queue per worker on `platform` and start the threads.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero workers, or the platform's error if
    /// any queue cannot be opened. No thread is started in that case.
    pub fn new(platform: &dyn Platform, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(DpuError::invalid_config("worker pool needs at least one worker"));
        }
        let engines = (0..workers)
            .map(|w| platform.open_queue(w).map(ExecutionEngine::new))
            .collect::<Result<Vec<_>>>()?;

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(workers);
        for (index, engine) in engines.into_iter().enumerate() {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("dpu-worker-{index}"))
                .spawn(move || worker_loop(index, engine, &receiver))?;
            handles.push(handle);
        }
        info!("Started {workers} DPU worker(s) on {} platform", platform.backend_type());
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run `job` on a free worker's engine and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns the job's error, or `InvalidState` if the pool has shut down
    /// or the worker died while running the job.
    pub fn execute<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ExecutionEngine) -> Result<T> + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| DpuError::invalid_state("worker pool is shut down"))?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let wrapped: Job = Box::new(move |engine| {
            // The caller may have gone away; nothing to do then.
            let _ = reply_tx.send(job(engine));
        });
        sender
            .send(wrapped)
            .map_err(|_| DpuError::invalid_state("all DPU workers have exited"))?;
        reply_rx
            .recv()
            .map_err(|_| DpuError::invalid_state("DPU worker exited before replying"))?
    }
}

fn worker_loop(index: usize, mut engine: ExecutionEngine, jobs: &Mutex<Receiver<Job>>) {
    debug!("Worker {index} running on CU {}", engine.compute_unit());
    loop {
        let job = match jobs.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => {
                warn!("Worker {index}: job queue lock poisoned");
                return;
            }
        };
        match job {
            Ok(job) => job(&mut engine),
            Err(_) => break,
        }
    }
    debug!("Worker {index} stopped");
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("DPU worker panicked");
            }
        }
    }
}
