//! Bounded worker pool for scheduler ticks.
//!
//! `core_size` workers pull jobs from a queue of `queue_capacity`. When the
//! queue is full, extra workers are started up to `max_size`; they exit again
//! after sitting idle for [`EXTRA_WORKER_KEEP_ALIVE`]. Beyond that, jobs are
//! rejected.

use futures::future::join_all;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

pub const EXTRA_WORKER_KEEP_ALIVE: Duration = Duration::from_secs(60);

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type JobQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
    #[error("pool '{0}' is saturated, job rejected")]
    Rejected(String),
    #[error("pool '{0}' is shut down")]
    Shutdown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    pub core_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_size: 4,
            max_size: 10,
            queue_capacity: 100,
        }
    }
}

pub struct WorkerPool {
    name: String,
    max_size: usize,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    queue: JobQueue,
    workers: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(name: &str, config: WorkerPoolConfig) -> Self {
        let core_size = config.core_size.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let pool = Self {
            name: name.to_string(),
            max_size: config.max_size.max(core_size),
            sender: Mutex::new(Some(tx)),
            queue: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
        };
        for _ in 0..core_size {
            pool.spawn_worker(None, None);
        }
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Queue `job`, starting an extra worker if the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
        .ok_or_else(|| PoolError::Shutdown(self.name.clone()))?;

        match sender.try_send(Box::pin(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                let claimed = self
                    .workers
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.max_size).then_some(n + 1));
                if claimed.is_err() {
                    tracing::warn!(pool = %self.name, "Worker pool saturated, rejecting job");
                    return Err(PoolError::Rejected(self.name.clone()));
                }
                self.spawn_worker(Some(job), Some(EXTRA_WORKER_KEEP_ALIVE));
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(PoolError::Shutdown(self.name.clone())),
        }
    }

    /// Stop accepting jobs and wait up to `grace` for queued jobs to finish.
    /// Returns false if workers had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles: Vec<_> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        tracing::info!(pool = %self.name, workers = handles.len(), "Shutting down worker pool");
        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(pool = %self.name, grace_secs = grace.as_secs(), "Worker pool did not drain in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }

    /// Start a worker. Core workers (`keep_alive` None) were not pre-counted.
    fn spawn_worker(&self, first: Option<Job>, keep_alive: Option<Duration>) {
        if keep_alive.is_none() {
            self.workers.fetch_add(1, Ordering::SeqCst);
        }
        let worker = format!("{}-{}", self.name, self.next_worker_id.fetch_add(1, Ordering::SeqCst) + 1);
        let queue = self.queue.clone();
        let workers = self.workers.clone();

        let handle = tokio::spawn(async move {
            if let Some(job) = first {
                run_job(&worker, job).await;
            }
            loop {
                let recv = async { queue.lock().await.recv().await };
                let next = match keep_alive {
                    Some(idle) => tokio::time::timeout(idle, recv).await.unwrap_or(None),
                    None => recv.await,
                };
                match next {
                    Some(job) => run_job(&worker, job).await,
                    None => break,
                }
            }
            workers.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(worker = %worker, "Worker exiting");
        });

        match self.handles.lock() {
            Ok(mut handles) => {
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

/// Run a job in its own task so a panic does not take the worker down.
async fn run_job(worker: &str, job: Job) {
    if let Err(e) = tokio::spawn(job).await {
        if e.is_panic() {
            tracing::error!(worker, "Job panicked");
        } else {
            tracing::warn!(worker, error = %e, "Job was cancelled");
        }
    }
}
