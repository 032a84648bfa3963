use std::sync::Mutex;

use async_trait::async_trait;
use tokio::{sync::Mutex as AsyncMutex, task::JoinSet};
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

/// A unit of work executed by the worker pool.
#[async_trait]
pub trait Job: Send + 'static {
    async fn run(self: Box<Self>);
}

/// A fixed set of worker tasks fed from a bounded job queue.
pub struct WorkerPool {
    /// Queue sender, taken on close so the workers drain and exit.
    job_tx: Mutex<Option<flume::Sender<Box<dyn Job>>>>,
    job_rx: flume::Receiver<Box<dyn Job>>,
    workers: AsyncMutex<JoinSet<()>>,
}

impl WorkerPool {
    /// Spawn `max_workers` workers sharing a queue of `max_jobs` entries.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(max_workers: usize, max_jobs: usize) -> Self {
        let (job_tx, job_rx) = flume::bounded::<Box<dyn Job>>(max_jobs.max(1));
        let max_workers = max_workers.max(1);
        let mut workers = JoinSet::new();
        for id in 0..max_workers {
            workers.spawn(worker_loop(id, job_rx.clone()));
        }
        debug!(max_workers, max_jobs, "Worker pool started");

        Self {
            job_tx: Mutex::new(Some(job_tx)),
            job_rx,
            workers: AsyncMutex::new(workers),
        }
    }

    /// Jobs waiting for a free worker.
    pub fn queued_jobs(&self) -> usize {
        self.job_rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_sender().is_none()
    }

    /// Submit a job, waiting for queue capacity.
    pub async fn submit_job(&self, job: Box<dyn Job>) -> Result<()> {
        let job_tx = self.sender()?;
        job_tx
            .send_async(job)
            .await
            .map_err(|_| RelayError::PoolClosed)
    }

    /// Submit a job without waiting, failing if the queue is full.
    pub fn try_submit_job(&self, job: Box<dyn Job>) -> Result<()> {
        let job_tx = self.sender()?;
        job_tx.try_send(job).map_err(|err| match err {
            flume::TrySendError::Full(_) => RelayError::PoolFull,
            flume::TrySendError::Disconnected(_) => RelayError::PoolClosed,
        })
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn close(&self) {
        if self.lock_sender().take().is_some() {
            debug!("Worker pool closed");
        }
    }

    /// Wait for every worker to exit. Only returns after [`close`](Self::close).
    ///
    /// Cancel-safe: dropping the future leaves the remaining workers joinable.
    pub async fn join(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                warn!("Worker task failed: {}", err);
            }
        }
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(&self) {
        self.close();
        self.join().await;
    }

    fn sender(&self) -> Result<flume::Sender<Box<dyn Job>>> {
        self.lock_sender().clone().ok_or(RelayError::PoolClosed)
    }

    fn lock_sender(&self) -> std::sync::MutexGuard<'_, Option<flume::Sender<Box<dyn Job>>>> {
        self.job_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn worker_loop(id: usize, job_rx: flume::Receiver<Box<dyn Job>>) {
    while let Ok(job) = job_rx.recv_async().await {
        // A panicking job must not take the worker down with it.
        if let Err(err) = tokio::spawn(job.run()).await {
            warn!(worker = id, "Job aborted: {}", err);
        }
    }
    debug!(worker = id, "Worker exited");
}
