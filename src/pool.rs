use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::FutureExt;
use repobox_common::JobMessage;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::PoolError;

/// Processes one accepted message. Implemented by the pipeline executor.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, msg: JobMessage);
}

/// Message ids accepted by the pool and not yet handled, queued or running.
#[derive(Default)]
struct InFlight(StdMutex<HashSet<String>>);

impl InFlight {
    fn with<R>(&self, f: impl FnOnce(&mut HashSet<String>) -> R) -> R {
        let mut ids = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut ids)
    }
}

/// Fixed set of workers pulling from one bounded queue.
pub struct WorkerPool {
    sender: RwLock<Option<mpsc::Sender<JobMessage>>>,
    receiver: Arc<Mutex<mpsc::Receiver<JobMessage>>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    handler: Arc<dyn JobHandler>,
    in_flight: Arc<InFlight>,
}

async fn run_one(handler: &Arc<dyn JobHandler>, in_flight: &InFlight, msg: JobMessage) {
    let job_id = msg.job.id.clone();
    let message_id = msg.message_id.clone();
    let outcome = AssertUnwindSafe(handler.handle(msg)).catch_unwind().await;
    if outcome.is_err() {
        tracing::error!(job_id = %job_id, "job handler panicked");
    }
    in_flight.with(|ids| ids.remove(&message_id));
}

async fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<JobMessage>>>,
    shutdown: CancellationToken,
    handler: Arc<dyn JobHandler>,
    in_flight: Arc<InFlight>,
) {
    tracing::debug!(worker = id, "worker started");
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                msg = rx.recv() => msg,
                _ = shutdown.cancelled() => None,
            }
        };
        match next {
            Some(msg) => run_one(&handler, &in_flight, msg).await,
            None => break,
        }
    }

    // Drain whatever is still queued before exiting.
    loop {
        let next = receiver.lock().await.try_recv();
        match next {
            Ok(msg) => run_one(&handler, &in_flight, msg).await,
            Err(_) => break,
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

impl WorkerPool {
    pub fn start(size: usize, capacity: usize, handler: Arc<dyn JobHandler>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let in_flight = Arc::new(InFlight::default());

        let workers = (0..size.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    receiver.clone(),
                    shutdown.clone(),
                    handler.clone(),
                    in_flight.clone(),
                ))
            })
            .collect();
        tracing::info!(workers = size.max(1), capacity, "worker pool started");

        Self {
            sender: RwLock::new(Some(tx)),
            receiver,
            shutdown,
            workers: Mutex::new(workers),
            handler,
            in_flight,
        }
    }

    /// Queue a message, waiting for capacity. Fails once `stop` has begun.
    pub async fn submit(&self, msg: JobMessage) -> Result<(), PoolError> {
        // The read guard is held across the send so `stop` cannot close
        // admission while a submit is in flight.
        let guard = self.sender.read().await;
        let tx = guard.as_ref().ok_or(PoolError::Stopped)?;
        let message_id = msg.message_id.clone();
        // Registered before the send; a worker may finish before it returns.
        self.in_flight.with(|ids| ids.insert(message_id.clone()));
        tx.send(msg).await.map_err(|_| {
            self.in_flight.with(|ids| ids.remove(&message_id));
            PoolError::Stopped
        })
    }

    /// Whether a message with this stream id is queued or running here.
    pub fn holds(&self, message_id: &str) -> bool {
        self.in_flight.with(|ids| ids.contains(message_id))
    }

    /// Stream ids of every message queued or running here.
    pub fn held_ids(&self) -> Vec<String> {
        self.in_flight.with(|ids| ids.iter().cloned().collect())
    }

    /// Close admission and return once every accepted message has been
    /// handled. Running jobs are not cancelled.
    pub async fn stop(&self) {
        drop(self.sender.write().await.take());
        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "worker task failed");
            }
        }

        // Anything that landed after the last worker exited.
        loop {
            let next = self.receiver.lock().await.try_recv();
            match next {
                Ok(msg) => run_one(&self.handler, &self.in_flight, msg).await,
                Err(_) => break,
            }
        }
        tracing::info!("worker pool stopped");
    }
}
