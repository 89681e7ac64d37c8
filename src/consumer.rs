//! Stream consumer: queue -> admission control -> worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use repobox_common::{JobMessage, JobStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::PoolError;
use crate::pool::WorkerPool;
use crate::store::{Delivery, JobQueue, JobStore};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub per_user_limit: u32,
    pub job_timeout: Duration,
    pub batch_size: usize,
    pub block: Duration,
    pub reclaim_interval: Duration,
    pub reclaim_idle: Duration,
    pub error_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            per_user_limit: 2,
            job_timeout: Duration::from_secs(30 * 60),
            batch_size: 10,
            block: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(15),
            reclaim_idle: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the pool; the executor acks it when the job ends.
    Dispatched,
    /// Acknowledged without running (malformed or already finished).
    Acked,
    /// Left pending for redelivery.
    Deferred,
    /// Already queued or running in this runner's pool.
    Held,
}

pub struct StreamConsumer {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    settings: ConsumerSettings,
}

impl StreamConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            pool,
            settings,
        }
    }

    /// Read and dispatch until `shutdown` fires. Only a failure to create
    /// the consumer group is returned; read errors are logged and retried.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.queue.ensure_group().await?;
        tracing::info!(per_user_limit = self.settings.per_user_limit, "stream consumer started");

        let mut last_reclaim: Option<Instant> = None;
        while !shutdown.is_cancelled() {
            let due = last_reclaim
                .map(|t| t.elapsed() >= self.settings.reclaim_interval)
                .unwrap_or(true);
            if due {
                self.reclaim_pending().await;
                last_reclaim = Some(Instant::now());
            }

            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = self.queue.read(self.settings.batch_size, self.settings.block) => read,
            };
            match read {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        self.process(delivery).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "queue read failed; backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.error_backoff) => {}
                    }
                }
            }
        }
        tracing::info!("stream consumer stopped");
        Ok(())
    }

    /// Keep the idle time of every message held by the pool below
    /// `reclaim_idle`, so other runners leave them alone while they wait in
    /// the pool or run. Stops when `shutdown` fires; main cancels it only
    /// after the pool has drained.
    pub fn spawn_keepalive(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let pool = self.pool.clone();
        let period = (self.settings.reclaim_idle / 3).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let held = pool.held_ids();
                if held.is_empty() {
                    continue;
                }
                if let Err(e) = queue.touch(&held).await {
                    tracing::warn!(count = held.len(), error = %e, "failed to refresh held messages");
                }
            }
        })
    }

    /// Claim messages other consumers (or this one) left pending and run
    /// them through the normal path. Messages still held by this runner's
    /// pool are skipped. Returns how many were processed.
    pub async fn reclaim_pending(&self) -> usize {
        match self
            .queue
            .reclaim(self.settings.reclaim_idle, self.settings.batch_size)
            .await
        {
            Ok(deliveries) => {
                let fresh: Vec<Delivery> = deliveries
                    .into_iter()
                    .filter(|d| !self.pool.holds(&d.id))
                    .collect();
                let n = fresh.len();
                if n > 0 {
                    tracing::info!(count = n, "reclaimed pending messages");
                }
                for delivery in fresh {
                    self.process(delivery).await;
                }
                n
            }
            Err(e) => {
                tracing::warn!(error = %e, "reclaim failed");
                0
            }
        }
    }

    async fn ack(&self, id: &str) {
        if let Err(e) = self.queue.ack(id).await {
            tracing::warn!(message_id = %id, error = %e, "ack failed");
        }
    }

    pub async fn process(&self, delivery: Delivery) -> Disposition {
        if self.pool.holds(&delivery.id) {
            tracing::debug!(message_id = %delivery.id, "message already held by the pool");
            return Disposition::Held;
        }
        let mut msg = match JobMessage::from_fields(&delivery.id, &delivery.fields) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(message_id = %delivery.id, error = %e, "dropping malformed job message");
                self.ack(&delivery.id).await;
                return Disposition::Acked;
            }
        };
        let job_id = msg.job.id.clone();
        let user_id = msg.job.user_id.clone();

        match self.store.job_record(&job_id).await {
            Ok(Some(record)) if record.status.is_terminal() => {
                tracing::info!(job_id = %job_id, status = %record.status, "job already finished; acking duplicate");
                self.ack(&msg.message_id).await;
                return Disposition::Acked;
            }
            Ok(Some(record)) if record.status == JobStatus::Running => {
                let limit = chrono::Duration::from_std(self.settings.job_timeout * 2)
                    .unwrap_or_else(|_| chrono::Duration::days(3650));
                let stale = record
                    .started_at
                    .map(|t| Utc::now() - t > limit)
                    .unwrap_or(true);
                if !stale {
                    tracing::debug!(job_id = %job_id, "job running elsewhere; leaving pending");
                    return Disposition::Deferred;
                }
                tracing::warn!(job_id = %job_id, user_id = %user_id, "recovering job abandoned in running state");
                if let Err(e) = self.store.release_slot(&user_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to release stale slot");
                }
                // Tells the pipeline this is a restart of a running job.
                msg.job.status = JobStatus::Running;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "job lookup failed; leaving pending");
                return Disposition::Deferred;
            }
        }

        match self
            .store
            .try_acquire_slot(&user_id, self.settings.per_user_limit)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %job_id, user_id = %user_id, "user at capacity; leaving pending");
                return Disposition::Deferred;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "slot acquisition failed; leaving pending");
                return Disposition::Deferred;
            }
        }

        match self.pool.submit(msg).await {
            Ok(()) => {
                tracing::info!(job_id = %job_id, user_id = %user_id, "job dispatched");
                Disposition::Dispatched
            }
            Err(PoolError::Stopped) => {
                if let Err(e) = self.store.release_slot(&user_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to release slot");
                }
                Disposition::Deferred
            }
        }
    }
}
