//! Status store and durable work queue.
//!
//! Both are traits so the pipeline and consumer can be driven against the
//! in-memory doubles in tests. The Redis implementation is what the
//! runner binary wires up.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repobox_common::{JobRecord, JobStatus, JobUpdate, OutputLine, SessionState, SessionStatus};

pub use memory::{MemoryQueue, MemoryStore};
pub use self::redis::{RedisQueue, RedisStore};

/// Output lists expire this long after the last append.
pub const OUTPUT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn job_key(job_id: &str) -> String {
    format!("job:{}", job_id)
}

pub fn output_key(job_id: &str) -> String {
    format!("job:{}:output", job_id)
}

pub fn running_key(user_id: &str) -> String {
    format!("user:{}:running", user_id)
}

pub fn provider_key(provider_id: &str) -> String {
    format!("provider:{}", provider_id)
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Result of the pending -> running compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Someone else owns the job; carries the status found.
    Rejected(JobStatus),
}

/// Whether a job whose stored status is `current` may be moved to running.
/// A missing record counts as pending. `restart` lets crash recovery take
/// over a stale running job. Both store implementations follow this rule.
pub fn may_start(current: Option<JobStatus>, restart: bool) -> bool {
    match current.unwrap_or(JobStatus::Pending) {
        JobStatus::Running => restart,
        from => from.can_transition_to(JobStatus::Running),
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn job_record(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Atomically move the job to running and stamp `started_at`, unless
    /// [`may_start`] says otherwise.
    async fn start_job(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
        restart: bool,
    ) -> Result<StartOutcome>;

    /// Apply a terminal update only if the job is still running. Returns
    /// false when the status changed underneath the run (e.g. cancelled).
    async fn finish_job(&self, job_id: &str, update: &JobUpdate) -> Result<bool>;

    async fn append_output(&self, job_id: &str, lines: &[OutputLine]) -> Result<()>;

    /// Encrypted token for `provider_id`, if that provider belongs to `user_id`.
    async fn provider_token(&self, user_id: &str, provider_id: &str) -> Result<Option<String>>;

    /// Atomically increment the user's running counter if it is below
    /// `limit`. Returns whether a slot was taken.
    async fn try_acquire_slot(&self, user_id: &str, limit: u32) -> Result<bool>;

    /// Decrement the user's running counter, never below zero.
    async fn release_slot(&self, user_id: &str) -> Result<()>;

    async fn session_state(&self, session_id: &str) -> Result<Option<SessionState>>;

    async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()>;
}

/// A message handed out by the queue, not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: String,
    pub fields: HashMap<String, String>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create the consumer group if it does not exist.
    async fn ensure_group(&self) -> Result<()>;

    /// New messages for this consumer, waiting up to `block` for the first.
    async fn read(&self, count: usize, block: Duration) -> Result<Vec<Delivery>>;

    /// Take over messages that have been pending longer than `min_idle`.
    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<Delivery>>;

    /// Reset the idle time of messages this runner still holds so no
    /// other consumer reclaims them.
    async fn touch(&self, ids: &[String]) -> Result<()>;

    async fn ack(&self, id: &str) -> Result<()>;
}
