//! In-process store and queue. Semantics mirror the Redis implementation
//! closely enough for pipeline, consumer and cleaner tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repobox_common::{JobRecord, JobStatus, JobUpdate, OutputLine, SessionState, SessionStatus};

use super::{Delivery, JobQueue, JobStore, StartOutcome, may_start};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("store lock poisoned"))
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, HashMap<String, String>>,
    output: HashMap<String, Vec<OutputLine>>,
    running: HashMap<String, u32>,
    providers: HashMap<String, (String, String)>,
    sessions: HashMap<String, SessionState>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a job hash, as the dashboard does when a job is submitted.
    pub fn insert_job(&self, job_id: &str, status: JobStatus, started_at: Option<DateTime<Utc>>) {
        let mut fields = HashMap::from([("status".to_string(), status.as_str().to_string())]);
        if let Some(at) = started_at {
            fields.insert("started_at".to_string(), at.to_rfc3339());
        }
        if let Ok(mut state) = lock(&self.state) {
            state.jobs.insert(job_id.to_string(), fields);
        }
    }

    pub fn insert_provider(&self, provider_id: &str, user_id: &str, encrypted_token: &str) {
        if let Ok(mut state) = lock(&self.state) {
            state.providers.insert(
                provider_id.to_string(),
                (user_id.to_string(), encrypted_token.to_string()),
            );
        }
    }

    pub fn insert_session(&self, session_id: &str, status: &str, updated_at: Option<DateTime<Utc>>) {
        if let Ok(mut state) = lock(&self.state) {
            state.sessions.insert(
                session_id.to_string(),
                SessionState {
                    status: status.to_string(),
                    updated_at,
                },
            );
        }
    }

    pub fn set_running(&self, user_id: &str, count: u32) {
        if let Ok(mut state) = lock(&self.state) {
            state.running.insert(user_id.to_string(), count);
        }
    }

    pub fn running(&self, user_id: &str) -> u32 {
        lock(&self.state)
            .map(|s| s.running.get(user_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Overwrite a job's status, as the dashboard does on cancel.
    pub fn set_job_status(&self, job_id: &str, status: JobStatus) {
        if let Ok(mut state) = lock(&self.state) {
            state
                .jobs
                .entry(job_id.to_string())
                .or_default()
                .insert("status".to_string(), status.as_str().to_string());
        }
    }

    pub fn output(&self, job_id: &str) -> Vec<OutputLine> {
        lock(&self.state)
            .map(|s| s.output.get(job_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn job_fields(&self, job_id: &str) -> HashMap<String, String> {
        lock(&self.state)
            .map(|s| s.jobs.get(job_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn job_record(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let state = lock(&self.state)?;
        Ok(state.jobs.get(job_id).and_then(JobRecord::from_fields))
    }

    async fn start_job(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
        restart: bool,
    ) -> Result<StartOutcome> {
        let mut state = lock(&self.state)?;
        let entry = state.jobs.entry(job_id.to_string()).or_default();
        let current = match entry.get("status").filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                raw.parse::<JobStatus>()
                    .map_err(|e| anyhow!("Job {} has an unreadable status: {}", job_id, e))?,
            ),
            None => None,
        };
        if !may_start(current, restart) {
            return Ok(StartOutcome::Rejected(current.unwrap_or(JobStatus::Pending)));
        }
        entry.insert("status".to_string(), JobStatus::Running.as_str().to_string());
        entry.insert("started_at".to_string(), at.to_rfc3339());
        Ok(StartOutcome::Started)
    }

    async fn finish_job(&self, job_id: &str, update: &JobUpdate) -> Result<bool> {
        let mut state = lock(&self.state)?;
        let Some(entry) = state.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if entry.get("status").map(String::as_str) != Some(JobStatus::Running.as_str()) {
            return Ok(false);
        }
        for (k, v) in update.to_fields() {
            entry.insert(k.to_string(), v);
        }
        Ok(true)
    }

    async fn append_output(&self, job_id: &str, lines: &[OutputLine]) -> Result<()> {
        let mut state = lock(&self.state)?;
        state
            .output
            .entry(job_id.to_string())
            .or_default()
            .extend_from_slice(lines);
        Ok(())
    }

    async fn provider_token(&self, user_id: &str, provider_id: &str) -> Result<Option<String>> {
        let state = lock(&self.state)?;
        Ok(state
            .providers
            .get(provider_id)
            .filter(|(owner, _)| owner == user_id)
            .map(|(_, token)| token.clone()))
    }

    async fn try_acquire_slot(&self, user_id: &str, limit: u32) -> Result<bool> {
        let mut state = lock(&self.state)?;
        let count = state.running.entry(user_id.to_string()).or_insert(0);
        if *count >= limit {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn release_slot(&self, user_id: &str) -> Result<()> {
        let mut state = lock(&self.state)?;
        let count = state.running.entry(user_id.to_string()).or_insert(0);
        *count = count.saturating_sub(1);
        Ok(())
    }

    async fn session_state(&self, session_id: &str) -> Result<Option<SessionState>> {
        let state = lock(&self.state)?;
        Ok(state.sessions.get(session_id).cloned())
    }

    async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.sessions.insert(
            session_id.to_string(),
            SessionState {
                status: status.as_str().to_string(),
                updated_at: Some(Utc::now()),
            },
        );
        Ok(())
    }
}

struct Pending {
    fields: HashMap<String, String>,
    delivered_at: Instant,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    fresh: VecDeque<Delivery>,
    pending: HashMap<String, Pending>,
    acked: Vec<String>,
}

/// Single-consumer stand-in for a stream consumer group.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its id.
    pub fn push(&self, fields: HashMap<String, String>) -> String {
        let Ok(mut state) = lock(&self.state) else {
            return String::new();
        };
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        state.fresh.push_back(Delivery {
            id: id.clone(),
            fields,
        });
        id
    }

    pub fn acked(&self) -> Vec<String> {
        lock(&self.state).map(|s| s.acked.clone()).unwrap_or_default()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.state)
            .map(|s| s.pending.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn take_fresh(&self, count: usize) -> Result<Vec<Delivery>> {
        let mut state = lock(&self.state)?;
        let n = count.min(state.fresh.len());
        let batch: Vec<Delivery> = state.fresh.drain(..n).collect();
        let now = Instant::now();
        for d in &batch {
            state.pending.insert(
                d.id.clone(),
                Pending {
                    fields: d.fields.clone(),
                    delivered_at: now,
                },
            );
        }
        Ok(batch)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn ensure_group(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self, count: usize, block: Duration) -> Result<Vec<Delivery>> {
        let until = Instant::now() + block;
        loop {
            let batch = self.take_fresh(count)?;
            if !batch.is_empty() || Instant::now() >= until {
                return Ok(batch);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<Delivery>> {
        let mut state = lock(&self.state)?;
        let now = Instant::now();
        let mut ids: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids.truncate(count);
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = state.pending.get_mut(&id) {
                p.delivered_at = now;
                claimed.push(Delivery {
                    id,
                    fields: p.fields.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn touch(&self, ids: &[String]) -> Result<()> {
        let mut state = lock(&self.state)?;
        let now = Instant::now();
        for id in ids {
            if let Some(p) = state.pending.get_mut(id) {
                p.delivered_at = now;
            }
        }
        Ok(())
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.state)?;
        if state.pending.remove(id).is_some() {
            state.acked.push(id.to_string());
        }
        Ok(())
    }
}
