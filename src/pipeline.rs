//! Per-job orchestration: clone, branch, agent, commit, diff, push.
//!
//! [`Executor`] is the worker pool's [`JobHandler`]. Whatever the pipeline
//! returns, it writes a terminal status (unless the job left the running
//! state underneath it), flushes the job's output, releases the user's
//! running slot, and only then acknowledges the queue message.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use repobox_common::{Job, JobMessage, JobStatus, JobUpdate, OutputStream};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentBackend;
use crate::crypto::Decryptor;
use crate::deadline::Deadline;
use crate::errors::JobError;
use crate::git::{GitIdentity, GitOperator};
use crate::pool::JobHandler;
use crate::sink::OutputSink;
use crate::store::{JobQueue, JobStore, StartOutcome};
use crate::workdir::{ActiveWorkDirs, WorkDir};

const SUBJECT_MAX_CHARS: usize = 60;
const DEFAULT_BASE_BRANCH: &str = "main";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub temp_dir: PathBuf,
    pub job_timeout: Duration,
    pub cleanup_after_job: bool,
    pub identity: GitIdentity,
}

/// Commit message: `repobox: <first prompt line>` with the full prompt as
/// the body.
pub fn commit_message(prompt: &str) -> String {
    let first = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("automated change");
    let subject: String = first.chars().take(SUBJECT_MAX_CHARS).collect();
    format!("repobox: {}\n\n{}", subject, prompt.trim())
}

/// What to do with the queue message once the run is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    /// Another run owns the job, or the terminal write did not land.
    LeavePending,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub branch: String,
    pub base: String,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub committed: bool,
}

pub struct Executor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    decryptor: Arc<Decryptor>,
    agent: Arc<dyn AgentBackend>,
    settings: PipelineSettings,
    active: ActiveWorkDirs,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        decryptor: Arc<Decryptor>,
        agent: Arc<dyn AgentBackend>,
        settings: PipelineSettings,
        active: ActiveWorkDirs,
    ) -> Self {
        Self {
            store,
            queue,
            decryptor,
            agent,
            settings,
            active,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts every running job when cancelled. Pool shutdown
    /// does not use it; it is for forced termination.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn resolve_token(&self, job: &Job) -> Result<Option<SecretString>, JobError> {
        if job.provider_id.is_empty() {
            return Ok(None);
        }
        let encrypted = self
            .store
            .provider_token(&job.user_id, &job.provider_id)
            .await
            .map_err(JobError::Store)?
            .ok_or_else(|| JobError::MissingProviderToken {
                provider_id: job.provider_id.clone(),
            })?;
        Ok(Some(self.decryptor.decrypt(&encrypted)?))
    }

    /// Run one job to completion. Takes the job from pending to running
    /// with a compare-and-set; a job someone else already started or
    /// finished comes back as [`JobError::InvalidTransition`]. Does not
    /// write the terminal status; see [`Executor::handle`].
    pub async fn run_pipeline(
        &self,
        msg: &JobMessage,
        sink: &OutputSink,
        deadline: &Deadline,
    ) -> Result<JobOutcome, JobError> {
        let job = &msg.job;
        let restart = job.status == JobStatus::Running;
        match self
            .store
            .start_job(&job.id, Utc::now(), restart)
            .await
            .map_err(JobError::Store)?
        {
            StartOutcome::Started => {}
            StartOutcome::Rejected(from) => {
                return Err(JobError::InvalidTransition {
                    from,
                    to: JobStatus::Running,
                });
            }
        }
        sink.system(format!("Starting job for {}", job.repo_name)).await;

        let work = WorkDir::create(
            &self.settings.temp_dir,
            &job.id,
            self.settings.cleanup_after_job,
            &self.active,
        )?;
        let result = self.run_in(job, &work, sink, deadline).await;
        work.close().await;
        result
    }

    async fn run_in(
        &self,
        job: &Job,
        work: &WorkDir,
        sink: &OutputSink,
        deadline: &Deadline,
    ) -> Result<JobOutcome, JobError> {
        let repo = work.repo_path();

        let token = self.resolve_token(job).await?;
        if token.is_none() {
            sink.system("No provider configured; using anonymous access").await;
        }
        let git = GitOperator::new(token, self.settings.identity.clone());

        sink.system(format!("Cloning {}", job.repo_url)).await;
        git.clone(&job.repo_url, &repo, deadline).await?;

        let base = match job.branch.as_deref().filter(|b| !b.is_empty()) {
            Some(target) => {
                let head = git.current_branch(&repo, deadline).await?;
                if head.as_deref() != Some(target) {
                    sink.system(format!("Checking out {}", target)).await;
                    git.checkout(&repo, target, deadline).await?;
                }
                target.to_string()
            }
            None => git
                .current_branch(&repo, deadline)
                .await?
                .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
        };

        let branch = job.branch_name();
        sink.system(format!("Creating branch {} from {}", branch, base))
            .await;
        git.create_branch(&repo, &branch, deadline).await?;

        sink.system(format!("Running {} agent", self.agent.name()))
            .await;
        self.agent
            .execute(&repo, &job.prompt, &job.environment, sink, deadline)
            .await?;

        sink.system("Committing changes").await;
        let committed = git
            .commit(&repo, &commit_message(&job.prompt), deadline)
            .await?;
        if !committed {
            sink.system("Agent made no changes").await;
        }

        let stats = git.diff_stats(&repo, &base, deadline).await?;
        sink.system(format!(
            "{} files changed, +{} -{}",
            stats.files, stats.added, stats.removed
        ))
        .await;

        sink.system(format!("Pushing {}", branch)).await;
        git.push(&repo, &branch, deadline).await?;

        Ok(JobOutcome {
            branch,
            base,
            lines_added: stats.added,
            lines_removed: stats.removed,
            committed,
        })
    }

    /// Terminal write, applied only while the job is still running. A job
    /// cancelled from the dashboard keeps its status and the message is
    /// still acked.
    async fn finish(&self, job: &Job, update: &JobUpdate, sink: &OutputSink) -> Settle {
        match self.store.finish_job(&job.id, update).await {
            Ok(true) => {
                sink.system("Job finished").await;
                Settle::Ack
            }
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "job left running state during the run; keeping its status");
                sink.system("Job status changed during the run; result not recorded")
                    .await;
                Settle::Ack
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to record terminal status");
                Settle::LeavePending
            }
        }
    }
}

#[async_trait]
impl JobHandler for Executor {
    async fn handle(&self, msg: JobMessage) {
        let job_id = msg.job.id.clone();
        let user_id = msg.job.user_id.clone();
        let started = std::time::Instant::now();
        let (sink, writer) = OutputSink::spawn(self.store.clone(), &job_id);
        let deadline = Deadline::with_parent(&self.cancel, self.settings.job_timeout);

        tracing::info!(job_id = %job_id, user_id = %user_id, repo = %msg.job.repo_name, "job started");
        let result = self.run_pipeline(&msg, &sink, &deadline).await;

        let settle = match &result {
            Ok(outcome) => {
                tracing::info!(
                    job_id = %job_id,
                    branch = %outcome.branch,
                    lines_added = outcome.lines_added,
                    lines_removed = outcome.lines_removed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job succeeded"
                );
                let update = JobUpdate::succeeded(
                    Utc::now(),
                    &outcome.branch,
                    outcome.lines_added,
                    outcome.lines_removed,
                );
                self.finish(&msg.job, &update, &sink).await
            }
            // A live run elsewhere holds the message; it acks when done.
            Err(e @ JobError::InvalidTransition {
                from: JobStatus::Running,
                ..
            }) => {
                tracing::warn!(job_id = %job_id, error = %e, "job already running; leaving message pending");
                Settle::LeavePending
            }
            Err(e @ JobError::InvalidTransition { .. }) => {
                tracing::info!(job_id = %job_id, error = %e, "job already finished; acking duplicate");
                Settle::Ack
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, timeout = e.is_timeout(), "job failed");
                let text = e.to_string();
                sink.emit(OutputStream::System, "runner", format!("Error: {}", text))
                    .await;
                self.finish(&msg.job, &JobUpdate::failed(Utc::now(), &text), &sink)
                    .await
            }
        };

        drop(sink);
        let lines = writer.finish().await;
        tracing::debug!(job_id = %job_id, lines, "output flushed");

        // The consumer took a slot for this delivery whatever the outcome.
        if let Err(e) = self.store.release_slot(&user_id).await {
            tracing::error!(job_id = %job_id, user_id = %user_id, error = %e, "failed to release running slot");
        }

        match settle {
            Settle::Ack => {
                if let Err(e) = self.queue.ack(&msg.message_id).await {
                    tracing::warn!(job_id = %job_id, message_id = %msg.message_id, error = %e, "ack failed");
                }
            }
            Settle::LeavePending => {
                tracing::debug!(job_id = %job_id, message_id = %msg.message_id, "leaving message pending");
            }
        }
    }
}
