//! Reclaims disk under the temp dir.
//!
//! Layout: `<temp_dir>/job-*` are per-job work dirs, `<temp_dir>/sessions/<id>`
//! are session dirs whose status lives in the store. Nothing registered in
//! [`ActiveWorkDirs`] is ever touched, and job records are never mutated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use repobox_common::SessionStatus;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::CleanupPolicy;
use crate::store::JobStore;
use crate::workdir::ActiveWorkDirs;

const JOB_DIR_PREFIX: &str = "job-";
const SESSIONS_DIR: &str = "sessions";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub failed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.removed += other.removed;
        self.freed_bytes += other.freed_bytes;
        self.failed += other.failed;
    }
}

/// Total size of regular files under `path`. Unreadable entries count as 0.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

fn subdirs(root: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %root.display(), error = %e, "failed to list directory");
            }
            return Vec::new();
        }
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect()
}

fn is_job_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(JOB_DIR_PREFIX))
        .unwrap_or(false)
}

fn session_id(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

/// Remove `path`, returning the bytes it held.
async fn remove(path: PathBuf) -> std::io::Result<u64> {
    tokio::task::spawn_blocking(move || {
        let size = dir_size(&path);
        std::fs::remove_dir_all(&path)?;
        Ok(size)
    })
    .await
    .map_err(std::io::Error::other)?
}

pub struct Cleaner {
    temp_dir: PathBuf,
    policy: CleanupPolicy,
    store: Arc<dyn JobStore>,
    active: ActiveWorkDirs,
}

impl Cleaner {
    pub fn new(
        temp_dir: PathBuf,
        policy: CleanupPolicy,
        store: Arc<dyn JobStore>,
        active: ActiveWorkDirs,
    ) -> Self {
        Self {
            temp_dir,
            policy,
            store,
            active,
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.temp_dir.join(SESSIONS_DIR)
    }

    async fn remove_into(&self, path: &Path, reason: &str, report: &mut SweepReport) -> bool {
        if self.active.contains(path) {
            return false;
        }
        match remove(path.to_path_buf()).await {
            Ok(bytes) => {
                tracing::info!(path = %path.display(), bytes, reason, "removed directory");
                report.removed += 1;
                report.freed_bytes += bytes;
                true
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, reason, "failed to remove directory");
                report.failed += 1;
                false
            }
        }
    }

    /// Remove every job dir left by a previous process. Runs before any
    /// job is accepted, so nothing is active yet.
    pub async fn sweep_startup(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for dir in subdirs(&self.temp_dir).into_iter().filter(|p| is_job_dir(p)) {
            self.remove_into(&dir, "startup", &mut report).await;
        }
        if report.removed > 0 || report.failed > 0 {
            tracing::info!(
                removed = report.removed,
                freed_bytes = report.freed_bytes,
                failed = report.failed,
                "startup sweep finished"
            );
        }
        report
    }

    /// Remove job dirs past max age and session dirs that are evictable,
    /// idle past the session max age, or unknown to the store.
    pub async fn sweep_expired(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for dir in subdirs(&self.temp_dir).into_iter().filter(|p| is_job_dir(p)) {
            let expired = age(&dir).map(|a| a >= self.policy.max_age).unwrap_or(false);
            if expired {
                self.remove_into(&dir, "expired", &mut report).await;
            }
        }

        for dir in subdirs(&self.sessions_dir()) {
            let Some(id) = session_id(&dir) else { continue };
            if self.active.contains(&dir) {
                continue;
            }
            let state = match self.store.session_state(&id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "session lookup failed; skipping");
                    report.failed += 1;
                    continue;
                }
            };
            let Some(state) = state else {
                self.remove_into(&dir, "orphaned session", &mut report).await;
                continue;
            };
            if state.parsed_status().map(|s| s.is_evictable()).unwrap_or(false) {
                self.remove_into(&dir, "session pushed or archived", &mut report)
                    .await;
                continue;
            }

            let idle = match state.updated_at {
                Some(at) => (Utc::now() - at).to_std().unwrap_or(Duration::ZERO),
                None => age(&dir).unwrap_or(Duration::ZERO),
            };
            if idle >= self.policy.session_max_age {
                if let Err(e) = self
                    .store
                    .set_session_status(&id, SessionStatus::Archived)
                    .await
                {
                    tracing::warn!(session_id = %id, error = %e, "failed to archive idle session; skipping");
                    report.failed += 1;
                    continue;
                }
                self.remove_into(&dir, "session idle", &mut report).await;
            }
        }
        report
    }

    /// Delete inactive dirs oldest-first until usage is back under quota.
    pub async fn enforce_quota(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let root = self.temp_dir.clone();
        let mut total = tokio::task::spawn_blocking(move || dir_size(&root))
            .await
            .unwrap_or(0);
        if total <= self.policy.max_disk_bytes {
            return report;
        }
        tracing::warn!(
            used_bytes = total,
            max_bytes = self.policy.max_disk_bytes,
            "temp dir over quota"
        );

        let mut candidates: Vec<(SystemTime, PathBuf)> = subdirs(&self.temp_dir)
            .into_iter()
            .filter(|p| is_job_dir(p))
            .chain(subdirs(&self.sessions_dir()))
            .filter(|p| !self.active.contains(p))
            .filter_map(|p| {
                let modified = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                Some((modified, p))
            })
            .collect();
        candidates.sort();

        for (_, dir) in candidates {
            if total <= self.policy.max_disk_bytes {
                break;
            }
            let before = report.freed_bytes;
            if self.remove_into(&dir, "quota", &mut report).await {
                total = total.saturating_sub(report.freed_bytes - before);
            }
        }
        report
    }

    /// One periodic pass: expiry first, then quota.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = self.sweep_expired().await;
        report.merge(self.enforce_quota().await);
        tracing::debug!(
            removed = report.removed,
            freed_bytes = report.freed_bytes,
            failed = report.failed,
            "cleanup sweep finished"
        );
        report
    }

    /// Run [`Cleaner::sweep`] every `policy.interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.policy.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the startup sweep covers it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            tracing::debug!("cleaner stopped");
        })
    }
}
