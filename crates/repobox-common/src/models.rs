use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Status only moves forward. `cancelled` is reachable from any
    /// non-terminal state but is written by the dashboard, not the runner.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// A user-submitted change request and its execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub provider_id: String,
    pub repo_url: String,
    pub repo_name: String,
    /// Branch to start from. `None` means the repository default.
    pub branch: Option<String>,
    pub prompt: String,
    pub environment: String,
    pub status: JobStatus,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub error: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// First eight characters of the id, used for branch and directory names.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(8) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }

    pub fn branch_name(&self) -> String {
        format!("repobox/{}", self.short_id())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Envelope field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("Envelope field '{field}' is invalid: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

/// Queue envelope: the message id used for acknowledgment plus the job
/// snapshot it carries.
#[derive(Debug, Clone)]
pub struct JobMessage {
    pub message_id: String,
    pub job: Job,
    pub provider_id: String,
}

impl JobMessage {
    /// Decode a flat stream entry. `job_id`, `user_id`, `repo_url` and
    /// `prompt` are required; everything else has a default.
    pub fn from_fields(
        message_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self, EnvelopeError> {
        fn required<'a>(
            fields: &'a HashMap<String, String>,
            name: &'static str,
        ) -> Result<&'a str, EnvelopeError> {
            let value = fields
                .get(name)
                .ok_or(EnvelopeError::MissingField(name))?
                .trim();
            if value.is_empty() {
                return Err(EnvelopeError::EmptyField(name));
            }
            Ok(value)
        }

        let optional = |name: &str| {
            fields
                .get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let repo_url = required(fields, "repo_url")?.to_string();
        let repo_name = optional("repo_name").unwrap_or_else(|| repo_name_from_url(&repo_url));
        let created_at = match optional("created_at") {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| EnvelopeError::InvalidField {
                    field: "created_at",
                    message: e.to_string(),
                })?
                .with_timezone(&Utc),
            None => Utc::now(),
        };
        let provider_id = optional("provider_id").unwrap_or_default();

        let job = Job {
            id: required(fields, "job_id")?.to_string(),
            user_id: required(fields, "user_id")?.to_string(),
            provider_id: provider_id.clone(),
            repo_url,
            repo_name,
            branch: optional("branch"),
            prompt: required(fields, "prompt")?.to_string(),
            environment: optional("environment").unwrap_or_else(|| "default".to_string()),
            status: JobStatus::Pending,
            lines_added: 0,
            lines_removed: 0,
            error: None,
            pr_url: None,
            created_at,
            started_at: None,
            finished_at: None,
        };

        Ok(Self {
            message_id: message_id.to_string(),
            job,
            provider_id,
        })
    }
}

/// `https://github.com/acme/widgets.git` -> `acme/widgets`
fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let path = match trimmed.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
        None => trimmed.rsplit_once(':').map(|(_, p)| p).unwrap_or(trimmed),
    };
    let parts: Vec<&str> = path.rsplitn(3, '/').collect();
    match parts.as_slice() {
        [name, owner, ..] if !owner.is_empty() => format!("{}/{}", owner, name),
        [name, ..] => name.to_string(),
        [] => String::new(),
    }
}

/// Persisted per-job record as seen in the status store.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub branch: Option<String>,
    pub error: Option<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub pr_url: Option<String>,
}

impl JobRecord {
    /// Decode a hash. Returns `None` when the hash has no parseable status.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let status = fields.get("status")?.parse::<JobStatus>().ok()?;
        let text = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();
        let time = |name: &str| {
            fields
                .get(name)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        let count = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Some(Self {
            status,
            started_at: time("started_at"),
            finished_at: time("finished_at"),
            branch: text("branch"),
            error: text("error"),
            lines_added: count("lines_added"),
            lines_removed: count("lines_removed"),
            pr_url: text("pr_url"),
        })
    }
}

/// Terminal write to a job record. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub branch: Option<String>,
    pub error: Option<String>,
    pub lines_added: Option<u64>,
    pub lines_removed: Option<u64>,
}

impl JobUpdate {
    pub fn succeeded(at: DateTime<Utc>, branch: &str, lines_added: u64, lines_removed: u64) -> Self {
        Self {
            status: Some(JobStatus::Success),
            finished_at: Some(at),
            branch: Some(branch.to_string()),
            lines_added: Some(lines_added),
            lines_removed: Some(lines_removed),
            ..Default::default()
        }
    }

    pub fn failed(at: DateTime<Utc>, error: &str) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            finished_at: Some(at),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(status) = self.status {
            fields.push(("status", status.as_str().to_string()));
        }
        if let Some(at) = self.finished_at {
            fields.push(("finished_at", at.to_rfc3339()));
        }
        if let Some(ref branch) = self.branch {
            fields.push(("branch", branch.clone()));
        }
        if let Some(ref error) = self.error {
            fields.push(("error", error.clone()));
        }
        if let Some(n) = self.lines_added {
            fields.push(("lines_added", n.to_string()));
        }
        if let Some(n) = self.lines_removed {
            fields.push(("lines_removed", n.to_string()));
        }
        fields
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    System,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

/// One line of job output as stored in the per-job output list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub source: String,
    pub line: String,
}

impl OutputLine {
    pub fn new(stream: OutputStream, source: &str, line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            source: source.to_string(),
            line: line.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Ready,
    Running,
    Pushing,
    Pushed,
    Archived,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Pushing => "pushing",
            Self::Pushed => "pushed",
            Self::Archived => "archived",
            Self::Failed => "failed",
        }
    }

    /// Sessions whose work has left the machine and whose directory can go.
    pub fn is_evictable(&self) -> bool {
        matches!(self, Self::Pushed | Self::Archived)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "pushing" => Ok(Self::Pushing),
            "pushed" => Ok(Self::Pushed),
            "archived" => Ok(Self::Archived),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// Externally visible state of a work session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Raw status string; unknown values are preserved rather than rejected.
    pub status: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn parsed_status(&self) -> Option<SessionStatus> {
        self.status.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> HashMap<String, String> {
        [
            ("job_id", "3f2a9c1e-7d4b-4e8a-9f10-5b6c7d8e9f00"),
            ("user_id", "user-1"),
            ("provider_id", "prov-1"),
            ("repo_url", "https://github.com/acme/widgets.git"),
            ("prompt", "fix typo"),
            ("environment", "node"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_valid_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Success));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!JobStatus::Success.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Success));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Success.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_job_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_envelope_decodes_required_and_defaults() {
        let msg = JobMessage::from_fields("1700000000000-0", &envelope()).unwrap();
        assert_eq!(msg.message_id, "1700000000000-0");
        assert_eq!(msg.provider_id, "prov-1");
        assert_eq!(msg.job.repo_name, "acme/widgets");
        assert_eq!(msg.job.environment, "node");
        assert_eq!(msg.job.branch, None);
        assert_eq!(msg.job.status, JobStatus::Pending);
    }

    #[test]
    fn test_envelope_missing_prompt_is_rejected() {
        let mut fields = envelope();
        fields.remove("prompt");
        let err = JobMessage::from_fields("1-0", &fields).unwrap_err();
        assert_eq!(err, EnvelopeError::MissingField("prompt"));
    }

    #[test]
    fn test_envelope_blank_user_is_rejected() {
        let mut fields = envelope();
        fields.insert("user_id".into(), "   ".into());
        let err = JobMessage::from_fields("1-0", &fields).unwrap_err();
        assert_eq!(err, EnvelopeError::EmptyField("user_id"));
    }

    #[test]
    fn test_short_id_and_branch_name() {
        let msg = JobMessage::from_fields("1-0", &envelope()).unwrap();
        assert_eq!(msg.job.short_id(), "3f2a9c1e");
        assert_eq!(msg.job.branch_name(), "repobox/3f2a9c1e");
    }

    #[test]
    fn test_short_id_shorter_than_eight() {
        let mut fields = envelope();
        fields.insert("job_id".into(), "abc".into());
        let msg = JobMessage::from_fields("1-0", &fields).unwrap();
        assert_eq!(msg.job.short_id(), "abc");
    }

    #[test]
    fn test_repo_name_from_url_variants() {
        assert_eq!(repo_name_from_url("https://gitlab.com/group/proj"), "group/proj");
        assert_eq!(repo_name_from_url("git@github.com:acme/widgets.git"), "acme/widgets");
        assert_eq!(repo_name_from_url("/srv/git/widgets.git"), "git/widgets");
    }

    #[test]
    fn test_job_record_from_fields() {
        let fields: HashMap<String, String> = [
            ("status", "success"),
            ("started_at", "2026-01-02T03:04:05Z"),
            ("branch", "repobox/abcdef12"),
            ("lines_added", "12"),
            ("lines_removed", "4"),
            ("error", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let record = JobRecord::from_fields(&fields).unwrap();
        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.lines_added, 12);
        assert_eq!(record.lines_removed, 4);
        assert!(record.started_at.is_some());
        assert_eq!(record.error, None);
    }

    #[test]
    fn test_job_record_without_status_is_none() {
        assert!(JobRecord::from_fields(&HashMap::new()).is_none());
    }

    #[test]
    fn test_update_fields_only_include_set_values() {
        let update = JobUpdate::failed(Utc::now(), "clone failed");
        let keys: Vec<&str> = update.to_fields().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["status", "finished_at", "error"]);
    }

    #[test]
    fn test_output_line_serializes_lowercase_stream() {
        let line = OutputLine::new(OutputStream::Stderr, "agent", "boom");
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["source"], "agent");
        assert_eq!(json["line"], "boom");
    }

    #[test]
    fn test_session_status_evictable() {
        assert!(SessionStatus::Pushed.is_evictable());
        assert!(SessionStatus::Archived.is_evictable());
        assert!(!SessionStatus::Running.is_evictable());
        let state = SessionState {
            status: "mystery".into(),
            updated_at: None,
        };
        assert_eq!(state.parsed_status(), None);
    }
}
