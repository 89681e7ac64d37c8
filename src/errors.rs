//! Typed error hierarchy for the Repobox runner.
//!
//! One enum per subsystem:
//! - `CryptoError` for token decryption
//! - `GitError` for git subprocess failures
//! - `AgentError` for the coding-agent subprocess
//! - `PoolError` for worker pool admission
//! - `JobError` for the per-job pipeline, wrapping the above
//! - `ConfigError` for startup validation

use std::path::PathBuf;

use repobox_common::JobStatus;
use thiserror::Error;

use crate::deadline::Expiry;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Malformed encrypted token: {0}")]
    Format(String),

    #[error("Invalid {field} length: expected {expected} bytes, got {actual}")]
    Length {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Token authentication failed")]
    Authentication,

    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Unsupported URL scheme for credentialed access: {url}")]
    UnsupportedScheme { url: String },

    #[error("git {command} failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("Failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git command timed out")]
    Timeout,

    #[error("git command cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent exited with non-zero code {code}")]
    Exit { code: i32 },

    #[error("Agent timed out")]
    Timeout,

    #[error("Agent cancelled")]
    Cancelled,

    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to write agent artifact at {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<Expiry> for GitError {
    fn from(expiry: Expiry) -> Self {
        match expiry {
            Expiry::Timeout => GitError::Timeout,
            Expiry::Cancelled => GitError::Cancelled,
        }
    }
}

impl From<Expiry> for AgentError {
    fn from(expiry: Expiry) -> Self {
        match expiry {
            Expiry::Timeout => AgentError::Timeout,
            Expiry::Cancelled => AgentError::Cancelled,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is stopped")]
    Stopped,
}

/// Errors that fail a single job. The display text is what lands in the
/// job record's `error` field.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("No credentials stored for provider {provider_id}")]
    MissingProviderToken { provider_id: String },

    #[error("Failed to prepare work directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Token decryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl JobError {
    /// True when the job stopped because its deadline fired or it was
    /// cancelled, rather than because a step failed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            JobError::Git(GitError::Timeout | GitError::Cancelled)
                | JobError::Agent(AgentError::Timeout | AgentError::Cancelled)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("Agent output format must be 'text' or 'stream-json', got '{0}'")]
    OutputFormat(String),
}
