//! AI coding-agent backends.
//!
//! The pipeline only sees [`AgentBackend`]. Which implementation it gets is
//! decided once at startup by [`from_config`]: the live CLI agent when it is
//! enabled and an API key is configured, otherwise the mock.

pub mod live;
pub mod mock;
pub mod stream;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AgentConfig;
use crate::deadline::Deadline;
use crate::errors::AgentError;
use crate::sink::OutputSink;

pub use live::LiveAgent;
pub use mock::{MOCK_ARTIFACT, MockAgent};

/// Output protocol requested from the agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    StreamJson,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::StreamJson => "stream-json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "stream-json" => Ok(Self::StreamJson),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

/// Abstraction over agent execution for testability.
/// Real implementation: `LiveAgent`. Test double: `MockAgent`.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the agent in `work_dir` until it exits or `deadline` fires,
    /// streaming what it prints into `sink`.
    async fn execute(
        &self,
        work_dir: &Path,
        prompt: &str,
        environment: &str,
        sink: &OutputSink,
        deadline: &Deadline,
    ) -> Result<(), AgentError>;
}

pub fn from_config(config: &AgentConfig) -> Arc<dyn AgentBackend> {
    match (config.enabled, config.api_key.as_ref()) {
        (true, Some(key)) => Arc::new(LiveAgent::new(config, key.clone())),
        (true, None) => {
            tracing::warn!("agent enabled but no API key configured; using mock agent");
            Arc::new(MockAgent)
        }
        (false, _) => Arc::new(MockAgent),
    }
}
