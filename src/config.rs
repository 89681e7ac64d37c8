//! Runner configuration.
//!
//! Every flag can also be set through a `REPOBOX_*` environment variable
//! (or a `.env` file loaded at startup). [`RunnerArgs::into_config`] turns
//! the raw flags into a validated [`RunnerConfig`]; any error there is fatal.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use secrecy::SecretString;

use crate::agent::OutputFormat;
use crate::errors::ConfigError;
use crate::git::GitIdentity;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "repobox-runner")]
#[command(version, about = "Pull queued change requests, run the coding agent, push the branch")]
pub struct RunnerArgs {
    /// Redis connection URL
    #[arg(long, env = "REPOBOX_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Key used to decrypt provider tokens (64 hex, 44 base64 or 32 raw chars)
    #[arg(long, env = "REPOBOX_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: String,

    #[arg(long, env = "REPOBOX_STREAM", default_value = "repobox:jobs")]
    pub stream: String,

    #[arg(long, env = "REPOBOX_GROUP", default_value = "repobox-runners")]
    pub group: String,

    /// Consumer name within the group. Defaults to a random per-process name.
    #[arg(long, env = "REPOBOX_CONSUMER")]
    pub consumer: Option<String>,

    /// Number of concurrent workers
    #[arg(long, env = "REPOBOX_POOL_SIZE", default_value_t = 4)]
    pub pool_size: usize,

    /// Messages buffered between the consumer and the workers
    #[arg(long, env = "REPOBOX_QUEUE_CAPACITY", default_value_t = 8)]
    pub queue_capacity: usize,

    /// Maximum concurrently running jobs per user
    #[arg(long, env = "REPOBOX_PER_USER_LIMIT", default_value_t = 2)]
    pub per_user_limit: u32,

    #[arg(long, env = "REPOBOX_JOB_TIMEOUT_SECS", default_value_t = 1800)]
    pub job_timeout_secs: u64,

    /// Root for job and session work directories [default: <system temp>/repobox]
    #[arg(long, env = "REPOBOX_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long, env = "REPOBOX_CLEANUP_AFTER_JOB", default_value_t = true, action = ArgAction::Set)]
    pub cleanup_after_job: bool,

    #[arg(long, env = "REPOBOX_CLEANUP_ON_STARTUP", default_value_t = true, action = ArgAction::Set)]
    pub cleanup_on_startup: bool,

    #[arg(long, env = "REPOBOX_CLEANUP_INTERVAL_SECS", default_value_t = 600)]
    pub cleanup_interval_secs: u64,

    /// Job directories older than this are removed by the periodic sweep
    #[arg(long, env = "REPOBOX_MAX_AGE_SECS", default_value_t = 7200)]
    pub max_age_secs: u64,

    #[arg(long, env = "REPOBOX_SESSION_MAX_AGE_SECS", default_value_t = 86400)]
    pub session_max_age_secs: u64,

    /// Disk quota for the temp dir, in bytes
    #[arg(long, env = "REPOBOX_MAX_DISK_BYTES", default_value_t = 10 * GIB)]
    pub max_disk_bytes: u64,

    #[arg(long, env = "REPOBOX_AGENT_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub agent_enabled: bool,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    #[arg(long, env = "REPOBOX_AGENT_BINARY", default_value = "claude")]
    pub agent_binary: PathBuf,

    /// Agent output protocol: text or stream-json
    #[arg(long, env = "REPOBOX_AGENT_OUTPUT_FORMAT", default_value = "stream-json")]
    pub agent_output_format: String,

    #[arg(long, env = "REPOBOX_AGENT_MAX_OUTPUT_LINES", default_value_t = 10_000)]
    pub agent_max_output_lines: usize,

    /// Agent-only time limit, applied inside the job timeout
    #[arg(long, env = "REPOBOX_AGENT_TIMEOUT_SECS")]
    pub agent_timeout_secs: Option<u64>,

    #[arg(long, env = "REPOBOX_GIT_AUTHOR_NAME", default_value = "Repobox")]
    pub git_author_name: String,

    #[arg(long, env = "REPOBOX_GIT_AUTHOR_EMAIL", default_value = "bot@repobox.dev")]
    pub git_author_email: String,

    #[arg(long, env = "REPOBOX_RECLAIM_INTERVAL_SECS", default_value_t = 15)]
    pub reclaim_interval_secs: u64,

    /// Pending messages idle longer than this are claimed by this runner
    #[arg(long, env = "REPOBOX_RECLAIM_IDLE_SECS", default_value_t = 30)]
    pub reclaim_idle_secs: u64,

    /// Log output format
    #[arg(long, env = "REPOBOX_LOG_FORMAT", default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupPolicy {
    pub on_startup: bool,
    pub interval: Duration,
    pub max_age: Duration,
    pub max_disk_bytes: u64,
    pub session_max_age: Duration,
    pub after_job: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            on_startup: true,
            interval: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(2 * 60 * 60),
            max_disk_bytes: 10 * GIB,
            session_max_age: Duration::from_secs(24 * 60 * 60),
            after_job: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub enabled: bool,
    pub api_key: Option<SecretString>,
    pub binary: PathBuf,
    pub output_format: OutputFormat,
    pub max_output_lines: usize,
    pub timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            binary: PathBuf::from("claude"),
            output_format: OutputFormat::StreamJson,
            max_output_lines: 10_000,
            timeout: None,
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub redis_url: String,
    pub encryption_key: SecretString,
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub pool_size: usize,
    pub queue_capacity: usize,
    pub per_user_limit: u32,
    pub job_timeout: Duration,
    pub temp_dir: PathBuf,
    pub cleanup: CleanupPolicy,
    pub agent: AgentConfig,
    pub git_identity: GitIdentity,
    pub reclaim_interval: Duration,
    pub reclaim_idle: Duration,
    pub json_logs: bool,
}

fn positive(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}

fn at_least_one(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value < 1 {
        return Err(ConfigError::Invalid {
            field,
            message: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

impl RunnerArgs {
    pub fn into_config(self) -> Result<RunnerConfig, ConfigError> {
        at_least_one("pool_size", self.pool_size as u64)?;
        at_least_one("queue_capacity", self.queue_capacity as u64)?;
        at_least_one("per_user_limit", self.per_user_limit as u64)?;
        at_least_one("agent_max_output_lines", self.agent_max_output_lines as u64)?;

        let job_timeout = positive("job_timeout_secs", self.job_timeout_secs)?;
        let agent_timeout = self
            .agent_timeout_secs
            .map(|s| positive("agent_timeout_secs", s))
            .transpose()?;
        let output_format = self
            .agent_output_format
            .parse::<OutputFormat>()
            .map_err(|_| ConfigError::OutputFormat(self.agent_output_format.clone()))?;

        if self.encryption_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "encryption_key",
                message: "must not be empty".to_string(),
            });
        }

        let consumer = self.consumer.filter(|c| !c.trim().is_empty()).unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("runner-{}", &id[..8])
        });

        Ok(RunnerConfig {
            redis_url: self.redis_url,
            encryption_key: SecretString::from(self.encryption_key),
            stream: self.stream,
            group: self.group,
            consumer,
            pool_size: self.pool_size,
            queue_capacity: self.queue_capacity,
            per_user_limit: self.per_user_limit,
            job_timeout,
            temp_dir: self
                .temp_dir
                .unwrap_or_else(|| std::env::temp_dir().join("repobox")),
            cleanup: CleanupPolicy {
                on_startup: self.cleanup_on_startup,
                interval: positive("cleanup_interval_secs", self.cleanup_interval_secs)?,
                max_age: positive("max_age_secs", self.max_age_secs)?,
                max_disk_bytes: self.max_disk_bytes,
                session_max_age: positive("session_max_age_secs", self.session_max_age_secs)?,
                after_job: self.cleanup_after_job,
            },
            agent: AgentConfig {
                enabled: self.agent_enabled,
                api_key: self
                    .anthropic_api_key
                    .filter(|k| !k.trim().is_empty())
                    .map(SecretString::from),
                binary: self.agent_binary,
                output_format,
                max_output_lines: self.agent_max_output_lines,
                timeout: agent_timeout,
            },
            git_identity: GitIdentity {
                name: self.git_author_name,
                email: self.git_author_email,
            },
            reclaim_interval: positive("reclaim_interval_secs", self.reclaim_interval_secs)?,
            reclaim_idle: positive("reclaim_idle_secs", self.reclaim_idle_secs)?,
            json_logs: self.log_format == "json",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> RunnerArgs {
        let mut argv = vec!["repobox-runner", "--encryption-key", "k"];
        argv.extend_from_slice(extra);
        RunnerArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.per_user_limit, 2);
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
        assert_eq!(config.stream, "repobox:jobs");
        assert_eq!(config.group, "repobox-runners");
        assert!(config.consumer.starts_with("runner-"));
        assert_eq!(config.cleanup, CleanupPolicy::default());
        assert_eq!(config.agent.binary, PathBuf::from("claude"));
        assert_eq!(config.agent.output_format, OutputFormat::StreamJson);
        assert_eq!(config.agent.max_output_lines, 10_000);
        assert!(config.temp_dir.ends_with("repobox"));
        assert!(!config.json_logs);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let err = parse(&["--pool-size", "0"]).into_config().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "pool_size", .. }));
    }

    #[test]
    fn test_zero_per_user_limit_rejected() {
        let err = parse(&["--per-user-limit", "0"]).into_config().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "per_user_limit",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = parse(&["--job-timeout-secs", "0"]).into_config().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "job_timeout_secs",
                ..
            }
        ));
        let err = parse(&["--agent-timeout-secs", "0"]).into_config().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "agent_timeout_secs",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_output_format_rejected() {
        let err = parse(&["--agent-output-format", "xml"])
            .into_config()
            .unwrap_err();
        assert_eq!(err, ConfigError::OutputFormat("xml".to_string()));
    }

    #[test]
    fn test_boolean_flags_take_values() {
        let config = parse(&["--cleanup-after-job", "false", "--agent-enabled", "false"])
            .into_config()
            .unwrap();
        assert!(!config.cleanup.after_job);
        assert!(!config.agent.enabled);
    }

    #[test]
    fn test_blank_api_key_treated_as_missing() {
        let config = parse(&["--anthropic-api-key", "  "]).into_config().unwrap();
        assert!(config.agent.api_key.is_none());
    }

    #[test]
    fn test_log_format_json() {
        let config = parse(&["--log-format", "json"]).into_config().unwrap();
        assert!(config.json_logs);
        assert!(RunnerArgs::try_parse_from(["repobox-runner", "--encryption-key", "k", "--log-format", "xml"]).is_err());
    }
}
