use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use repobox_common::OutputStream;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::stream::summarize_line;
use super::{AgentBackend, OutputFormat};
use crate::config::AgentConfig;
use crate::deadline::{Deadline, Expiry};
use crate::errors::AgentError;
use crate::sink::OutputSink;

/// How long to keep reading the pipes after the agent exits. Anything it
/// spawned may still hold them open.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    Drained,
    Expired(Expiry),
}

/// What to do with the next output line under the line cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Emit,
    /// First line past the cap: emit the truncation marker instead.
    Truncate,
    Drop,
}

#[derive(Debug)]
pub struct LineLimiter {
    max: usize,
    seen: usize,
}

impl LineLimiter {
    pub fn new(max: usize) -> Self {
        Self { max, seen: 0 }
    }

    pub fn admit(&mut self) -> Admit {
        self.seen = self.seen.saturating_add(1);
        if self.seen <= self.max {
            Admit::Emit
        } else if self.seen == self.max + 1 {
            Admit::Truncate
        } else {
            Admit::Drop
        }
    }
}

/// Runs the agent CLI as a subprocess.
pub struct LiveAgent {
    binary: PathBuf,
    api_key: SecretString,
    format: OutputFormat,
    max_lines: usize,
    timeout: Option<Duration>,
}

impl LiveAgent {
    pub fn new(config: &AgentConfig, api_key: SecretString) -> Self {
        Self {
            binary: config.binary.clone(),
            api_key,
            format: config.output_format,
            max_lines: config.max_output_lines,
            timeout: config.timeout,
        }
    }

    fn command(&self, work_dir: &Path, prompt: &str, environment: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg("--output-format")
            .arg(self.format.as_str());
        if self.format == OutputFormat::StreamJson {
            cmd.arg("--verbose");
        }
        cmd.arg("--dangerously-skip-permissions")
            .arg(prompt)
            .current_dir(work_dir)
            .env("ANTHROPIC_API_KEY", self.api_key.expose_secret())
            .env("REPOBOX_ENVIRONMENT", environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Forward lines from one pipe until EOF or the deadline.
fn spawn_reader<R>(
    pipe: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, String)>,
    deadline: Deadline,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            let next = tokio::select! {
                line = lines.next_line() => line,
                _ = deadline.expired() => break,
            };
            match next {
                Ok(Some(line)) => {
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(stream = stream.as_str(), error = %e, "agent pipe read failed");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl AgentBackend for LiveAgent {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn execute(
        &self,
        work_dir: &Path,
        prompt: &str,
        environment: &str,
        sink: &OutputSink,
        deadline: &Deadline,
    ) -> Result<(), AgentError> {
        let deadline = deadline.narrowed(self.timeout);
        let mut child = self
            .command(work_dir, prompt, environment)
            .spawn()
            .map_err(AgentError::Spawn)?;
        tracing::info!(
            binary = %self.binary.display(),
            format = self.format.as_str(),
            "agent started"
        );

        let (tx, mut rx) = mpsc::channel::<(OutputStream, String)>(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, tx.clone(), deadline.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, tx.clone(), deadline.clone());
        }
        drop(tx);

        let mut limiter = LineLimiter::new(self.max_lines);
        let max_lines = self.max_lines;
        let format = self.format;
        let forward = async {
            while let Some((stream, raw)) = rx.recv().await {
                let rendered = match (format, stream) {
                    (OutputFormat::StreamJson, OutputStream::Stdout) => summarize_line(&raw),
                    _ => vec![raw],
                };
                for line in rendered {
                    match limiter.admit() {
                        Admit::Emit => sink.emit(stream, "agent", line).await,
                        Admit::Truncate => {
                            sink.emit(
                                OutputStream::System,
                                "agent",
                                format!("[output truncated after {} lines]", max_lines),
                            )
                            .await
                        }
                        Admit::Drop => {}
                    }
                }
            }
        };

        tokio::pin!(forward);
        let mut drained = false;
        let status = loop {
            let next = tokio::select! {
                status = child.wait() => Waited::Exited(status),
                _ = &mut forward, if !drained => Waited::Drained,
                expiry = deadline.expired() => Waited::Expired(expiry),
            };
            match next {
                Waited::Exited(status) => break status.map_err(AgentError::Spawn)?,
                Waited::Drained => drained = true,
                Waited::Expired(expiry) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill agent process");
                    }
                    return Err(expiry.into());
                }
            }
        };

        if !drained && tokio::time::timeout(PIPE_DRAIN_GRACE, &mut forward).await.is_err() {
            tracing::warn!("agent exited with its output pipes still open; stopped reading");
            // Stops the reader tasks; the job deadline is a parent and unaffected.
            deadline.cancel();
        }

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(AgentError::Exit { code }),
            None => Err(AgentError::Exit { code: -1 }),
        }
    }
}
