use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;

use super::AgentBackend;
use crate::deadline::Deadline;
use crate::errors::AgentError;
use crate::sink::OutputSink;
use repobox_common::OutputStream;

/// File the mock agent writes into the work directory.
pub const MOCK_ARTIFACT: &str = "REPOBOX_MOCK.md";

/// Stand-in used when no agent is configured. Writes a five-line artifact
/// so the rest of the pipeline has a real change to commit and push.
pub struct MockAgent;

pub(crate) fn render_artifact(prompt: &str, environment: &str) -> String {
    let prompt = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "# Repobox mock run\n\nPrompt: {}\nEnvironment: {}\nGenerated: {}\n",
        prompt,
        environment,
        Utc::now().to_rfc3339()
    )
}

#[async_trait]
impl AgentBackend for MockAgent {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(
        &self,
        work_dir: &Path,
        prompt: &str,
        environment: &str,
        sink: &OutputSink,
        deadline: &Deadline,
    ) -> Result<(), AgentError> {
        if let Some(expiry) = deadline.check() {
            return Err(expiry.into());
        }

        sink.emit(OutputStream::Stdout, "agent", "Mock agent: no live agent configured")
            .await;
        sink.emit(
            OutputStream::Stdout,
            "agent",
            format!("Mock agent: environment '{}'", environment),
        )
        .await;

        let path = work_dir.join(MOCK_ARTIFACT);
        tokio::fs::write(&path, render_artifact(prompt, environment))
            .await
            .map_err(|source| AgentError::Artifact {
                path: path.clone(),
                source,
            })?;

        sink.emit(
            OutputStream::Stdout,
            "agent",
            format!("Mock agent: wrote {}", MOCK_ARTIFACT),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_has_five_lines() {
        let body = render_artifact("add a\nREADME", "node");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "# Repobox mock run");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "Prompt: add a README");
        assert_eq!(lines[3], "Environment: node");
        assert!(lines[4].starts_with("Generated: "));
    }

    #[tokio::test]
    async fn test_mock_writes_artifact_and_output() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (sink, writer) = OutputSink::spawn(store.clone(), "j1");

        MockAgent
            .execute(
                dir.path(),
                "fix typo",
                "default",
                &sink,
                &Deadline::after(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        drop(sink);
        writer.finish().await;

        let body = std::fs::read_to_string(dir.path().join(MOCK_ARTIFACT)).unwrap();
        assert!(body.contains("Prompt: fix typo"));
        assert_eq!(store.output("j1").len(), 3);
    }

    #[tokio::test]
    async fn test_mock_honours_cancelled_deadline() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (sink, _writer) = OutputSink::spawn(store, "j1");
        let deadline = Deadline::after(Duration::from_secs(5));
        deadline.cancel();

        let err = MockAgent
            .execute(dir.path(), "p", "default", &sink, &deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(!dir.path().join(MOCK_ARTIFACT).exists());
    }
}
