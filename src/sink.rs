use std::sync::Arc;

use repobox_common::{OutputLine, OutputStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::JobStore;

/// Lines buffered between producers and the writer task.
pub const SINK_CAPACITY: usize = 1024;
/// Max lines per store append.
const BATCH_SIZE: usize = 50;

/// Producer side of a job's output stream. Cheap to clone; the writer task
/// finishes once every clone has been dropped.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<OutputLine>,
}

/// Handle to the batching writer behind an [`OutputSink`].
pub struct SinkWriter {
    job_id: String,
    handle: JoinHandle<usize>,
}

impl OutputSink {
    pub fn spawn(store: Arc<dyn JobStore>, job_id: &str) -> (Self, SinkWriter) {
        let (tx, mut rx) = mpsc::channel::<OutputLine>(SINK_CAPACITY);
        let id = job_id.to_string();
        let handle = tokio::spawn(async move {
            let mut written = 0usize;
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            while let Some(line) = rx.recv().await {
                batch.push(line);
                while batch.len() < BATCH_SIZE {
                    match rx.try_recv() {
                        Ok(line) => batch.push(line),
                        Err(_) => break,
                    }
                }
                match store.append_output(&id, &batch).await {
                    Ok(()) => written += batch.len(),
                    Err(e) => {
                        tracing::warn!(job_id = %id, lines = batch.len(), error = %e, "dropping output batch");
                    }
                }
                batch.clear();
            }
            written
        });
        (
            Self { tx },
            SinkWriter {
                job_id: job_id.to_string(),
                handle,
            },
        )
    }

    /// Queue a line, waiting for room if the writer is behind.
    pub async fn emit(&self, stream: OutputStream, source: &str, line: impl Into<String>) {
        let line = OutputLine::new(stream, source, line);
        if self.tx.send(line).await.is_err() {
            tracing::debug!("output sink closed; line discarded");
        }
    }

    /// Progress line from the runner itself.
    pub async fn system(&self, line: impl Into<String>) {
        self.emit(OutputStream::System, "runner", line).await;
    }
}

impl SinkWriter {
    /// Wait for every queued line to be written. Returns the number of lines
    /// the store accepted.
    pub async fn finish(self) -> usize {
        match self.handle.await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "output writer task failed");
                0
            }
        }
    }
}
