//! Background builds with streamed logs.
//!
//! [`BuildOrchestrator::start`] validates the request and spawns the backend
//! on a tokio task. The task writes log lines into an unbounded channel and,
//! once the backend returns, publishes exactly one outcome on a oneshot. The
//! log sender is dropped before the outcome is sent, so a reader that sees
//! the outcome can drain every remaining line without waiting.

use std::sync::Arc;

use stevedore_core::error::{ImageError, Result};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::log::BuildLog;
use super::{BuildBackend, BuildDefaults, BuildRequest};
use crate::store::ImageStore;

/// Starts builds against a backend.
pub struct BuildOrchestrator {
    store: Arc<ImageStore>,
    backend: Arc<dyn BuildBackend>,
    defaults: BuildDefaults,
}

/// Progress of a running build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// Lines written since the previous event.
    Logs(Vec<String>),
    /// The build succeeded: the lines not yet delivered and the image ID.
    Finished { logs: Vec<String>, image_id: String },
}

/// Reader side of a started build.
///
/// Dropping the handle does not stop the build.
pub struct BuildHandle {
    build_id: String,
    store: Arc<ImageStore>,
    tags: Vec<String>,
    logs: mpsc::UnboundedReceiver<String>,
    done: oneshot::Receiver<Result<String>>,
    cancel: CancellationToken,
    finished: bool,
}

enum Next {
    Line(String),
    Outcome(std::result::Result<Result<String>, oneshot::error::RecvError>),
}

impl BuildOrchestrator {
    pub fn new(
        store: Arc<ImageStore>,
        backend: Arc<dyn BuildBackend>,
        defaults: BuildDefaults,
    ) -> Self {
        Self {
            store,
            backend,
            defaults,
        }
    }

    /// Validate `request` and start building it in the background.
    ///
    /// Validation failures are returned here, before any task exists.
    pub fn start(&self, request: &BuildRequest) -> Result<BuildHandle> {
        let plan = request.validate(self.defaults)?;
        let build_id = uuid::Uuid::new_v4().to_string();
        let tags = plan.tags.clone();

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let backend = self.backend.clone();
        let task_cancel = cancel.clone();
        let span = tracing::info_span!("build", id = %build_id);
        tokio::spawn(
            async move {
                tracing::info!(tags = ?plan.tags, format = ?plan.format, "Build started");
                let mut log = BuildLog::new(log_tx);
                let outcome = backend.build(&plan, &mut log, task_cancel).await;
                drop(log);

                match &outcome {
                    Ok(image_id) => tracing::info!(image = %image_id, "Build finished"),
                    Err(e) => tracing::warn!(error = %e, "Build failed"),
                }
                let _ = done_tx.send(outcome);
            }
            .instrument(span),
        );

        Ok(BuildHandle {
            build_id,
            store: self.store.clone(),
            tags,
            logs: log_rx,
            done: done_rx,
            cancel,
            finished: false,
        })
    }
}

impl BuildHandle {
    pub fn id(&self) -> &str {
        &self.build_id
    }

    /// Ask the backend to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the next batch of lines or the outcome. `None` once the
    /// outcome has been returned.
    pub async fn next(&mut self) -> Option<Result<BuildEvent>> {
        if self.finished {
            return None;
        }

        let next = tokio::select! {
            biased;
            Some(line) = self.logs.recv() => Next::Line(line),
            outcome = &mut self.done => Next::Outcome(outcome),
        };

        match next {
            Next::Line(line) => {
                let mut batch = vec![line];
                batch.extend(self.drain());
                Some(Ok(BuildEvent::Logs(batch)))
            }
            Next::Outcome(outcome) => {
                self.finished = true;
                Some(self.complete(outcome).await)
            }
        }
    }

    /// Run to completion, returning every log line and the image ID.
    pub async fn wait(mut self) -> Result<(Vec<String>, String)> {
        let mut all = Vec::new();
        while let Some(event) = self.next().await {
            match event? {
                BuildEvent::Logs(lines) => all.extend(lines),
                BuildEvent::Finished { logs, image_id } => {
                    all.extend(logs);
                    return Ok((all, image_id));
                }
            }
        }
        Err(ImageError::Build("build produced no result".to_string()))
    }

    fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.logs.try_recv() {
            lines.push(line);
        }
        lines
    }

    async fn complete(
        &mut self,
        outcome: std::result::Result<Result<String>, oneshot::error::RecvError>,
    ) -> Result<BuildEvent> {
        let built = match outcome {
            Ok(result) => result?,
            Err(_) => {
                return Err(ImageError::Build(
                    "build task ended without reporting a result".to_string(),
                ))
            }
        };
        let logs = self.drain();
        let lookup = self.tags.first().cloned().unwrap_or(built);
        let record = self.store.get(&lookup).await?;
        Ok(BuildEvent::Finished {
            logs,
            image_id: record.id,
        })
    }
}
