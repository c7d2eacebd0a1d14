//! Create an image from a container's filesystem changes.
//!
//! The new image is the container's base image plus one layer holding the
//! container's diff. With `pause`, the container is stopped for the capture
//! and resumed afterwards no matter how the capture ends.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use stevedore_core::config::ImageFormat;
use stevedore_core::error::{ImageError, Result};

use crate::changes::apply_changes;
use crate::container::ContainerRuntime;
use crate::layout::{compute_diff_id, LayoutBuilder};
use crate::model::ImageRecord;
use crate::store::ImageStore;

/// Parameters of a commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub container: String,
    /// Name for the new image; may be empty
    pub image_name: String,
    pub changes: Vec<String>,
    pub author: String,
    pub message: String,
    pub pause: bool,
    /// "", "oci" or "docker"
    pub format: String,
}

/// Commits containers to images.
pub struct CommitEngine {
    store: Arc<ImageStore>,
    runtime: Arc<dyn ContainerRuntime>,
    default_format: ImageFormat,
}

impl CommitEngine {
    pub fn new(
        store: Arc<ImageStore>,
        runtime: Arc<dyn ContainerRuntime>,
        default_format: ImageFormat,
    ) -> Self {
        Self {
            store,
            runtime,
            default_format,
        }
    }

    pub async fn commit(&self, opts: &CommitOptions) -> Result<ImageRecord> {
        let format = commit_format(&opts.format, self.default_format)?;
        let container = self.runtime.lookup(&opts.container).await?;
        let base = self.store.get(&container.image_id).await?;
        let base_layout = self.store.open_layout(&base)?;

        tracing::info!(
            container = %container.id,
            base = %base.short_id(),
            pause = opts.pause,
            "Committing container"
        );

        let work = tempfile::tempdir()?;
        let diff_path = work.path().join("diff.tar.gz");

        // The capture runs as its own task so that dropping this future
        // cannot leave the container stopped.
        let capture = tokio::spawn(capture_diff(
            self.runtime.clone(),
            container.id.clone(),
            diff_path.clone(),
            opts.pause,
        ));
        match capture.await {
            Ok(result) => result?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                return Err(ImageError::Other(format!(
                    "diff capture for {} did not finish: {}",
                    container.id, e
                )))
            }
        }

        let mut config = base_layout.config_json()?;
        let now = Utc::now().to_rfc3339();
        let diff_id = compute_diff_id(&diff_path)?;

        if !config["rootfs"]["diff_ids"].is_array() {
            config["rootfs"] = json!({ "type": "layers", "diff_ids": [] });
        }
        if let Some(ids) = config["rootfs"]["diff_ids"].as_array_mut() {
            ids.push(json!(diff_id));
        }
        let mut step = json!({
            "created": now,
            "created_by": format!("commit {}", container.name),
            "comment": opts.message,
        });
        if !opts.author.is_empty() {
            step["author"] = json!(opts.author);
            config["author"] = json!(opts.author);
        }
        match config["history"].as_array_mut() {
            Some(history) => history.push(step),
            None => config["history"] = json!([step]),
        }
        config["created"] = json!(now);
        apply_changes(&mut config, &opts.changes)?;

        let mut builder = LayoutBuilder::create(work.path().join("layout"))?;
        builder.add_layers_from(&base_layout, format)?;
        builder.add_layer_file(&diff_path, format.layer_media_type())?;
        let layout = builder.finish(&config, format, &[])?;

        let names: Vec<String> = if opts.image_name.is_empty() {
            Vec::new()
        } else {
            vec![opts.image_name.clone()]
        };
        let record = self
            .store
            .register(&layout, &names, Some(base.id.clone()))
            .await?;

        tracing::info!(container = %container.id, image = %record.id, "Committed container");
        Ok(record)
    }
}

/// Pause (optionally), export the diff, and resume even when the export
/// fails or panics.
async fn capture_diff(
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    diff_path: PathBuf,
    pause: bool,
) -> Result<()> {
    if pause {
        runtime.pause(&id).await?;
    }
    let captured = AssertUnwindSafe(runtime.export_diff(&id, &diff_path))
        .catch_unwind()
        .await;
    if pause {
        if let Err(e) = runtime.unpause(&id).await {
            tracing::warn!(container = %id, error = %e, "Failed to resume container");
            if matches!(captured, Ok(Ok(()))) {
                return Err(e);
            }
        }
    }
    match captured {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Commit accepts exactly "", "oci" and "docker".
fn commit_format(token: &str, default: ImageFormat) -> Result<ImageFormat> {
    match token {
        "" => Ok(default),
        "oci" => Ok(ImageFormat::Oci),
        "docker" => Ok(ImageFormat::Docker),
        other => Err(ImageError::InvalidArgument(format!(
            "unrecognized image format \"{}\"",
            other
        ))),
    }
}
