//! Import a filesystem tarball as a single-layer image.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use stevedore_core::config::ImageFormat;
use stevedore_core::error::{ImageError, Result};

use crate::archive::is_gzip;
use crate::changes::apply_changes;
use crate::layout::{compute_diff_id, LayoutBuilder};
use crate::model::ImageRecord;
use crate::store::ImageStore;

/// Imports tarballs into the store.
pub struct Importer {
    store: Arc<ImageStore>,
    format: ImageFormat,
}

impl Importer {
    pub fn new(store: Arc<ImageStore>, format: ImageFormat) -> Self {
        Self { store, format }
    }

    /// Import `source` (a path or an http(s) URL). The image config gets the
    /// change directives and exactly one history entry carrying `message`.
    pub async fn import(
        &self,
        source: &str,
        reference: &str,
        message: &str,
        changes: &[String],
    ) -> Result<ImageRecord> {
        let mut config = json!({
            "architecture": host_architecture(),
            "os": "linux",
            "created": Utc::now().to_rfc3339(),
            "config": {},
        });
        apply_changes(&mut config, changes)?;

        let work = tempfile::tempdir()?;
        let tarball = if is_url(source) {
            download(source, &work.path().join("download")).await?
        } else {
            let path = PathBuf::from(source);
            if !path.is_file() {
                return Err(ImageError::NotFound(format!(
                    "Import source {} does not exist",
                    source
                )));
            }
            path
        };

        tracing::info!(source, reference, "Importing tarball");

        let layer = gzipped(&tarball, &work.path().join("layer.tar.gz"))?;
        let diff_id = compute_diff_id(&layer)?;
        config["rootfs"] = json!({ "type": "layers", "diff_ids": [diff_id] });
        config["history"] = json!([history_entry(&config, message)]);

        let mut builder = LayoutBuilder::create(work.path().join("layout"))?;
        builder.add_layer_file(&layer, self.format.layer_media_type())?;
        let layout = builder.finish(&config, self.format, &[])?;

        let names: Vec<String> = if reference.is_empty() {
            Vec::new()
        } else {
            vec![reference.to_string()]
        };
        let record = self.store.register(&layout, &names, None).await?;
        tracing::info!(image = %record.id, "Imported image");
        Ok(record)
    }
}

fn history_entry(config: &Value, message: &str) -> Value {
    json!({
        "created": config["created"],
        "comment": message,
    })
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Stream a URL to `dest`.
pub(crate) async fn download(url: &str, dest: &Path) -> Result<PathBuf> {
    let host = url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(url)
        .to_string();

    let response = reqwest::get(url)
        .await
        .map_err(|e| ImageError::network(&host, e.to_string()))?;
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ImageError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        return Err(ImageError::network(
            &host,
            format!("download returned {}", status),
        ));
    }

    let mut file = std::fs::File::create(dest)?;
    let mut stream = response.bytes_stream();
    let mut total = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ImageError::network(&host, e.to_string()))?;
        total += chunk.len();
        file.write_all(&chunk)?;
    }
    file.flush()?;
    tracing::debug!(url, bytes = total, "Downloaded import source");
    Ok(dest.to_path_buf())
}

/// The tarball itself when already gzip-compressed, otherwise a compressed
/// copy at `out`.
fn gzipped(tarball: &Path, out: &Path) -> Result<PathBuf> {
    if is_gzip(tarball)? {
        return Ok(tarball.to_path_buf());
    }
    let mut input = std::fs::File::open(tarball)?;
    let mut encoder =
        flate2::write::GzEncoder::new(std::fs::File::create(out)?, flate2::Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(out.to_path_buf())
}

pub(crate) fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
