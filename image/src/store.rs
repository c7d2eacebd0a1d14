//! Content-addressed image store.
//!
//! Each image is an OCI layout under `sha256/<id>/`, where `id` is the hex
//! digest of its config blob. An in-memory index of [`ImageRecord`]s is
//! backed by `images.json`.
//!
//! Every mutation is applied to a copy of the index, written to a temp file
//! and renamed over `images.json`, and only then published. A failed write
//! leaves both the file and the in-memory index untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stevedore_core::error::{ImageError, Result};
use tokio::sync::RwLock;

use crate::container::ContainerUsage;
use crate::layout::{copy_dir_recursive, dir_size, strip_algorithm, OciLayout};
use crate::model::{HistoryEntry, ImageRecord, ImageSummary};
use crate::reference::{normalize, ImageReference};

const INDEX_FILE: &str = "images.json";

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<ImageRecord>,
}

/// Disk-backed image store.
pub struct ImageStore {
    store_dir: PathBuf,
    index: Arc<RwLock<Vec<ImageRecord>>>,
    usage: Arc<dyn ContainerUsage>,
}

impl ImageStore {
    /// Open (or create) a store rooted at `store_dir`.
    pub fn new(store_dir: &Path, usage: Arc<dyn ContainerUsage>) -> Result<Self> {
        std::fs::create_dir_all(store_dir.join("sha256")).map_err(|e| {
            ImageError::StoreUnavailable(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let images = load_index(&store_dir.join(INDEX_FILE))?;
        tracing::debug!(
            store = %store_dir.display(),
            images = images.len(),
            "Opened image store"
        );

        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(images)),
            usage,
        })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Directory holding the layout of image `id`.
    pub fn layout_dir(&self, id: &str) -> PathBuf {
        self.store_dir.join("sha256").join(id)
    }

    /// Open the on-disk layout of a stored image.
    pub fn open_layout(&self, record: &ImageRecord) -> Result<OciLayout> {
        OciLayout::open(self.layout_dir(&record.id)).map_err(|e| {
            ImageError::StoreUnavailable(format!("Image {} layout unreadable: {}", record.id, e))
        })
    }

    /// Snapshot of every image with live container counts.
    pub async fn list(&self) -> Result<Vec<ImageSummary>> {
        let images = self.index.read().await.clone();
        images
            .iter()
            .map(|record| self.summarize(&images, record))
            .collect()
    }

    /// Resolve an ID, unique ID prefix, or name.
    pub async fn get(&self, name_or_id: &str) -> Result<ImageRecord> {
        let images = self.index.read().await;
        let pos = find(&images, name_or_id)?;
        Ok(images[pos].clone())
    }

    /// Listing view of one image.
    pub async fn summary(&self, name_or_id: &str) -> Result<ImageSummary> {
        let images = self.index.read().await.clone();
        let pos = find(&images, name_or_id)?;
        self.summarize(&images, &images[pos])
    }

    /// Whether `name_or_id` resolves. An ambiguous prefix is still an error.
    pub async fn exists(&self, name_or_id: &str) -> Result<bool> {
        match self.get(name_or_id).await {
            Ok(_) => Ok(true),
            Err(ImageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Add `name` to an image. Idempotent; the name moves off any other image.
    pub async fn tag(&self, name_or_id: &str, name: &str) -> Result<ImageRecord> {
        let name = normalize_tag(name)?;
        let mut index = self.index.write().await;
        let pos = find(&index, name_or_id)?;

        if index[pos].names.contains(&name) {
            return Ok(index[pos].clone());
        }

        let mut next = index.clone();
        for (i, record) in next.iter_mut().enumerate() {
            if i != pos {
                record.names.retain(|n| n != &name);
            }
        }
        next[pos].names.push(name.clone());

        self.commit(&mut index, next)?;
        tracing::info!(image = %index[pos].id, name = %name, "Tagged image");
        Ok(index[pos].clone())
    }

    /// Remove one name from an image, keeping the image itself.
    pub async fn untag(&self, name_or_id: &str, name: &str) -> Result<ImageRecord> {
        let name = normalize_tag(name)?;
        let mut index = self.index.write().await;
        let pos = find(&index, name_or_id)?;

        if !index[pos].names.contains(&name) {
            return Err(ImageError::NotFound(format!(
                "{} is not tagged {}",
                index[pos].short_id(),
                name
            )));
        }

        let mut next = index.clone();
        next[pos].names.retain(|n| n != &name);

        self.commit(&mut index, next)?;
        tracing::info!(image = %index[pos].id, name = %name, "Untagged image");
        Ok(index[pos].clone())
    }

    /// Delete an image and all of its names. Returns the removed ID.
    ///
    /// Without `force`, an image used by any container is left untouched and
    /// `InUse` is returned.
    pub async fn remove(&self, name_or_id: &str, force: bool) -> Result<String> {
        let mut index = self.index.write().await;
        let pos = find(&index, name_or_id)?;
        let id = index[pos].id.clone();

        let containers = self.usage.containers_using(&id)?;
        if !force && !containers.is_empty() {
            return Err(ImageError::InUse {
                image: id,
                containers: containers.len(),
            });
        }

        self.remove_locked(&mut index, &id)?;
        tracing::info!(image = %id, force, "Removed image");
        Ok(id)
    }

    /// Remove every image no container uses. Stops at the first failure and
    /// reports what was removed before it.
    pub async fn prune(&self) -> Result<Vec<String>> {
        let mut index = self.index.write().await;

        let mut candidates = Vec::new();
        for record in index.iter() {
            if self.usage.containers_using(&record.id)?.is_empty() {
                candidates.push(record.id.clone());
            }
        }

        let mut removed = Vec::new();
        for id in candidates {
            if let Err(source) = self.remove_locked(&mut index, &id) {
                tracing::warn!(
                    image = %id,
                    removed = removed.len(),
                    error = %source,
                    "Prune aborted"
                );
                return Err(ImageError::PruneAborted {
                    removed,
                    source: Box::new(source),
                });
            }
            removed.push(id);
        }

        tracing::info!(count = removed.len(), "Pruned images");
        Ok(removed)
    }

    /// Full description of an image, including its manifest and config.
    pub async fn inspect(&self, name_or_id: &str) -> Result<Value> {
        let summary = self.summary(name_or_id).await?;
        let record = self.get(&summary.id).await?;
        let layout = self.open_layout(&record)?;

        Ok(json!({
            "id": summary.id,
            "digest": summary.digest,
            "names": summary.repo_tags,
            "repo_digests": summary.repo_digests,
            "parent": summary.parent_id,
            "created": summary.created,
            "size": summary.size,
            "virtual_size": summary.virtual_size,
            "labels": summary.labels,
            "containers": summary.containers,
            "is_parent": summary.is_parent,
            "manifest_type": layout.manifest_media_type(),
            "manifest": layout.manifest(),
            "config": layout.config_json()?,
        }))
    }

    /// History entries in build order, oldest first.
    pub async fn history(&self, name_or_id: &str) -> Result<Vec<HistoryEntry>> {
        let record = self.get(name_or_id).await?;
        let layout = self.open_layout(&record)?;
        let config = layout.config()?;
        let mut layers = layout.layers().into_iter();

        let mut entries = Vec::new();
        for step in config.history() {
            let (id, size) = if step.empty_layer().unwrap_or(false) {
                ("<missing>".to_string(), 0)
            } else {
                match layers.next() {
                    Some(layer) => (layer.digest.clone(), layer.size),
                    None => ("<missing>".to_string(), 0),
                }
            };
            entries.push(HistoryEntry {
                id,
                created: step.created().as_deref().and_then(parse_time),
                created_by: step.created_by().clone().unwrap_or_default(),
                size,
                comment: step.comment().clone().unwrap_or_default(),
                tags: record.names.clone(),
            });
        }
        Ok(entries)
    }

    /// Copy a layout into the store and index it under `names`.
    ///
    /// Registering an ID that already exists merges the names into the
    /// existing entry.
    pub async fn register(
        &self,
        layout: &OciLayout,
        names: &[String],
        parent: Option<String>,
    ) -> Result<ImageRecord> {
        let names = names
            .iter()
            .map(|n| normalize_tag(n))
            .collect::<Result<Vec<_>>>()?;
        let id = layout.image_id()?;
        let config = layout.config_json()?;
        let target = self.layout_dir(&id);

        // Only the rename into place happens under the write lock.
        let mut staging = if target.exists() {
            None
        } else {
            Some(self.stage_layout(layout.root(), &id).await?)
        };

        let mut index = self.index.write().await;

        if staging.is_none() && !target.exists() {
            staging = Some(self.stage_layout(layout.root(), &id).await?);
        }
        let copied = match staging {
            Some(staging) if target.exists() => {
                let _ = std::fs::remove_dir_all(&staging);
                false
            }
            Some(staging) => {
                std::fs::rename(&staging, &target).map_err(|e| {
                    let _ = std::fs::remove_dir_all(&staging);
                    ImageError::StoreUnavailable(format!(
                        "Failed to move image {} into store: {}",
                        id, e
                    ))
                })?;
                true
            }
            None => false,
        };

        let stored = OciLayout::open(&target)?;
        let mut next = index.clone();
        for record in next.iter_mut().filter(|r| r.id != id) {
            record.names.retain(|n| !names.contains(n));
        }

        match next.iter_mut().find(|r| r.id == id) {
            Some(existing) => {
                for name in &names {
                    if !existing.names.contains(name) {
                        existing.names.push(name.clone());
                    }
                }
                if existing.parent.is_none() {
                    existing.parent = parent;
                }
            }
            None => {
                let mut unique: Vec<String> = Vec::new();
                for name in names {
                    if !unique.contains(&name) {
                        unique.push(name);
                    }
                }
                next.push(ImageRecord {
                    id: id.clone(),
                    parent,
                    names: unique,
                    digest: stored.manifest_digest().to_string(),
                    created: config["created"]
                        .as_str()
                        .and_then(parse_time)
                        .unwrap_or_else(Utc::now),
                    size: dir_size(&target),
                    virtual_size: stored.layers_size(),
                    labels: labels_from_config(&config),
                });
            }
        }

        if let Err(e) = self.commit(&mut index, next) {
            if copied {
                let _ = std::fs::remove_dir_all(&target);
            }
            return Err(e);
        }

        let record = index
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(id.clone()))?;
        tracing::info!(image = %id, names = ?record.names, "Registered image");
        Ok(record)
    }

    /// Copy a layout into a uniquely named staging directory next to its
    /// final location.
    async fn stage_layout(&self, source: &Path, id: &str) -> Result<PathBuf> {
        let staging = self
            .store_dir
            .join("sha256")
            .join(format!("{}.{}.tmp", id, uuid::Uuid::new_v4().simple()));
        let (src, dst) = (source.to_path_buf(), staging.clone());
        let copied = tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        match copied {
            Ok(()) => Ok(staging),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                Err(ImageError::StoreUnavailable(format!(
                    "Failed to copy image {} into store: {}",
                    id, e
                )))
            }
        }
    }

    fn summarize(&self, images: &[ImageRecord], record: &ImageRecord) -> Result<ImageSummary> {
        let containers = self.usage.containers_using(&record.id)?.len();
        let is_parent = images
            .iter()
            .any(|r| r.parent.as_deref() == Some(record.id.as_str()));
        Ok(ImageSummary::from_record(record, containers, is_parent))
    }

    /// Drop `id` from the index (caller holds the write lock), then delete
    /// its layout directory.
    fn remove_locked(&self, index: &mut Vec<ImageRecord>, id: &str) -> Result<()> {
        let next: Vec<ImageRecord> = index.iter().filter(|r| r.id != id).cloned().collect();
        self.commit(index, next)?;

        let dir = self.layout_dir(id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(image = id, error = %e, "Failed to delete image layout");
            }
        }
        Ok(())
    }

    /// Persist `next` and publish it.
    fn commit(&self, index: &mut Vec<ImageRecord>, next: Vec<ImageRecord>) -> Result<()> {
        let store_index = StoreIndex { images: next };
        let data = serde_json::to_string_pretty(&store_index)?;
        let index_path = self.store_dir.join(INDEX_FILE);
        let tmp_path = self.store_dir.join(format!("{}.tmp", INDEX_FILE));

        std::fs::write(&tmp_path, data)
            .and_then(|_| std::fs::rename(&tmp_path, &index_path))
            .map_err(|e| {
                let _ = std::fs::remove_file(&tmp_path);
                ImageError::StoreUnavailable(format!(
                    "Failed to write image store index {}: {}",
                    index_path.display(),
                    e
                ))
            })?;

        *index = store_index.images;
        Ok(())
    }
}

fn load_index(path: &Path) -> Result<Vec<ImageRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path).map_err(|e| {
        ImageError::StoreUnavailable(format!(
            "Failed to read image store index {}: {}",
            path.display(),
            e
        ))
    })?;
    let index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
        ImageError::StoreUnavailable(format!("Failed to parse image store index: {}", e))
    })?;
    Ok(index.images)
}

/// Locate an image: exact ID, then name (raw or normalized), then unique
/// ID prefix.
fn find(images: &[ImageRecord], query: &str) -> Result<usize> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ImageError::InvalidArgument("Empty image name".to_string()));
    }
    let bare = strip_algorithm(query);

    if let Some(pos) = images.iter().position(|r| r.id == bare) {
        return Ok(pos);
    }

    let normalized = normalize(query);
    if let Some(pos) = images.iter().position(|r| {
        r.names
            .iter()
            .any(|n| n == query || Some(n) == normalized.as_ref())
    }) {
        return Ok(pos);
    }

    if bare.chars().all(|c| c.is_ascii_hexdigit()) {
        let matches: Vec<usize> = images
            .iter()
            .enumerate()
            .filter(|(_, r)| r.id.starts_with(bare))
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => {}
            1 => return Ok(matches[0]),
            n => {
                return Err(ImageError::InvalidArgument(format!(
                    "Image ID prefix '{}' is ambiguous ({} matches)",
                    query, n
                )))
            }
        }
    }

    Err(ImageError::NotFound(query.to_string()))
}

fn normalize_tag(name: &str) -> Result<String> {
    let reference = ImageReference::parse(name)?;
    if reference.digest.is_some() {
        return Err(ImageError::InvalidArgument(format!(
            "Cannot use digest reference '{}' as a tag",
            name
        )));
    }
    Ok(reference.full_reference())
}

fn labels_from_config(config: &Value) -> std::collections::HashMap<String, String> {
    config["config"]["Labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
