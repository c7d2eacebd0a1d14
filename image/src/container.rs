//! Container runtime collaborator.
//!
//! The image engine needs three things from containers: which ones use an
//! image, pausing/resuming one, and capturing its filesystem diff. The
//! default implementation reads a JSON state file of container records and
//! signals their processes directly.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stevedore_core::error::{ImageError, Result};

use crate::layout::tar_gz_dir;

/// A container as seen by the image engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    /// ID of the image the container was created from
    pub image_id: String,
    /// Writable layer directory; its contents are the container's diff
    pub rootfs: PathBuf,
    /// Main process PID, when running
    #[serde(default)]
    pub pid: Option<u32>,
    /// "created" | "running" | "paused" | "stopped"
    pub status: String,
}

/// Answers which containers reference an image.
pub trait ContainerUsage: Send + Sync {
    /// IDs of containers created from `image_id`.
    fn containers_using(&self, image_id: &str) -> Result<Vec<String>>;
}

/// Container operations used by commit.
#[async_trait]
pub trait ContainerRuntime: ContainerUsage {
    /// Resolve a container by name, ID, or unique ID prefix.
    async fn lookup(&self, name_or_id: &str) -> Result<ContainerRecord>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn unpause(&self, id: &str) -> Result<()>;

    /// Write the container's filesystem diff to `output` as a gzip tarball.
    async fn export_diff(&self, id: &str, output: &Path) -> Result<()>;
}

/// Containers described by a JSON state file.
pub struct StateFileContainers {
    path: PathBuf,
}

impl StateFileContainers {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Vec<ContainerRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            ImageError::StoreUnavailable(format!(
                "Failed to read container state {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    fn save(&self, records: &[ContainerRecord]) -> Result<()> {
        let data = serde_json::to_string_pretty(records)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn resolve(records: &[ContainerRecord], query: &str) -> Result<ContainerRecord> {
        if let Some(r) = records.iter().find(|r| r.name == query || r.id == query) {
            return Ok(r.clone());
        }
        let matches: Vec<&ContainerRecord> =
            records.iter().filter(|r| r.id.starts_with(query)).collect();
        match matches.len() {
            0 => Err(ImageError::ContainerNotFound(query.to_string())),
            1 => Ok(matches[0].clone()),
            n => Err(ImageError::InvalidArgument(format!(
                "Container ID prefix '{}' is ambiguous ({} matches)",
                query, n
            ))),
        }
    }

    fn signal(&self, id: &str, signal: libc::c_int, status: &str) -> Result<()> {
        let mut records = self.load()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ImageError::ContainerNotFound(id.to_string()))?;

        if let Some(pid) = record.pid {
            // Safety: plain signal delivery to a PID we recorded
            let rc = unsafe { libc::kill(pid as i32, signal) };
            if rc != 0 {
                return Err(ImageError::Other(format!(
                    "Failed to signal container {} (pid {}): {}",
                    id,
                    pid,
                    std::io::Error::last_os_error()
                )));
            }
        }
        record.status = status.to_string();
        self.save(&records)
    }
}

impl ContainerUsage for StateFileContainers {
    fn containers_using(&self, image_id: &str) -> Result<Vec<String>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.image_id == image_id)
            .map(|r| r.id)
            .collect())
    }
}

#[async_trait]
impl ContainerRuntime for StateFileContainers {
    async fn lookup(&self, name_or_id: &str) -> Result<ContainerRecord> {
        let records = self.load()?;
        Self::resolve(&records, name_or_id)
    }

    async fn pause(&self, id: &str) -> Result<()> {
        tracing::debug!(container = id, "Pausing container");
        self.signal(id, libc::SIGSTOP, "paused")
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        tracing::debug!(container = id, "Resuming container");
        self.signal(id, libc::SIGCONT, "running")
    }

    async fn export_diff(&self, id: &str, output: &Path) -> Result<()> {
        let records = self.load()?;
        let record = Self::resolve(&records, id)?;
        if !record.rootfs.is_dir() {
            return Err(ImageError::StoreUnavailable(format!(
                "Container {} has no filesystem at {}",
                id,
                record.rootfs.display()
            )));
        }
        let rootfs = record.rootfs.clone();
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || tar_gz_dir(&rootfs, &output))
            .await
            .map_err(|e| ImageError::Other(format!("Diff capture task failed: {}", e)))?
    }
}
