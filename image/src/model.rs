//! Image records as kept in the store index and as reported to callers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted metadata for one stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Hex sha256 of the config blob
    pub id: String,
    /// Image this one was built or committed from
    #[serde(default)]
    pub parent: Option<String>,
    /// Normalized tag names, deduplicated
    #[serde(default)]
    pub names: Vec<String>,
    /// Manifest digest
    pub digest: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub virtual_size: Option<u64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ImageRecord {
    /// `<repository>@<digest>` for each name.
    pub fn repo_digests(&self) -> Vec<String> {
        let mut digests: Vec<String> = Vec::new();
        for name in &self.names {
            let repository = match crate::reference::ImageReference::parse(name) {
                Ok(r) => r.repository_path(),
                Err(_) => continue,
            };
            let entry = format!("{}@{}", repository, self.digest);
            if !digests.contains(&entry) {
                digests.push(entry);
            }
        }
        digests
    }

    /// First twelve characters of the ID.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Listing view of an image, with live-computed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub parent_id: Option<String>,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub digest: String,
    pub created: DateTime<Utc>,
    pub size: Option<u64>,
    pub virtual_size: Option<u64>,
    pub containers: usize,
    pub labels: HashMap<String, String>,
    pub is_parent: bool,
}

impl ImageSummary {
    pub fn from_record(record: &ImageRecord, containers: usize, is_parent: bool) -> Self {
        Self {
            id: record.id.clone(),
            parent_id: record.parent.clone(),
            repo_tags: record.names.clone(),
            repo_digests: record.repo_digests(),
            digest: record.digest.clone(),
            created: record.created,
            size: record.size,
            virtual_size: record.virtual_size,
            containers,
            labels: record.labels.clone(),
            is_parent,
        }
    }
}

/// One step of an image's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Layer digest, or `<missing>` for steps without a layer of their own
    pub id: String,
    pub created: Option<DateTime<Utc>>,
    pub created_by: String,
    /// Size of the layer this step produced
    pub size: u64,
    pub comment: String,
    /// The image's current names
    pub tags: Vec<String>,
}
