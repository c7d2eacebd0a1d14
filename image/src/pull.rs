//! Pull orchestration across transports.
//!
//! Registry references go through the [`RegistryClient`]; archive and layout
//! transports are read locally and never touch the network.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stevedore_core::config::PullPolicy;
use stevedore_core::error::{ImageError, Result};

use crate::archive;
use crate::layout::OciLayout;
use crate::model::ImageRecord;
use crate::reference::ImageReference;
use crate::registry::{RegistryClient, RegistryOptions};
use crate::store::ImageStore;
use crate::transport::Transport;

/// Pulls images into the store.
pub struct ImagePuller {
    store: Arc<ImageStore>,
    registry: Arc<dyn RegistryClient>,
}

impl ImagePuller {
    pub fn new(store: Arc<ImageStore>, registry: Arc<dyn RegistryClient>) -> Self {
        Self { store, registry }
    }

    /// Fetch `name` through its transport and register it. Returns the
    /// stored image.
    pub async fn pull(&self, name: &str, opts: &RegistryOptions) -> Result<ImageRecord> {
        let transport = Transport::resolve(name);
        tracing::info!(name, transport = transport.name(), "Pulling image");

        let work = tempfile::tempdir_in(self.work_root()?)?;
        let record = match transport {
            Transport::Registry(reference) => {
                let reference = ImageReference::parse(&reference)?;
                let layout = self
                    .registry
                    .pull(&reference, &work.path().join("layout"), opts)
                    .await?;
                let names = if reference.digest.is_some() {
                    Vec::new()
                } else {
                    vec![reference.full_reference()]
                };
                self.store.register(&layout, &names, None).await?
            }
            Transport::DockerArchive(path) | Transport::OciArchive(path) => {
                let loaded = archive::load(&path, work.path())?;
                let names = valid_names(&loaded.names);
                self.store.register(&loaded.layout, &names, None).await?
            }
            Transport::OciLayout(path) => {
                let (dir, reference) = split_layout_reference(&path);
                let layout = OciLayout::open(&dir)?;
                let names = match reference {
                    Some(name) => vec![name],
                    None => valid_names(layout.ref_names()),
                };
                self.store.register(&layout, &names, None).await?
            }
        };

        tracing::info!(name, image = %record.id, "Image pulled");
        Ok(record)
    }

    /// Resolve `name` locally or pull it, according to `policy`.
    pub async fn ensure(
        &self,
        name: &str,
        policy: PullPolicy,
        opts: &RegistryOptions,
    ) -> Result<ImageRecord> {
        match policy {
            PullPolicy::Always => self.pull(name, opts).await,
            PullPolicy::IfMissing => match self.store.get(name).await {
                Ok(record) => Ok(record),
                Err(ImageError::NotFound(_)) => self.pull(name, opts).await,
                Err(e) => Err(e),
            },
            PullPolicy::Never => self.store.get(name).await,
        }
    }

    fn work_root(&self) -> Result<PathBuf> {
        let dir = self.store.store_dir().join("tmp");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Names from an archive that parse as references; others are dropped.
fn valid_names(names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|n| match ImageReference::parse(n) {
            Ok(r) => r.digest.is_none(),
            Err(_) => {
                tracing::debug!(name = %n, "Ignoring unparseable archive tag");
                false
            }
        })
        .cloned()
        .collect()
}

/// `oci:` paths may end in `:<reference>` naming the image to load.
fn split_layout_reference(path: &Path) -> (PathBuf, Option<String>) {
    if path.exists() {
        return (path.to_path_buf(), None);
    }
    let raw = path.to_string_lossy();
    match raw.rsplit_once(':') {
        Some((dir, reference)) if !reference.is_empty() && !reference.contains('/') => {
            (PathBuf::from(dir), Some(reference.to_string()))
        }
        _ => (path.to_path_buf(), None),
    }
}
