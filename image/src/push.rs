//! Push and export: write a stored image to a registry, an archive or an
//! OCI layout directory.

use std::path::Path;
use std::sync::Arc;

use stevedore_core::config::ImageFormat;
use stevedore_core::error::{ImageError, Result};

use crate::archive::{self, ArchiveKind};
use crate::layout::{LayoutBuilder, OciLayout};
use crate::model::ImageRecord;
use crate::reference::ImageReference;
use crate::registry::{RegistryClient, RegistryOptions, SigningOptions};
use crate::store::ImageStore;
use crate::transport::Transport;

/// Manifest format requested for a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Oci,
    /// Docker image manifest v2, schema 2
    V2s2,
    /// Docker image manifest v2, schema 1
    V2s1,
}

impl ManifestFormat {
    /// `None` for an empty token, meaning "keep the configured default".
    pub fn parse(token: &str) -> Result<Option<Self>> {
        match token {
            "" => Ok(None),
            "oci" => Ok(Some(ManifestFormat::Oci)),
            "v2s2" | "docker" => Ok(Some(ManifestFormat::V2s2)),
            "v2s1" => Ok(Some(ManifestFormat::V2s1)),
            other => Err(ImageError::InvalidArgument(format!(
                "unknown format {:?}: must be oci, v2s2 or v2s1",
                other
            ))),
        }
    }

    /// Image format this manifest type is produced from.
    pub fn image_format(self) -> Result<ImageFormat> {
        match self {
            ManifestFormat::Oci => Ok(ImageFormat::Oci),
            ManifestFormat::V2s2 => Ok(ImageFormat::Docker),
            ManifestFormat::V2s1 => Err(ImageError::NotImplemented(
                "Docker schema 1 manifests".to_string(),
            )),
        }
    }
}

/// Parameters of a push.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Explicit destination; wins over the image name when non-empty
    pub tag: String,
    /// Manifest format token
    pub format: String,
    pub compress: bool,
    pub registry: RegistryOptions,
    pub signing: SigningOptions,
}

/// Writes stored images to their destinations.
pub struct ImagePusher {
    store: Arc<ImageStore>,
    registry: Arc<dyn RegistryClient>,
}

impl ImagePusher {
    pub fn new(store: Arc<ImageStore>, registry: Arc<dyn RegistryClient>) -> Self {
        Self { store, registry }
    }

    /// Push `name` to its destination.
    pub async fn push(&self, name: &str, opts: &PushOptions) -> Result<ImageRecord> {
        let format = match ManifestFormat::parse(&opts.format)? {
            Some(manifest) => Some(manifest.image_format()?),
            None => None,
        };
        let record = self.store.get(name).await?;
        let layout = self.store.open_layout(&record)?;
        let destination = Transport::push_destination(name, &opts.tag);

        tracing::info!(
            image = %record.short_id(),
            transport = destination.name(),
            "Pushing image"
        );

        match destination {
            Transport::Registry(target) => {
                let reference = ImageReference::parse(&target)?;
                let format = format.unwrap_or_else(|| layout_format(&layout));
                let digest = self
                    .registry
                    .push(&layout, &reference, format, &opts.registry, &opts.signing)
                    .await?;
                tracing::info!(reference = %reference, digest = %digest, "Pushed image");
            }
            local => {
                let work = tempfile::tempdir()?;
                let layout = match format {
                    Some(f) if f != layout_format(&layout) => {
                        convert_layout(&layout, f, &work.path().join("converted"))?
                    }
                    _ => layout,
                };
                write_local(&layout, local, &record.names, opts.compress)?;
            }
        }
        Ok(record)
    }

    /// Export `name` to `destination` (which must carry its transport for
    /// anything but a registry). `tags` are recorded in archives and
    /// layouts; registry pushes ignore them.
    pub async fn export(
        &self,
        name: &str,
        destination: &str,
        compress: bool,
        tags: &[String],
    ) -> Result<ImageRecord> {
        let additional = tags
            .iter()
            .map(|t| ImageReference::parse(t).map(|r| r.full_reference()))
            .collect::<Result<Vec<_>>>()?;
        let record = self.store.get(name).await?;
        let layout = self.store.open_layout(&record)?;

        let mut names = record.names.clone();
        for tag in additional {
            if !names.contains(&tag) {
                names.push(tag);
            }
        }

        match Transport::resolve(destination) {
            Transport::Registry(target) => {
                if !tags.is_empty() {
                    tracing::debug!(count = tags.len(), "Additional tags ignored for registry export");
                }
                let reference = ImageReference::parse(&target)?;
                self.registry
                    .push(
                        &layout,
                        &reference,
                        layout_format(&layout),
                        &RegistryOptions::default(),
                        &SigningOptions::default(),
                    )
                    .await?;
            }
            local => write_local(&layout, local, &names, compress)?,
        }

        tracing::info!(image = %record.short_id(), destination, "Exported image");
        Ok(record)
    }
}

fn write_local(layout: &OciLayout, destination: Transport, names: &[String], compress: bool) -> Result<()> {
    match destination {
        Transport::DockerArchive(path) => {
            archive::save(layout, &path, ArchiveKind::Docker, names, compress)
        }
        Transport::OciArchive(path) => archive::save(layout, &path, ArchiveKind::Oci, names, compress),
        Transport::OciLayout(path) => archive::save_dir(layout, &path, names).map(|_| ()),
        Transport::Registry(target) => Err(ImageError::InvalidArgument(format!(
            "{} is not a local destination",
            target
        ))),
    }
}

/// Format an existing layout was written in.
fn layout_format(layout: &OciLayout) -> ImageFormat {
    if layout.manifest_media_type().contains("docker") {
        ImageFormat::Docker
    } else {
        ImageFormat::Oci
    }
}

/// Rewrite a layout's manifest and descriptors into `format`.
fn convert_layout(layout: &OciLayout, format: ImageFormat, dest: &Path) -> Result<OciLayout> {
    let mut builder = LayoutBuilder::create(dest)?;
    builder.add_layers_from(layout, format)?;
    builder.finish(&layout.config_json()?, format, layout.ref_names())
}
