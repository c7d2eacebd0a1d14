//! OCI image layout on disk.
//!
//! ```text
//! image/
//! ├── oci-layout           (layout marker)
//! ├── index.json           (points at one manifest, carries ref names)
//! └── blobs/sha256/
//!     ├── <manifest>
//!     ├── <config>
//!     └── <layers>
//! ```
//!
//! Every image in the store, every pull target and every export of the
//! `oci:` transport is one of these directories.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use oci_spec::image::ImageConfiguration;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use stevedore_core::config::ImageFormat;
use stevedore_core::error::{ImageError, Result};

/// Contents of the `oci-layout` marker file.
pub const OCI_LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Index annotation carrying a tag name.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// A blob descriptor as recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Prefixed digest ("sha256:...")
    pub digest: String,
    pub size: u64,
    pub media_type: String,
}

impl BlobInfo {
    /// Digest without the algorithm prefix.
    pub fn hex(&self) -> &str {
        strip_algorithm(&self.digest)
    }

    fn to_descriptor(&self) -> Value {
        json!({
            "mediaType": self.media_type,
            "digest": self.digest,
            "size": self.size,
        })
    }
}

/// An OCI image layout read from disk.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
    manifest_digest: String,
    manifest: Value,
    ref_names: Vec<String>,
}

impl OciLayout {
    /// Open a layout directory and load its (first) manifest.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        validate_layout(&root)?;

        let index = read_json(&root.join("index.json"))?;
        let entries = index["manifests"].as_array().cloned().unwrap_or_default();
        let entry = entries.first().ok_or_else(|| {
            ImageError::InvalidArgument(format!(
                "No manifests in {}",
                root.join("index.json").display()
            ))
        })?;
        let manifest_digest = entry["digest"]
            .as_str()
            .ok_or_else(|| {
                ImageError::InvalidArgument("Manifest entry without digest".to_string())
            })?
            .to_string();

        let ref_names = entries
            .iter()
            .filter_map(|e| e["annotations"][REF_NAME_ANNOTATION].as_str())
            .map(str::to_string)
            .collect();

        let manifest = read_json(&blob_path(&root, &manifest_digest))?;

        Ok(Self {
            root,
            manifest_digest,
            manifest,
            ref_names,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Prefixed manifest digest.
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn manifest(&self) -> &Value {
        &self.manifest
    }

    pub fn manifest_media_type(&self) -> &str {
        self.manifest["mediaType"]
            .as_str()
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
    }

    /// Tag names recorded as index annotations.
    pub fn ref_names(&self) -> &[String] {
        &self.ref_names
    }

    /// Config descriptor from the manifest.
    pub fn config_descriptor(&self) -> Result<BlobInfo> {
        descriptor_from(&self.manifest["config"]).ok_or_else(|| {
            ImageError::InvalidArgument(format!(
                "Manifest {} has no config descriptor",
                self.manifest_digest
            ))
        })
    }

    /// Image ID: hex sha256 of the config blob.
    pub fn image_id(&self) -> Result<String> {
        Ok(self.config_descriptor()?.hex().to_string())
    }

    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        let descriptor = self.config_descriptor()?;
        read_blob(&self.blob_path(&descriptor.digest))
    }

    /// Config as untyped JSON (used for rewriting and inspection).
    pub fn config_json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.config_bytes()?)?)
    }

    /// Config parsed into the OCI image configuration schema.
    pub fn config(&self) -> Result<ImageConfiguration> {
        Ok(serde_json::from_slice(&self.config_bytes()?)?)
    }

    /// Layer descriptors, bottom to top.
    pub fn layers(&self) -> Vec<BlobInfo> {
        self.manifest["layers"]
            .as_array()
            .map(|layers| layers.iter().filter_map(descriptor_from).collect())
            .unwrap_or_default()
    }

    pub fn layer_paths(&self) -> Vec<PathBuf> {
        self.layers()
            .iter()
            .map(|l| self.blob_path(&l.digest))
            .collect()
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        blob_path(&self.root, digest)
    }

    /// Sum of the layer blob sizes on disk; `None` if any blob is missing.
    pub fn layers_size(&self) -> Option<u64> {
        self.layer_paths()
            .iter()
            .map(|p| std::fs::metadata(p).ok().map(|m| m.len()))
            .sum()
    }

    /// Rewrite `index.json` with the given ref-name annotations.
    pub fn set_ref_names(&mut self, ref_names: &[String]) -> Result<()> {
        let manifest_size = std::fs::metadata(self.blob_path(&self.manifest_digest))?.len();
        write_index(
            &self.root,
            &BlobInfo {
                digest: self.manifest_digest.clone(),
                size: manifest_size,
                media_type: self.manifest_media_type().to_string(),
            },
            ref_names,
        )?;
        self.ref_names = ref_names.to_vec();
        Ok(())
    }
}

/// Incrementally writes a new layout: blobs first, then config, manifest
/// and index in [`LayoutBuilder::finish`].
pub struct LayoutBuilder {
    root: PathBuf,
    layers: Vec<BlobInfo>,
    annotations: BTreeMap<String, String>,
}

impl LayoutBuilder {
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("blobs").join("sha256")).map_err(|e| {
            ImageError::StoreUnavailable(format!(
                "Failed to create layout at {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self {
            root,
            layers: Vec::new(),
            annotations: BTreeMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest annotations written by [`LayoutBuilder::finish`].
    pub fn annotate<I, K, V>(&mut self, annotations: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.annotations
            .extend(annotations.into_iter().map(|(k, v)| (k.into(), v.into())));
    }

    /// Write raw bytes as a blob.
    pub fn add_blob(&self, data: &[u8], media_type: &str) -> Result<BlobInfo> {
        let hex = sha256_bytes(data);
        let path = self.root.join("blobs").join("sha256").join(&hex);
        if !path.exists() {
            std::fs::write(&path, data)?;
        }
        Ok(BlobInfo {
            digest: format!("sha256:{}", hex),
            size: data.len() as u64,
            media_type: media_type.to_string(),
        })
    }

    /// Append a layer from a compressed tarball on disk.
    pub fn add_layer_file(&mut self, path: &Path, media_type: &str) -> Result<BlobInfo> {
        let hex = sha256_file(path)?;
        let target = self.root.join("blobs").join("sha256").join(&hex);
        if !target.exists() {
            std::fs::copy(path, &target)?;
        }
        let info = BlobInfo {
            digest: format!("sha256:{}", hex),
            size: std::fs::metadata(&target)?.len(),
            media_type: media_type.to_string(),
        };
        self.layers.push(info.clone());
        Ok(info)
    }

    /// Append every layer of `base`, converting media types to `format`.
    pub fn add_layers_from(&mut self, base: &OciLayout, format: ImageFormat) -> Result<()> {
        for layer in base.layers() {
            let media_type = layer_media_type_for(&layer.media_type, format);
            self.add_layer_file(&base.blob_path(&layer.digest), &media_type)?;
        }
        Ok(())
    }

    /// Write config, manifest, index and marker; returns the opened layout.
    pub fn finish(
        self,
        config: &Value,
        format: ImageFormat,
        ref_names: &[String],
    ) -> Result<OciLayout> {
        let config_bytes = serde_json::to_vec(config)?;
        let config_blob = self.add_blob(&config_bytes, format.config_media_type())?;

        let mut manifest = json!({
            "schemaVersion": 2,
            "mediaType": format.manifest_media_type(),
            "config": config_blob.to_descriptor(),
            "layers": self.layers.iter().map(BlobInfo::to_descriptor).collect::<Vec<_>>(),
        });
        if !self.annotations.is_empty() {
            manifest["annotations"] = json!(self.annotations);
        }
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_blob = self.add_blob(&manifest_bytes, format.manifest_media_type())?;

        write_index(&self.root, &manifest_blob, ref_names)?;
        std::fs::write(self.root.join("oci-layout"), OCI_LAYOUT_MARKER)?;

        OciLayout::open(&self.root)
    }
}

pub(crate) fn write_index(root: &Path, manifest: &BlobInfo, ref_names: &[String]) -> Result<()> {
    let entries: Vec<Value> = if ref_names.is_empty() {
        vec![manifest.to_descriptor()]
    } else {
        ref_names
            .iter()
            .map(|name| {
                let mut entry = manifest.to_descriptor();
                entry["annotations"] = json!({ REF_NAME_ANNOTATION: name });
                entry
            })
            .collect()
    };
    let index = json!({
        "schemaVersion": 2,
        "mediaType": INDEX_MEDIA_TYPE,
        "manifests": entries,
    });
    std::fs::write(root.join("index.json"), serde_json::to_vec_pretty(&index)?)?;
    Ok(())
}

fn validate_layout(root: &Path) -> Result<()> {
    for required in ["oci-layout", "index.json", "blobs"] {
        if !root.join(required).exists() {
            return Err(ImageError::InvalidArgument(format!(
                "Not a valid OCI layout: missing {} in {}",
                required,
                root.display()
            )));
        }
    }
    Ok(())
}

fn descriptor_from(value: &Value) -> Option<BlobInfo> {
    Some(BlobInfo {
        digest: value["digest"].as_str()?.to_string(),
        size: value["size"].as_u64().unwrap_or(0),
        media_type: value["mediaType"].as_str().unwrap_or_default().to_string(),
    })
}

fn read_json(path: &Path) -> Result<Value> {
    Ok(serde_json::from_slice(&read_blob(path)?)?)
}

fn read_blob(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        ImageError::StoreUnavailable(format!("Failed to read {}: {}", path.display(), e))
    })
}

/// Media type a layer takes on in `format`. Only gzip layers have a
/// counterpart in both formats.
pub fn layer_media_type_for(current: &str, format: ImageFormat) -> String {
    if current.ends_with("gzip") {
        format.layer_media_type().to_string()
    } else {
        current.to_string()
    }
}

/// Path of a blob inside a layout root.
pub fn blob_path(root: &Path, digest: &str) -> PathBuf {
    match digest.split_once(':') {
        Some((algorithm, hex)) => root.join("blobs").join(algorithm).join(hex),
        None => root.join("blobs").join("sha256").join(digest),
    }
}

/// Strip a leading "sha256:" (or any algorithm) prefix.
pub fn strip_algorithm(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// SHA256 of raw bytes, hex encoded.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA256 of a file's contents, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Diff ID of a gzip-compressed layer: SHA256 of the uncompressed tar.
pub fn compute_diff_id(layer_path: &Path) -> Result<String> {
    let file = std::fs::File::open(layer_path)?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Create a gzip-compressed tar of a whole directory.
pub fn tar_gz_dir(src_dir: &Path, output: &Path) -> Result<()> {
    let file = std::fs::File::create(output)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", src_dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Recursively copy a directory.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Total size of a directory tree, `None` if it cannot be walked.
pub fn dir_size(path: &Path) -> Option<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path).ok()? {
        let path = entry.ok()?.path();
        if path.is_dir() {
            total += dir_size(&path)?;
        } else {
            total += path.metadata().ok()?.len();
        }
    }
    Some(total)
}
