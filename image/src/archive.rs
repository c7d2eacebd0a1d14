//! Tar archives of images.
//!
//! Both archive flavours carry a complete OCI layout. A docker-archive
//! additionally has a `manifest.json` naming the config, the layers and the
//! `RepoTags`, so `docker load` understands it. Loading also accepts the
//! older docker layout that has only `manifest.json`.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stevedore_core::config::ImageFormat;
use stevedore_core::error::{ImageError, Result};

use crate::layout::{copy_dir_recursive, LayoutBuilder, OciLayout};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const DOCKER_MANIFEST: &str = "manifest.json";
const UNCOMPRESSED_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// Which archive flavour to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Docker,
    Oci,
}

/// One entry of a docker-archive `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// An image read out of an archive.
#[derive(Debug)]
pub struct LoadedArchive {
    pub layout: OciLayout,
    /// Names recorded in the archive (`RepoTags` or ref-name annotations)
    pub names: Vec<String>,
}

/// Write `layout` as a tar archive at `output`.
///
/// `tags` are recorded as ref-name annotations and, for docker archives, as
/// `RepoTags`.
pub fn save(
    layout: &OciLayout,
    output: &Path,
    kind: ArchiveKind,
    tags: &[String],
    compress: bool,
) -> Result<()> {
    let staging = tempfile::tempdir()?;
    let staged = stage_layout(layout, staging.path(), tags)?;

    if kind == ArchiveKind::Docker {
        write_docker_manifest(&staged, tags)?;
    }

    write_tar(staging.path().join("image").as_path(), output, compress)?;
    tracing::info!(
        output = %output.display(),
        kind = ?kind,
        compress,
        tags = tags.len(),
        "Saved image archive"
    );
    Ok(())
}

/// Copy `layout` to a plain OCI layout directory at `dest`.
pub fn save_dir(layout: &OciLayout, dest: &Path, tags: &[String]) -> Result<OciLayout> {
    if dest.join("index.json").exists() {
        std::fs::remove_dir_all(dest)?;
    }
    copy_dir_recursive(layout.root(), dest)?;
    let mut copied = OciLayout::open(dest)?;
    copied.set_ref_names(tags)?;
    tracing::info!(dest = %dest.display(), "Wrote OCI layout");
    Ok(copied)
}

/// Extract an archive (plain or gzip) into `work_dir` and open the image.
pub fn load(path: &Path, work_dir: &Path) -> Result<LoadedArchive> {
    if !path.is_file() {
        return Err(ImageError::NotFound(format!(
            "Archive {} does not exist",
            path.display()
        )));
    }
    let extracted = work_dir.join("extracted");
    unpack(path, &extracted)?;

    if extracted.join("oci-layout").exists() {
        let layout = OciLayout::open(&extracted)?;
        let names = match read_docker_manifest(&extracted)? {
            Some(entry) if !entry.repo_tags.is_empty() => entry.repo_tags,
            _ => layout.ref_names().to_vec(),
        };
        return Ok(LoadedArchive { layout, names });
    }

    match read_docker_manifest(&extracted)? {
        Some(entry) => load_legacy_docker(&extracted, &work_dir.join("layout"), entry),
        None => Err(ImageError::InvalidArgument(format!(
            "{} is neither an OCI nor a docker archive",
            path.display()
        ))),
    }
}

/// Whether a file starts with the gzip magic bytes.
pub fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = std::fs::File::open(path)?;
    let n = file.read(&mut magic)?;
    Ok(n == 2 && magic == GZIP_MAGIC)
}

fn stage_layout(layout: &OciLayout, staging: &Path, tags: &[String]) -> Result<OciLayout> {
    let dir = staging.join("image");
    copy_dir_recursive(layout.root(), &dir)?;
    let mut staged = OciLayout::open(&dir)?;
    staged.set_ref_names(tags)?;
    Ok(staged)
}

fn write_docker_manifest(layout: &OciLayout, tags: &[String]) -> Result<()> {
    let rel = |digest: &str| -> Result<String> {
        let path = layout.blob_path(digest);
        path.strip_prefix(layout.root())
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| ImageError::Other(e.to_string()))
    };
    let entry = DockerManifestEntry {
        config: rel(&layout.config_descriptor()?.digest)?,
        repo_tags: tags.to_vec(),
        layers: layout
            .layers()
            .iter()
            .map(|l| rel(&l.digest))
            .collect::<Result<Vec<_>>>()?,
    };
    std::fs::write(
        layout.root().join(DOCKER_MANIFEST),
        serde_json::to_vec_pretty(&[entry])?,
    )?;
    Ok(())
}

fn read_docker_manifest(dir: &Path) -> Result<Option<DockerManifestEntry>> {
    let path = dir.join(DOCKER_MANIFEST);
    if !path.exists() {
        return Ok(None);
    }
    let entries: Vec<DockerManifestEntry> = serde_json::from_slice(&std::fs::read(&path)?)?;
    Ok(entries.into_iter().next())
}

/// Rebuild an OCI layout from a `manifest.json`-only docker archive.
fn load_legacy_docker(
    extracted: &Path,
    layout_dir: &Path,
    entry: DockerManifestEntry,
) -> Result<LoadedArchive> {
    let config: Value = serde_json::from_slice(&std::fs::read(safe_join(extracted, &entry.config)?)?)?;

    let mut builder = LayoutBuilder::create(layout_dir)?;
    for layer in &entry.layers {
        let path = safe_join(extracted, layer)?;
        let media_type = if is_gzip(&path)? {
            ImageFormat::Docker.layer_media_type()
        } else {
            UNCOMPRESSED_LAYER
        };
        builder.add_layer_file(&path, media_type)?;
    }
    let layout = builder.finish(&config, ImageFormat::Docker, &entry.repo_tags)?;
    Ok(LoadedArchive {
        layout,
        names: entry.repo_tags,
    })
}

/// Join an archive-relative path, refusing anything that escapes `root`.
fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(ImageError::InvalidArgument(format!(
            "Archive path escapes archive root: {}",
            rel
        )));
    }
    Ok(root.join(rel_path))
}

fn unpack(path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = BufReader::new(std::fs::File::open(path)?);
    let result = if is_gzip(path)? {
        tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(dest)
    } else {
        tar::Archive::new(file).unpack(dest)
    };
    result.map_err(|e| {
        ImageError::InvalidArgument(format!("Failed to extract {}: {}", path.display(), e))
    })
}

fn write_tar(src_dir: &Path, output: &Path, compress: bool) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::File::create(output)?;
    if compress {
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", src_dir)?;
        builder.into_inner()?.finish()?;
    } else {
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", src_dir)?;
        builder.finish()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::tests::write_test_layout;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample(tmp: &TempDir) -> OciLayout {
        write_test_layout(
            &tmp.path().join("src"),
            json!({
                "architecture": "amd64",
                "os": "linux",
                "rootfs": { "type": "layers", "diff_ids": [] },
                "history": []
            }),
        )
    }

    #[test]
    fn test_docker_archive_roundtrip_keeps_id_and_tags() {
        let tmp = TempDir::new().unwrap();
        let layout = sample(&tmp);
        let out = tmp.path().join("out.tar");
        let tags = vec!["app:v1".to_string(), "app:v2".to_string()];
        save(&layout, &out, ArchiveKind::Docker, &tags, false).unwrap();
        assert!(!is_gzip(&out).unwrap());

        let work = TempDir::new().unwrap();
        let loaded = load(&out, work.path()).unwrap();
        assert_eq!(loaded.layout.image_id().unwrap(), layout.image_id().unwrap());
        assert_eq!(loaded.names, tags);
        assert!(work.path().join("extracted").join(DOCKER_MANIFEST).exists());
    }

    #[test]
    fn test_oci_archive_compressed() {
        let tmp = TempDir::new().unwrap();
        let layout = sample(&tmp);
        let out = tmp.path().join("out.tar.gz");
        save(&layout, &out, ArchiveKind::Oci, &["app:v1".to_string()], true).unwrap();
        assert!(is_gzip(&out).unwrap());

        let work = TempDir::new().unwrap();
        let loaded = load(&out, work.path()).unwrap();
        assert_eq!(loaded.names, vec!["app:v1"]);
        assert!(!work.path().join("extracted").join(DOCKER_MANIFEST).exists());
    }

    #[test]
    fn test_save_dir_writes_annotations() {
        let tmp = TempDir::new().unwrap();
        let layout = sample(&tmp);
        let dest = tmp.path().join("out");
        let copied = save_dir(&layout, &dest, &["a:1".to_string(), "b:2".to_string()]).unwrap();
        assert_eq!(copied.ref_names(), &["a:1", "b:2"]);
        let index = std::fs::read_to_string(dest.join("index.json")).unwrap();
        assert!(index.contains("org.opencontainers.image.ref.name"));
    }

    #[test]
    fn test_load_legacy_docker_archive() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("legacy");
        std::fs::create_dir_all(root.join("layer1")).unwrap();

        let content = TempDir::new().unwrap();
        std::fs::write(content.path().join("f"), "x").unwrap();
        let layer_file = std::fs::File::create(root.join("layer1/layer.tar")).unwrap();
        let mut b = tar::Builder::new(layer_file);
        b.append_dir_all(".", content.path()).unwrap();
        b.finish().unwrap();

        std::fs::write(
            root.join("cfg.json"),
            r#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#,
        )
        .unwrap();
        std::fs::write(
            root.join(DOCKER_MANIFEST),
            r#"[{"Config":"cfg.json","RepoTags":["legacy:1"],"Layers":["layer1/layer.tar"]}]"#,
        )
        .unwrap();
        let out = tmp.path().join("legacy.tar");
        write_tar(&root, &out, false).unwrap();

        let work = TempDir::new().unwrap();
        let loaded = load(&out, work.path()).unwrap();
        assert_eq!(loaded.names, vec!["legacy:1"]);
        assert_eq!(loaded.layout.layers().len(), 1);
        assert_eq!(loaded.layout.layers()[0].media_type, UNCOMPRESSED_LAYER);
    }

    #[test]
    fn test_load_missing_and_garbage() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            load(&tmp.path().join("nope.tar"), tmp.path()).unwrap_err(),
            ImageError::NotFound(_)
        ));

        let empty_dir = tmp.path().join("empty");
        std::fs::create_dir(&empty_dir).unwrap();
        std::fs::write(empty_dir.join("readme"), "hi").unwrap();
        let out = tmp.path().join("junk.tar");
        write_tar(&empty_dir, &out, false).unwrap();
        let work = TempDir::new().unwrap();
        assert!(matches!(
            load(&out, work.path()).unwrap_err(),
            ImageError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_safe_join_rejects_escape() {
        let root = Path::new("/tmp/x");
        assert!(safe_join(root, "../etc/passwd").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert_eq!(safe_join(root, "a/b").unwrap(), PathBuf::from("/tmp/x/a/b"));
    }
}
