//! Filesystem snapshots and layer tarballs for build steps.
//!
//! A step's layer is the difference between two [`DirSnapshot`]s of the
//! working rootfs: added or modified paths are archived as-is, removed paths
//! become `.wh.` whiteout entries.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use stevedore_core::error::{ImageError, Result};

use crate::archive::is_gzip;
use crate::layout::{compute_diff_id, sha256_file};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Metadata recorded for a single path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
}

/// The file state of a directory tree.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Relative path → entry
    pub entries: HashMap<PathBuf, FileEntry>,
}

/// Paths that changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    /// Added or modified, sorted
    pub changed: Vec<PathBuf>,
    /// Removed, sorted, children of removed directories omitted
    pub deleted: Vec<PathBuf>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

impl DirSnapshot {
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Changes from `self` (before) to `after`.
    pub fn diff(&self, after: &DirSnapshot) -> SnapshotDiff {
        let mut changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, entry)| match self.entries.get(*path) {
                None => true,
                Some(before) => {
                    // Directories only count when they are new.
                    !entry.is_dir && (before.size != entry.size || before.modified != entry.modified)
                }
            })
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();

        let mut deleted: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|path| !after.entries.contains_key(*path))
            .cloned()
            .collect();
        deleted.sort();
        let mut top_level: Vec<PathBuf> = Vec::new();
        for path in deleted {
            if !top_level.iter().any(|parent| path.starts_with(parent)) {
                top_level.push(path);
            }
        }

        SnapshotDiff {
            changed,
            deleted: top_level,
        }
    }
}

/// Recursively collect entries; symlinks are recorded but not followed.
fn walk_dir(root: &Path, current: &Path, entries: &mut HashMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        ImageError::Build(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| ImageError::Build(format!("Failed to read directory entry: {}", e)))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                ImageError::Build(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();
        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            ImageError::Build(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        entries.insert(
            relative,
            FileEntry {
                size: metadata.len(),
                modified: metadata.modified().ok(),
                is_dir: metadata.is_dir(),
            },
        );

        if metadata.is_dir() {
            walk_dir(root, &path, entries)?;
        }
    }
    Ok(())
}

/// A gzip-compressed layer tarball produced by a build step.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub path: PathBuf,
    /// SHA256 of the compressed file, hex
    pub digest: String,
    /// "sha256:..." of the uncompressed tar
    pub diff_id: String,
    pub size: u64,
}

/// Archive the changes in `diff` from `rootfs` into `output`.
pub fn create_layer(rootfs: &Path, diff: &SnapshotDiff, output: &Path) -> Result<LayerInfo> {
    let mut builder = layer_builder(output)?;

    for relative in &diff.changed {
        let full_path = rootfs.join(relative);
        let metadata = match std::fs::symlink_metadata(&full_path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let result = if metadata.is_dir() {
            builder.append_dir(relative, &full_path)
        } else {
            builder.append_path_with_name(&full_path, relative)
        };
        result.map_err(|e| {
            ImageError::Build(format!(
                "Failed to add {} to layer: {}",
                relative.display(),
                e
            ))
        })?;
    }

    for relative in &diff.deleted {
        append_whiteout(&mut builder, relative)?;
    }

    finish_layer(builder, output)
}

/// Archive all of `src_dir` into `output`, placing entries under
/// `target_prefix` (an image-relative path, empty for the image root).
pub fn create_layer_from_dir(
    src_dir: &Path,
    target_prefix: &Path,
    output: &Path,
) -> Result<LayerInfo> {
    let mut builder = layer_builder(output)?;
    add_dir_to_tar(&mut builder, src_dir, src_dir, target_prefix)?;
    finish_layer(builder, output)
}

/// Apply a layer tarball (gzip or plain) onto `rootfs`, honouring whiteouts.
pub fn extract_layer(layer: &Path, rootfs: &Path) -> Result<()> {
    std::fs::create_dir_all(rootfs)?;
    let file = std::io::BufReader::new(std::fs::File::open(layer)?);
    if is_gzip(layer)? {
        apply_entries(tar::Archive::new(flate2::read::GzDecoder::new(file)), layer, rootfs)
    } else {
        apply_entries(tar::Archive::new(file), layer, rootfs)
    }
}

fn apply_entries<R: Read>(mut archive: tar::Archive<R>, layer: &Path, rootfs: &Path) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|e| ImageError::Build(format!("Failed to read layer {}: {}", layer.display(), e)))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| ImageError::Build(format!("Corrupt layer {}: {}", layer.display(), e)))?;
        let path = entry
            .path()
            .map_err(|e| ImageError::Build(format!("Bad path in layer: {}", e)))?
            .into_owned();
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ImageError::Build(format!(
                "Layer entry {} escapes the rootfs",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = rootfs.join(path.parent().unwrap_or(Path::new("")));

        if name == OPAQUE_WHITEOUT {
            if parent.is_dir() {
                for child in std::fs::read_dir(&parent)? {
                    remove_path(&child?.path())?;
                }
            }
            continue;
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&parent.join(target))?;
            continue;
        }

        entry.unpack_in(rootfs).map_err(|e| {
            ImageError::Build(format!(
                "Failed to extract {} from layer: {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

type LayerBuilder = tar::Builder<flate2::write::GzEncoder<std::fs::File>>;

fn layer_builder(output: &Path) -> Result<LayerBuilder> {
    let file = std::fs::File::create(output).map_err(|e| {
        ImageError::Build(format!(
            "Failed to create layer file {}: {}",
            output.display(),
            e
        ))
    })?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    Ok(builder)
}

fn finish_layer(builder: LayerBuilder, output: &Path) -> Result<LayerInfo> {
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| ImageError::Build(format!("Failed to finalize layer: {}", e)))?;

    Ok(LayerInfo {
        path: output.to_path_buf(),
        digest: sha256_file(output)?,
        diff_id: compute_diff_id(output)?,
        size: std::fs::metadata(output)?.len(),
    })
}

fn append_whiteout(builder: &mut LayerBuilder, relative: &Path) -> Result<()> {
    let name = relative
        .file_name()
        .ok_or_else(|| ImageError::Build(format!("Cannot whiteout {}", relative.display())))?;
    let whiteout = relative
        .parent()
        .unwrap_or(Path::new(""))
        .join(format!("{}{}", WHITEOUT_PREFIX, name.to_string_lossy()));

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder
        .append_data(&mut header, &whiteout, std::io::empty())
        .map_err(|e| ImageError::Build(format!("Failed to add whiteout: {}", e)))
}

fn add_dir_to_tar(
    builder: &mut LayerBuilder,
    root: &Path,
    current: &Path,
    target_prefix: &Path,
) -> Result<()> {
    let entries = std::fs::read_dir(current).map_err(|e| {
        ImageError::Build(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in entries {
        let path = entry
            .map_err(|e| ImageError::Build(format!("Failed to read entry: {}", e)))?
            .path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| ImageError::Build(format!("Failed to strip prefix: {}", e)))?;
        let tar_path = target_prefix.join(relative);

        let is_dir = std::fs::symlink_metadata(&path)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_dir {
            builder.append_dir(&tar_path, &path).map_err(|e| {
                ImageError::Build(format!("Failed to add directory to layer: {}", e))
            })?;
            add_dir_to_tar(builder, root, &path, target_prefix)?;
        } else {
            builder
                .append_path_with_name(&path, &tar_path)
                .map_err(|e| ImageError::Build(format!("Failed to add file to layer: {}", e)))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tar_names(layer: &Path) -> Vec<String> {
        let file = fs::File::open(layer).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_snapshot_records_nested_paths() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/b.txt"), "world").unwrap();

        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(snap.entries.contains_key(&PathBuf::from("a.txt")));
        assert!(snap.entries[&PathBuf::from("sub")].is_dir);
        assert!(snap.entries.contains_key(&PathBuf::from("sub/b.txt")));
    }

    #[test]
    fn test_diff_added_modified_and_deleted() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("keep.txt"), "same").unwrap();
        fs::write(tmp.path().join("grow.txt"), "x").unwrap();
        fs::create_dir_all(tmp.path().join("gone/deep")).unwrap();
        fs::write(tmp.path().join("gone/deep/f"), "f").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();

        fs::write(tmp.path().join("grow.txt"), "xxxx").unwrap();
        fs::write(tmp.path().join("new.txt"), "n").unwrap();
        fs::remove_dir_all(tmp.path().join("gone")).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        let diff = before.diff(&after);
        assert_eq!(
            diff.changed,
            vec![PathBuf::from("grow.txt"), PathBuf::from("new.txt")]
        );
        assert_eq!(diff.deleted, vec![PathBuf::from("gone")]);
    }

    #[test]
    fn test_diff_no_changes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn test_create_layer_with_whiteout() {
        let rootfs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir(rootfs.path().join("etc")).unwrap();
        fs::write(rootfs.path().join("etc/motd"), "hi").unwrap();

        let diff = SnapshotDiff {
            changed: vec![PathBuf::from("etc"), PathBuf::from("etc/motd")],
            deleted: vec![PathBuf::from("var/cache")],
        };
        let info = create_layer(rootfs.path(), &diff, &out.path().join("l.tar.gz")).unwrap();

        assert_eq!(info.digest.len(), 64);
        assert!(info.diff_id.starts_with("sha256:"));
        assert!(info.size > 0);
        let names = tar_names(&info.path);
        assert!(names.iter().any(|n| n == "etc/motd"));
        assert!(names.iter().any(|n| n == "var/.wh.cache"));
    }

    #[test]
    fn test_create_layer_from_dir_prefixes_paths() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir(src.path().join("bin")).unwrap();
        fs::write(src.path().join("bin/tool"), "#!/bin/sh").unwrap();

        let info = create_layer_from_dir(
            src.path(),
            Path::new("opt/app"),
            &out.path().join("l.tar.gz"),
        )
        .unwrap();
        let names = tar_names(&info.path);
        assert!(names.iter().any(|n| n.trim_end_matches('/') == "opt/app/bin"));
        assert!(names.iter().any(|n| n == "opt/app/bin/tool"));
    }

    #[test]
    fn test_extract_layer_applies_whiteouts() {
        let rootfs = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        fs::create_dir_all(rootfs.path().join("var/cache")).unwrap();
        fs::write(rootfs.path().join("var/cache/x"), "x").unwrap();
        fs::create_dir(work.path().join("src")).unwrap();
        fs::write(work.path().join("src/new.txt"), "new").unwrap();

        let diff = SnapshotDiff {
            changed: vec![PathBuf::from("new.txt")],
            deleted: vec![PathBuf::from("var/cache")],
        };
        let layer = create_layer(&work.path().join("src"), &diff, &work.path().join("l.tar.gz"))
            .unwrap();
        extract_layer(&layer.path, rootfs.path()).unwrap();

        assert!(!rootfs.path().join("var/cache").exists());
        assert!(rootfs.path().join("var").is_dir());
        assert_eq!(
            fs::read_to_string(rootfs.path().join("new.txt")).unwrap(),
            "new"
        );
    }
}
