//! Native build backend.
//!
//! Executes a Dockerfile step by step against a working rootfs:
//!
//! 1. Read and parse the Dockerfile(s)
//! 2. `FROM`: start a stage from `scratch`, an earlier stage, or a stored
//!    image (pulled according to the plan's pull policy)
//! 3. Filesystem steps (`RUN`, `COPY`, `ADD`, `WORKDIR`) snapshot the rootfs
//!    before and after; a non-empty difference becomes a layer
//! 4. Metadata steps edit the image config
//! 5. The last stage is written as a layout and registered with the tags

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use stevedore_core::error::{ImageError, Result};
use tokio_util::sync::CancellationToken;

use super::dockerfile::{Dockerfile, Instruction, Step};
use super::layer::{create_layer, create_layer_from_dir, extract_layer, DirSnapshot};
use super::log::BuildLog;
use super::{is_url, BuildBackend, BuildPlan, DockerfileSource};
use crate::archive::is_gzip;
use crate::changes::{set_env, update_object};
use crate::import::{download, host_architecture};
use crate::layout::{layer_media_type_for, LayoutBuilder};
use crate::pull::ImagePuller;
use crate::registry::RegistryOptions;
use crate::store::ImageStore;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Builds images in-process.
pub struct NativeBuilder {
    store: Arc<ImageStore>,
    puller: Arc<ImagePuller>,
}

/// A compressed layer blob and its media type.
#[derive(Debug, Clone)]
struct LayerRef {
    path: PathBuf,
    media_type: String,
}

/// Mutable state of one build stage.
#[derive(Debug, Clone)]
struct Stage {
    alias: Option<String>,
    index: usize,
    rootfs: PathBuf,
    /// Full image config: `config`, `rootfs.diff_ids`, `history`, ...
    config: Value,
    layers: Vec<LayerRef>,
    parent: Option<String>,
}

impl Stage {
    fn workdir(&self) -> String {
        self.config["config"]["WorkingDir"]
            .as_str()
            .filter(|w| !w.is_empty())
            .unwrap_or("/")
            .to_string()
    }

    fn env(&self) -> Vec<(String, String)> {
        self.config["config"]["Env"]
            .as_array()
            .map(|env| {
                env.iter()
                    .filter_map(|e| e.as_str()?.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn matches(&self, name: &str) -> bool {
        self.alias.as_deref() == Some(name) || self.index.to_string() == name
    }

    fn record_history(&mut self, created_by: &str, empty_layer: bool) {
        let mut entry = json!({
            "created": Utc::now().to_rfc3339(),
            "created_by": created_by,
        });
        if empty_layer {
            entry["empty_layer"] = json!(true);
        }
        push_array(&mut self.config["history"], entry);
    }
}

impl NativeBuilder {
    pub fn new(store: Arc<ImageStore>, puller: Arc<ImagePuller>) -> Self {
        Self { store, puller }
    }

    async fn read_dockerfiles(&self, plan: &BuildPlan, work: &Path) -> Result<Vec<String>> {
        let mut contents = Vec::with_capacity(plan.dockerfiles.len());
        for (i, source) in plan.dockerfiles.iter().enumerate() {
            let path = match source {
                DockerfileSource::Path(path) => path.clone(),
                DockerfileSource::Url(url) => {
                    download(url, &work.join(format!("Dockerfile.{}", i))).await?
                }
            };
            contents.push(std::fs::read_to_string(&path).map_err(|e| {
                ImageError::Build(format!(
                    "Failed to read Dockerfile at {}: {}",
                    path.display(),
                    e
                ))
            })?);
        }
        Ok(contents)
    }

    /// Start a stage for `FROM image`.
    async fn start_stage(
        &self,
        image: &str,
        alias: Option<String>,
        earlier: &[Stage],
        plan: &BuildPlan,
        work: &Path,
        log: &mut BuildLog,
    ) -> Result<Stage> {
        let index = earlier.len();
        let rootfs = work.join(format!("stage-{}", index));
        std::fs::create_dir_all(&rootfs)?;

        if image.eq_ignore_ascii_case("scratch") {
            return Ok(Stage {
                alias,
                index,
                rootfs,
                config: json!({
                    "architecture": host_architecture(),
                    "os": "linux",
                    "config": {},
                    "rootfs": { "type": "layers", "diff_ids": [] },
                    "history": [],
                }),
                layers: Vec::new(),
                parent: None,
            });
        }

        if let Some(previous) = earlier.iter().rev().find(|s| s.matches(image)) {
            copy_tree(&previous.rootfs, &rootfs)?;
            return Ok(Stage {
                alias,
                index,
                rootfs,
                ..previous.clone()
            });
        }

        let record = self
            .puller
            .ensure(image, plan.pull_policy, &RegistryOptions::default())
            .await?;
        let layout = self.store.open_layout(&record)?;
        log.line(format!("Using base image {} ({})", image, record.short_id()));

        let mut layers = Vec::new();
        for blob in layout.layers() {
            let path = layout.blob_path(&blob.digest);
            tracing::debug!(layer = %blob.digest, "Extracting base layer");
            extract_layer(&path, &rootfs)?;
            layers.push(LayerRef {
                path,
                media_type: blob.media_type.clone(),
            });
        }

        let mut config = layout.config_json()?;
        if !config["config"].is_object() {
            config["config"] = json!({});
        }
        if !config["rootfs"]["diff_ids"].is_array() {
            config["rootfs"] = json!({ "type": "layers", "diff_ids": [] });
        }
        if !config["history"].is_array() {
            config["history"] = json!([]);
        }

        Ok(Stage {
            alias,
            index,
            rootfs,
            config,
            layers,
            parent: Some(record.id),
        })
    }

    /// Run one non-`FROM`, non-`ARG` step against `stage`.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        stage: &mut Stage,
        step: &Step,
        earlier: &[Stage],
        plan: &BuildPlan,
        args: &HashMap<String, String>,
        work: &Path,
        log: &mut BuildLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let c = &mut stage.config["config"];
        match &step.instruction {
            Instruction::Env { pairs } => {
                for (key, value) in pairs {
                    set_env(c, key, &expand_args(value, args));
                }
            }
            Instruction::Label { pairs } => update_object(c, "Labels", |labels| {
                for (key, value) in pairs {
                    labels.insert(expand_args(key, args), json!(expand_args(value, args)));
                }
            }),
            Instruction::Expose { ports } => update_object(c, "ExposedPorts", |exposed| {
                for port in ports {
                    let port = expand_args(port, args);
                    let port = if port.contains('/') {
                        port
                    } else {
                        format!("{}/tcp", port)
                    };
                    exposed.insert(port, json!({}));
                }
            }),
            Instruction::Volume { paths } => update_object(c, "Volumes", |volumes| {
                for path in paths {
                    volumes.insert(expand_args(path, args), json!({}));
                }
            }),
            Instruction::User { user } => c["User"] = json!(expand_args(user, args)),
            Instruction::StopSignal { signal } => c["StopSignal"] = json!(signal),
            Instruction::Cmd { exec } => c["Cmd"] = json!(exec),
            Instruction::Entrypoint { exec } => c["Entrypoint"] = json!(exec),
            Instruction::Workdir { .. }
            | Instruction::Run { .. }
            | Instruction::Copy { .. }
            | Instruction::Add { .. } => {
                return self
                    .filesystem_step(stage, step, earlier, plan, args, work, log, cancel)
                    .await;
            }
            Instruction::From { .. } | Instruction::Arg { .. } => {}
        }
        stage.record_history(&step.text, true);
        Ok(())
    }

    /// Run a step that may change the rootfs and capture its layer.
    #[allow(clippy::too_many_arguments)]
    async fn filesystem_step(
        &self,
        stage: &mut Stage,
        step: &Step,
        earlier: &[Stage],
        plan: &BuildPlan,
        args: &HashMap<String, String>,
        work: &Path,
        log: &mut BuildLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let before = DirSnapshot::capture(&stage.rootfs)?;

        match &step.instruction {
            Instruction::Workdir { path } => {
                let workdir = resolve_path(&stage.workdir(), &expand_args(path, args));
                std::fs::create_dir_all(stage.rootfs.join(workdir.trim_start_matches('/')))?;
                stage.config["config"]["WorkingDir"] = json!(workdir);
            }
            Instruction::Run { command } => {
                if !run_command(stage, command, plan, args, log, cancel).await? {
                    stage.record_history(&step.text, true);
                    return Ok(());
                }
            }
            Instruction::Copy { src, dst, from } => {
                let source_root = match from {
                    Some(name) => earlier
                        .iter()
                        .rev()
                        .find(|s| s.matches(name))
                        .map(|s| s.rootfs.clone())
                        .ok_or_else(|| {
                            ImageError::Build(format!("COPY --from: unknown stage {}", name))
                        })?,
                    None => plan.context_dir.clone(),
                };
                copy_sources(stage, &source_root, src, dst, false, args, work).await?;
            }
            Instruction::Add { src, dst } => {
                copy_sources(stage, &plan.context_dir, src, dst, true, args, work).await?;
            }
            _ => {}
        }

        let after = DirSnapshot::capture(&stage.rootfs)?;
        let diff = before.diff(&after);
        if diff.is_empty() {
            stage.record_history(&step.text, true);
            return Ok(());
        }

        let layer_path = work.join(format!(
            "stage-{}-layer-{}.tar.gz",
            stage.index,
            stage.layers.len()
        ));
        let layer = create_layer(&stage.rootfs, &diff, &layer_path)?;
        log.line(format!(
            "--> layer {} ({})",
            &layer.digest[..12],
            format_size(layer.size)
        ));
        push_array(&mut stage.config["rootfs"]["diff_ids"], json!(layer.diff_id));
        stage.layers.push(LayerRef {
            path: layer.path,
            media_type: plan.format.layer_media_type().to_string(),
        });
        stage.record_history(&step.text, false);
        Ok(())
    }

    /// Write the final stage as an image and register it.
    async fn commit(&self, stage: Stage, plan: &BuildPlan, work: &Path, log: &mut BuildLog) -> Result<String> {
        let Stage {
            rootfs,
            mut config,
            layers,
            parent,
            ..
        } = stage;
        let now = Utc::now().to_rfc3339();
        config["created"] = json!(now);
        if !plan.labels.is_empty() {
            update_object(&mut config["config"], "Labels", |labels| {
                for (key, value) in &plan.labels {
                    labels.insert(key.clone(), json!(value));
                }
            });
        }

        let mut builder = LayoutBuilder::create(work.join("output"))?;
        builder.annotate(plan.annotations.clone());

        let parent = if plan.squash {
            let squashed =
                create_layer_from_dir(&rootfs, Path::new(""), &work.join("squashed.tar.gz"))?;
            builder.add_layer_file(&squashed.path, plan.format.layer_media_type())?;
            config["rootfs"] = json!({ "type": "layers", "diff_ids": [squashed.diff_id] });
            if let Some(history) = config["history"].as_array_mut() {
                for entry in history.iter_mut() {
                    entry["empty_layer"] = json!(true);
                }
            }
            push_array(
                &mut config["history"],
                json!({ "created": now, "created_by": "squash", "comment": "squashed layers" }),
            );
            log.line(format!("Squashed {} layer(s)", layers.len()));
            None
        } else {
            for layer in &layers {
                builder.add_layer_file(
                    &layer.path,
                    &layer_media_type_for(&layer.media_type, plan.format),
                )?;
            }
            parent
        };

        let layout = builder.finish(&config, plan.format, &[])?;
        let record = self.store.register(&layout, &plan.tags, parent).await?;

        log.line(format!(
            "COMMIT {}",
            plan.tags.first().map(String::as_str).unwrap_or_default()
        ));
        for name in &record.names {
            log.line(format!("Successfully tagged {}", name));
        }
        log.line(&record.id);
        Ok(record.id)
    }
}

#[async_trait]
impl BuildBackend for NativeBuilder {
    async fn build(
        &self,
        plan: &BuildPlan,
        log: &mut BuildLog,
        cancel: CancellationToken,
    ) -> Result<String> {
        let work_root = self.store.store_dir().join("tmp");
        std::fs::create_dir_all(&work_root)?;
        let work = tempfile::tempdir_in(&work_root)?;

        let contents = self.read_dockerfiles(plan, work.path()).await?;
        let dockerfile = Dockerfile::parse_all(&contents)?;

        let mut args = plan.build_args.clone();
        let mut earlier: Vec<Stage> = Vec::new();
        let mut current: Option<Stage> = None;
        let total = dockerfile.steps.len();

        for (idx, step) in dockerfile.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ImageError::Build("build cancelled".to_string()));
            }
            log.line(format!("STEP {}/{}: {}", idx + 1, total, step.text));

            match &step.instruction {
                Instruction::Arg { name, default } => {
                    if !args.contains_key(name) {
                        if let Some(value) = default {
                            let value = expand_args(value, &args);
                            args.insert(name.clone(), value);
                        }
                    }
                }
                Instruction::From { image, alias } => {
                    if let Some(done) = current.take() {
                        earlier.push(done);
                    }
                    let image = expand_args(image, &args);
                    current = Some(
                        self.start_stage(&image, alias.clone(), &earlier, plan, work.path(), log)
                            .await?,
                    );
                }
                _ => {
                    let stage = current.as_mut().ok_or_else(|| {
                        ImageError::Build(format!("{} before FROM", step.instruction.keyword()))
                    })?;
                    self.execute(stage, step, &earlier, plan, &args, work.path(), log, &cancel)
                        .await?;
                }
            }
        }

        let stage = current.ok_or_else(|| ImageError::Build("no FROM instruction".to_string()))?;
        self.commit(stage, plan, work.path(), log).await
    }
}

/// Copy (or for `ADD`, also fetch and extract) `sources` into the stage.
async fn copy_sources(
    stage: &Stage,
    source_root: &Path,
    sources: &[String],
    dst: &str,
    is_add: bool,
    args: &HashMap<String, String>,
    work: &Path,
) -> Result<()> {
    let dst = expand_args(dst, args);
    let resolved = resolve_path(&stage.workdir(), &dst);
    let target = stage.rootfs.join(resolved.trim_start_matches('/'));
    let into_dir = dst.ends_with('/') || sources.len() > 1 || target.is_dir();
    if into_dir {
        std::fs::create_dir_all(&target)?;
    } else if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    for (i, source) in sources.iter().enumerate() {
        let source = expand_args(source, args);

        if is_add && is_url(&source) {
            let file_name = source
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .unwrap_or("download");
            let fetched = download(&source, &work.join(format!("add-{}", i))).await?;
            let dest = if into_dir {
                target.join(file_name)
            } else {
                target.clone()
            };
            std::fs::copy(&fetched, &dest)?;
            continue;
        }

        let path = join_within(source_root, &source)?;
        if !path.exists() && std::fs::symlink_metadata(&path).is_err() {
            return Err(ImageError::Build(format!(
                "{} source not found: {} (in {})",
                if is_add { "ADD" } else { "COPY" },
                source,
                source_root.display()
            )));
        }

        if is_add && is_tar_archive(&path) {
            std::fs::create_dir_all(&target)?;
            extract_layer(&path, &target)?;
        } else if path.is_dir() {
            copy_tree(&path, &target)?;
        } else {
            let dest = if into_dir {
                let name = path
                    .file_name()
                    .ok_or_else(|| ImageError::Build(format!("Cannot copy {}", source)))?;
                target.join(name)
            } else {
                target.clone()
            };
            copy_entry(&path, &dest)?;
        }
    }
    Ok(())
}

/// Run a shell command inside the stage rootfs. Returns false when the step
/// was skipped.
#[cfg(target_os = "linux")]
async fn run_command(
    stage: &Stage,
    command: &str,
    plan: &BuildPlan,
    args: &HashMap<String, String>,
    log: &mut BuildLog,
    cancel: &CancellationToken,
) -> Result<bool> {
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};

    let script = format!("cd {} && {}", shell_quote(&stage.workdir()), command);
    let mut cmd = tokio::process::Command::new("chroot");
    cmd.arg(&stage.rootfs)
        .arg("/bin/sh")
        .arg("-c")
        .arg(script)
        .env_clear()
        .env("PATH", DEFAULT_PATH)
        .env("HOME", "/root")
        .envs(args.iter())
        .envs(stage.env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    apply_limits(&mut cmd, plan);

    let mut child = cmd
        .spawn()
        .map_err(|e| ImageError::Build(format!("Failed to execute RUN command: {}", e)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ImageError::Build("RUN stdout unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ImageError::Build("RUN stderr unavailable".to_string()))?;
    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        tokio::select! {
            line = out.next_line(), if !out_done => match line? {
                Some(line) => log.line(line),
                None => out_done = true,
            },
            line = err.next_line(), if !err_done => match line? {
                Some(line) => log.line(line),
                None => err_done = true,
            },
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ImageError::Build("build cancelled".to_string()));
            }
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(ImageError::Build(format!(
            "RUN {} failed (exit {})",
            command,
            status.code().unwrap_or(-1)
        )));
    }
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
async fn run_command(
    _stage: &Stage,
    command: &str,
    _plan: &BuildPlan,
    _args: &HashMap<String, String>,
    log: &mut BuildLog,
    _cancel: &CancellationToken,
) -> Result<bool> {
    log.line(format!("RUN skipped: requires a Linux host ({})", command));
    Ok(false)
}

/// Network isolation, CPU affinity and rlimits for `RUN` children.
#[cfg(target_os = "linux")]
fn apply_limits(cmd: &mut tokio::process::Command, plan: &BuildPlan) {
    let mut limits: Vec<(i32, u64, u64)> = plan
        .ulimits
        .iter()
        .map(|u| (rlimit_resource(u.name), u.soft, u.hard))
        .collect();
    if let Some(bytes) = plan.address_space_limit() {
        limits.push((libc::RLIMIT_AS as i32, bytes, bytes));
    }
    let affinity = cpu_affinity(&plan.cpuset);
    let isolate_network = plan.network == super::NetworkMode::None;
    if limits.is_empty() && affinity.is_none() && !isolate_network {
        return;
    }
    tracing::debug!(
        isolate_network,
        cpus = ?plan.cpuset,
        limits = limits.len(),
        "Restricting RUN step"
    );

    // SAFETY: the closure only makes raw syscalls (unshare,
    // sched_setaffinity, setrlimit) on data captured by value.
    unsafe {
        cmd.pre_exec(move || {
            if isolate_network && libc::unshare(libc::CLONE_NEWNET) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(set) = &affinity {
                if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            for (resource, soft, hard) in &limits {
                let limit = libc::rlimit {
                    rlim_cur: *soft as libc::rlim_t,
                    rlim_max: *hard as libc::rlim_t,
                };
                if libc::setrlimit(*resource as _, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

#[cfg(target_os = "linux")]
fn cpu_affinity(cpus: &[usize]) -> Option<libc::cpu_set_t> {
    if cpus.is_empty() {
        return None;
    }
    // SAFETY: cpu_set_t is a plain bitmask; indices are bounded when the
    // cpuset is parsed.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        Some(set)
    }
}

#[cfg(target_os = "linux")]
fn rlimit_resource(name: &str) -> i32 {
    let resource = match name {
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "data" => libc::RLIMIT_DATA,
        "fsize" => libc::RLIMIT_FSIZE,
        "locks" => libc::RLIMIT_LOCKS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "nproc" => libc::RLIMIT_NPROC,
        "stack" => libc::RLIMIT_STACK,
        _ => libc::RLIMIT_NOFILE,
    };
    resource as i32
}

/// Single-quote `s` for `/bin/sh`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn push_array(slot: &mut Value, item: Value) {
    match slot.as_array_mut() {
        Some(items) => items.push(item),
        None => *slot = json!([item]),
    }
}

/// Resolve `path` against the working directory.
fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

/// Join a source path onto its root without leaving it.
fn join_within(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = Path::new(rel.trim_start_matches('/'));
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ImageError::Build(format!(
            "{} is outside the build context",
            rel.display()
        )));
    }
    Ok(root.join(rel))
}

fn is_tar_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    path.is_file()
        && (name.ends_with(".tar")
            || name.ends_with(".tar.gz")
            || name.ends_with(".tgz")
            || (name.ends_with(".gz") && is_gzip(path).unwrap_or(false)))
}

/// Expand `${VAR}` and `$VAR` references using build args.
fn expand_args(s: &str, args: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = args.keys().collect();
    // Longest first so $VERSION is not clobbered by $VER.
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
    let mut result = s.to_string();
    for key in keys {
        result = result.replace(&format!("${{{}}}", key), &args[key]);
        result = result.replace(&format!("${}", key), &args[key]);
    }
    result
}

/// Copy a directory's contents into `dst`, preserving symlinks.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            copy_entry(&from, &to)?;
        }
    }
    Ok(())
}

fn copy_entry(from: &Path, to: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(from)?;
    if metadata.file_type().is_symlink() {
        let link = std::fs::read_link(from)?;
        if std::fs::symlink_metadata(to).is_ok() {
            std::fs::remove_file(to)?;
        }
        std::os::unix::fs::symlink(link, to)?;
    } else {
        std::fs::copy(from, to)?;
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
