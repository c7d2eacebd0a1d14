//! Image builds from Dockerfiles.
//!
//! A [`BuildRequest`] is validated into a [`BuildPlan`] before anything runs;
//! the [`BuildOrchestrator`] then drives a [`BuildBackend`] in the background
//! and streams its log lines to the caller.

pub mod dockerfile;
pub mod engine;
pub mod layer;
pub mod log;
pub mod orchestrator;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stevedore_core::config::{ImageFormat, PullPolicy};
use stevedore_core::error::{ImageError, Result};
use stevedore_core::units::parse_optional_ram_bytes;

use crate::reference::ImageReference;

pub use engine::NativeBuilder;
pub use tokio_util::sync::CancellationToken;
pub use log::BuildLog;
pub use orchestrator::{BuildEvent, BuildHandle, BuildOrchestrator};

/// Runs a validated build.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Build the image described by `plan`, writing progress to `log`.
    /// Returns the ID of the stored image.
    async fn build(
        &self,
        plan: &BuildPlan,
        log: &mut BuildLog,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Resource limits for `RUN` steps, as requested. [`BuildRequest::validate`]
/// rejects the ones the native builder cannot enforce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Human-readable size, e.g. "512m"
    pub memory: String,
    /// Human-readable size, or "-1" for unlimited
    pub memory_swap: String,
    pub cpu_period: u64,
    pub cpu_quota: i64,
    pub cpu_shares: u64,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
    pub shm_size: String,
    pub ulimits: Vec<String>,
    pub volumes: Vec<String>,
    pub add_hosts: Vec<String>,
    pub cgroup_parent: String,
}

impl ResourceLimits {
    /// Fail on settings that need cgroups or mounts, which `RUN` steps do
    /// not get.
    fn check_supported(&self) -> Result<()> {
        let unsupported: Vec<&str> = [
            ("shm_size", !self.shm_size.trim().is_empty()),
            ("cpu_period", self.cpu_period != 0),
            ("cpu_quota", self.cpu_quota > 0),
            ("cpu_shares", self.cpu_shares != 0),
            ("cpuset_mems", !self.cpuset_mems.trim().is_empty()),
            ("volumes", !self.volumes.is_empty()),
            ("add_hosts", !self.add_hosts.is_empty()),
            ("cgroup_parent", !self.cgroup_parent.trim().is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect();

        if unsupported.is_empty() {
            Ok(())
        } else {
            Err(ImageError::NotImplemented(format!(
                "build options not supported by the native builder: {}",
                unsupported.join(", ")
            )))
        }
    }
}

/// A build as requested over the API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildRequest {
    /// Empty means "directory of the first local Dockerfile"
    pub context_dir: String,
    /// Paths (absolute or relative to the context) or http(s) URLs
    pub dockerfiles: Vec<String>,
    pub build_args: HashMap<String, String>,
    pub resources: ResourceLimits,
    /// Network namespace for `RUN`: "" or "host", or "none"
    pub network: String,
    pub pull_policy: Option<PullPolicy>,
    /// "", "oci" or "docker"
    pub output_format: String,
    pub tags: Vec<String>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub squash: bool,
}

/// Where a Dockerfile comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerfileSource {
    Path(PathBuf),
    Url(String),
}

/// Swap limit for `RUN` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapLimit {
    Unlimited,
    Bytes(u64),
}

/// Network namespace of `RUN` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Host,
    /// A fresh namespace with only loopback
    None,
}

impl std::str::FromStr for NetworkMode {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            other => Err(ImageError::NotImplemented(format!(
                "build network mode {:?}",
                other
            ))),
        }
    }
}

/// Highest CPU index accepted in a cpuset.
const MAX_CPUS: usize = 1024;

/// Parse a cpuset list such as `0-2,4`.
pub fn parse_cpuset(s: &str) -> Result<Vec<usize>> {
    let invalid = || ImageError::InvalidArgument(format!("invalid cpuset {:?}", s));
    let mut cpus = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parse = |v: &str| {
            v.trim()
                .parse::<usize>()
                .ok()
                .filter(|cpu| *cpu < MAX_CPUS)
                .ok_or_else(invalid)
        };
        let (first, last) = match part.split_once('-') {
            Some((first, last)) => (parse(first)?, parse(last)?),
            None => {
                let cpu = parse(part)?;
                (cpu, cpu)
            }
        };
        if first > last {
            return Err(invalid());
        }
        cpus.extend(first..=last);
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// A parsed `name=soft[:hard]` resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: u64,
    pub hard: u64,
}

const ULIMIT_NAMES: &[&str] = &[
    "core", "cpu", "data", "fsize", "locks", "memlock", "nofile", "nproc", "stack",
];

impl std::str::FromStr for Ulimit {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ImageError::InvalidArgument(format!("invalid ulimit {:?}", s));
        let (name, values) = s.split_once('=').ok_or_else(invalid)?;
        let name = ULIMIT_NAMES
            .iter()
            .copied()
            .find(|n| *n == name.trim())
            .ok_or_else(invalid)?;
        let parse = |v: &str| v.trim().parse::<u64>().map_err(|_| invalid());
        let (soft, hard) = match values.split_once(':') {
            Some((soft, hard)) => (parse(soft)?, parse(hard)?),
            None => {
                let v = parse(values)?;
                (v, v)
            }
        };
        if soft > hard {
            return Err(invalid());
        }
        Ok(Ulimit { name, soft, hard })
    }
}

impl BuildPlan {
    /// Address-space cap for `RUN` children. With both limits set, memory is
    /// the tighter bound on memory plus swap.
    pub fn address_space_limit(&self) -> Option<u64> {
        match (self.memory, self.memory_swap) {
            (Some(memory), _) => Some(memory),
            (None, Some(SwapLimit::Bytes(total))) => Some(total),
            (None, _) => None,
        }
    }
}

/// A validated build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub context_dir: PathBuf,
    pub dockerfiles: Vec<DockerfileSource>,
    pub build_args: HashMap<String, String>,
    pub memory: Option<u64>,
    pub memory_swap: Option<SwapLimit>,
    /// CPUs `RUN` steps may be scheduled on; empty means any
    pub cpuset: Vec<usize>,
    pub ulimits: Vec<Ulimit>,
    pub network: NetworkMode,
    pub pull_policy: PullPolicy,
    pub format: ImageFormat,
    pub tags: Vec<String>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub squash: bool,
}

/// Engine-wide build defaults.
#[derive(Debug, Clone, Copy)]
pub struct BuildDefaults {
    pub pull_policy: PullPolicy,
    pub format: ImageFormat,
}

impl Default for BuildDefaults {
    fn default() -> Self {
        Self {
            pull_policy: PullPolicy::Never,
            format: ImageFormat::Oci,
        }
    }
}

impl BuildRequest {
    /// Check everything that can be checked without running the build.
    pub fn validate(&self, defaults: BuildDefaults) -> Result<BuildPlan> {
        let format = ImageFormat::parse_or(&self.output_format, defaults.format)?;

        if self.dockerfiles.is_empty() {
            return Err(ImageError::InvalidArgument(
                "at least one Dockerfile is required".to_string(),
            ));
        }

        let memory = parse_optional_ram_bytes(&self.resources.memory)?;
        let memory_swap = match self.resources.memory_swap.trim() {
            "-1" => Some(SwapLimit::Unlimited),
            other => parse_optional_ram_bytes(other)?.map(SwapLimit::Bytes),
        };
        if let (Some(memory), Some(SwapLimit::Bytes(swap))) = (memory, memory_swap) {
            if swap < memory {
                return Err(ImageError::InvalidArgument(
                    "memory-swap must be at least as large as memory".to_string(),
                ));
            }
        }
        let cpuset = parse_cpuset(&self.resources.cpuset_cpus)?;
        let ulimits = self
            .resources
            .ulimits
            .iter()
            .map(|u| u.parse())
            .collect::<Result<Vec<Ulimit>>>()?;
        let network = self.network.parse()?;
        self.resources.check_supported()?;

        for tag in &self.tags {
            let reference = ImageReference::parse(tag)?;
            if reference.digest.is_some() {
                return Err(ImageError::InvalidArgument(format!(
                    "cannot tag a build with digest reference {}",
                    tag
                )));
            }
        }

        let context_dir = self.resolve_context()?;
        let dockerfiles = self
            .dockerfiles
            .iter()
            .map(|d| resolve_dockerfile(d, &context_dir))
            .collect::<Result<Vec<_>>>()?;

        Ok(BuildPlan {
            context_dir,
            dockerfiles,
            build_args: self.build_args.clone(),
            memory,
            memory_swap,
            cpuset,
            ulimits,
            network,
            pull_policy: self.pull_policy.unwrap_or(defaults.pull_policy),
            format,
            tags: self.tags.clone(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            squash: self.squash,
        })
    }

    /// The explicit context directory, or the directory holding the first
    /// local Dockerfile.
    fn resolve_context(&self) -> Result<PathBuf> {
        let context = if self.context_dir.is_empty() {
            let first_local = self
                .dockerfiles
                .iter()
                .find(|d| !is_url(d))
                .ok_or_else(|| {
                    ImageError::InvalidArgument(
                        "a context directory is required when every Dockerfile is a URL"
                            .to_string(),
                    )
                })?;
            Path::new(first_local)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            PathBuf::from(&self.context_dir)
        };

        if !context.is_dir() {
            return Err(ImageError::InvalidArgument(format!(
                "build context {} is not a directory",
                context.display()
            )));
        }
        Ok(context)
    }
}

fn resolve_dockerfile(raw: &str, context: &Path) -> Result<DockerfileSource> {
    if is_url(raw) {
        return Ok(DockerfileSource::Url(raw.to_string()));
    }
    let path = Path::new(raw);
    let candidates = [path.to_path_buf(), context.join(path)];
    candidates
        .into_iter()
        .find(|p| p.is_file())
        .map(DockerfileSource::Path)
        .ok_or_else(|| ImageError::InvalidArgument(format!("Dockerfile {} not found", raw)))
}

pub(crate) fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}
