use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ImageError, Result};

/// Engine configuration, loaded from YAML.
///
/// Every field has a default so a partial (or missing) file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the image store (OCI layouts + index)
    pub store_dir: PathBuf,

    /// State file describing known containers
    pub container_state: PathBuf,

    /// Unix socket the gateway listens on
    pub socket: PathBuf,

    /// Registries consulted by search, in order
    pub registries: Vec<String>,

    /// Registries reached over plain HTTP / without certificate checks
    pub insecure_registries: Vec<String>,

    /// Default signature policy file threaded through pull and push
    pub signature_policy_path: Option<PathBuf>,

    /// Pull policy applied to builds that do not specify one
    pub default_pull_policy: PullPolicy,

    /// Image format applied to builds and commits that do not specify one
    pub default_format: ImageFormat,

    /// Log level used when RUST_LOG is unset
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = stevedore_home();
        Self {
            store_dir: home.join("images"),
            container_state: home.join("containers.json"),
            socket: home.join("stevedore.sock"),
            registries: vec!["docker.io".to_string()],
            insecure_registries: Vec::new(),
            signature_policy_path: None,
            default_pull_policy: PullPolicy::Never,
            default_format: ImageFormat::Oci,
            log_level: LogLevel::Info,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|e| {
            ImageError::Other(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    /// Whether TLS verification is disabled for the given registry.
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// Base directory for stevedore state (~/.stevedore).
pub fn stevedore_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stevedore")
}

/// When a build should contact a registry for its base images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Only use images already in the store
    Never,
    /// Pull when the image is not in the store
    IfMissing,
    /// Always pull
    Always,
}

impl std::str::FromStr for PullPolicy {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(PullPolicy::Never),
            "missing" | "if-missing" | "ifmissing" => Ok(PullPolicy::IfMissing),
            "always" => Ok(PullPolicy::Always),
            other => Err(ImageError::InvalidArgument(format!(
                "unknown pull policy {:?}",
                other
            ))),
        }
    }
}

/// Output image format for builds and commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Oci,
    Docker,
}

impl ImageFormat {
    /// Parse a format token. Empty means "use the default"; tokens are
    /// matched by prefix so `oci-archive`-style spellings still resolve.
    pub fn parse_or(token: &str, default: ImageFormat) -> Result<Self> {
        if token.is_empty() {
            return Ok(default);
        }
        if token.starts_with("oci") {
            Ok(ImageFormat::Oci)
        } else if token.starts_with("docker") {
            Ok(ImageFormat::Docker)
        } else {
            Err(ImageError::InvalidArgument(format!(
                "unrecognized image type {:?}",
                token
            )))
        }
    }

    /// Manifest media type produced for this format.
    pub fn manifest_media_type(self) -> &'static str {
        match self {
            ImageFormat::Oci => "application/vnd.oci.image.manifest.v1+json",
            ImageFormat::Docker => "application/vnd.docker.distribution.manifest.v2+json",
        }
    }

    /// Config media type produced for this format.
    pub fn config_media_type(self) -> &'static str {
        match self {
            ImageFormat::Oci => "application/vnd.oci.image.config.v1+json",
            ImageFormat::Docker => "application/vnd.docker.container.image.v1+json",
        }
    }

    /// Layer media type produced for this format.
    pub fn layer_media_type(self) -> &'static str {
        match self {
            ImageFormat::Oci => "application/vnd.oci.image.layer.v1.tar+gzip",
            ImageFormat::Docker => "application/vnd.docker.image.rootfs.diff.tar.gzip",
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.registries, vec!["docker.io".to_string()]);
        assert_eq!(config.default_pull_policy, PullPolicy::Never);
        assert_eq!(config.default_format, ImageFormat::Oci);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.store_dir.ends_with(".stevedore/images"));
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(&tmp.path().join("absent.yaml")).unwrap();
        assert_eq!(config.default_pull_policy, PullPolicy::Never);
    }

    #[test]
    fn test_load_partial_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            "registries:\n  - quay.io\n  - docker.io\ndefault_pull_policy: if-missing\ndefault_format: docker\nlog_level: debug\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.registries, vec!["quay.io", "docker.io"]);
        assert_eq!(config.default_pull_policy, PullPolicy::IfMissing);
        assert_eq!(config.default_format, ImageFormat::Docker);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(config.insecure_registries.is_empty());
    }

    #[test]
    fn test_load_invalid_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "registries: [unterminated").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ImageError::Serialization(_)));
    }

    #[test]
    fn test_is_insecure() {
        let config = EngineConfig {
            insecure_registries: vec!["localhost:5000".to_string()],
            ..Default::default()
        };
        assert!(config.is_insecure("localhost:5000"));
        assert!(!config.is_insecure("docker.io"));
    }

    #[test]
    fn test_pull_policy_from_str() {
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert_eq!("missing".parse::<PullPolicy>().unwrap(), PullPolicy::IfMissing);
        assert_eq!("Always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }

    #[test]
    fn test_image_format_parse() {
        assert_eq!(ImageFormat::parse_or("", ImageFormat::Oci).unwrap(), ImageFormat::Oci);
        assert_eq!(
            ImageFormat::parse_or("", ImageFormat::Docker).unwrap(),
            ImageFormat::Docker
        );
        assert_eq!(ImageFormat::parse_or("oci", ImageFormat::Docker).unwrap(), ImageFormat::Oci);
        assert_eq!(
            ImageFormat::parse_or("docker", ImageFormat::Oci).unwrap(),
            ImageFormat::Docker
        );
        let err = ImageFormat::parse_or("bogus", ImageFormat::Oci).unwrap_err();
        assert!(matches!(err, ImageError::InvalidArgument(_)));
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
    }
}
