//! Transport classification for image names.
//!
//! A name is matched against a closed set of scheme prefixes. The prefix
//! includes its delimiter, so `archive:/tmp/x.tar` is an archive while
//! `archive/tool:1` is an ordinary registry reference.

use std::path::PathBuf;

/// Where an image name points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Registry reference (`docker://` prefix optional)
    Registry(String),
    /// Docker-format tarball (`archive:` or `docker-archive:`)
    DockerArchive(PathBuf),
    /// Tarred OCI layout (`oci-archive:`)
    OciArchive(PathBuf),
    /// OCI layout directory (`oci:`)
    OciLayout(PathBuf),
}

#[derive(Clone, Copy)]
enum Scheme {
    Docker,
    DockerArchive,
    OciArchive,
    OciLayout,
}

const PREFIXES: &[(&str, Scheme)] = &[
    ("docker://", Scheme::Docker),
    ("docker-archive:", Scheme::DockerArchive),
    ("archive:", Scheme::DockerArchive),
    ("oci-archive:", Scheme::OciArchive),
    ("oci:", Scheme::OciLayout),
];

impl Transport {
    /// Classify a name by exact prefix; anything unmatched is a registry reference.
    pub fn resolve(name: &str) -> Transport {
        for (prefix, scheme) in PREFIXES {
            if let Some(rest) = name.strip_prefix(prefix) {
                return match scheme {
                    Scheme::Docker => Transport::Registry(rest.to_string()),
                    Scheme::DockerArchive => Transport::DockerArchive(PathBuf::from(rest)),
                    Scheme::OciArchive => Transport::OciArchive(PathBuf::from(rest)),
                    Scheme::OciLayout => Transport::OciLayout(PathBuf::from(rest)),
                };
            }
        }
        Transport::Registry(name.to_string())
    }

    /// Destination for a push or export: a non-empty explicit tag wins over
    /// the source name.
    pub fn push_destination(name: &str, explicit_tag: &str) -> Transport {
        if explicit_tag.is_empty() {
            Transport::resolve(name)
        } else {
            Transport::resolve(explicit_tag)
        }
    }

    /// Whether resolving this transport touches the network.
    pub fn is_remote(&self) -> bool {
        matches!(self, Transport::Registry(_))
    }

    /// Short transport name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Registry(_) => "docker",
            Transport::DockerArchive(_) => "docker-archive",
            Transport::OciArchive(_) => "oci-archive",
            Transport::OciLayout(_) => "oci",
        }
    }
}
