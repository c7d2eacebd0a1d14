//! Fault taxonomy for replies crossing the gateway.

use serde::{Deserialize, Serialize};
use stevedore_core::error::ImageError;
use thiserror::Error;

/// The fixed set of failure kinds a caller can distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    NotFound,
    InUse,
    InvalidArgument,
    AuthFailed,
    NetworkError,
    StoreUnavailable,
    NotImplemented,
}

impl FaultKind {
    /// Map an engine error to exactly one fault kind.
    pub fn from_error(err: &ImageError) -> Self {
        match err {
            ImageError::NotFound(_) | ImageError::ContainerNotFound(_) => FaultKind::NotFound,
            ImageError::InUse { .. } => FaultKind::InUse,
            ImageError::InvalidArgument(_) | ImageError::Build(_) => FaultKind::InvalidArgument,
            ImageError::AuthFailed { .. } => FaultKind::AuthFailed,
            ImageError::Network { .. } => FaultKind::NetworkError,
            ImageError::NotImplemented(_) => FaultKind::NotImplemented,
            ImageError::PruneAborted { source, .. } => FaultKind::from_error(source),
            ImageError::StoreUnavailable(_)
            | ImageError::Io(_)
            | ImageError::Serialization(_)
            | ImageError::Other(_) => FaultKind::StoreUnavailable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::NotFound => "NotFound",
            FaultKind::InUse => "InUse",
            FaultKind::InvalidArgument => "InvalidArgument",
            FaultKind::AuthFailed => "AuthFailed",
            FaultKind::NetworkError => "NetworkError",
            FaultKind::StoreUnavailable => "StoreUnavailable",
            FaultKind::NotImplemented => "NotImplemented",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "NotFound" => FaultKind::NotFound,
            "InUse" => FaultKind::InUse,
            "InvalidArgument" => FaultKind::InvalidArgument,
            "AuthFailed" => FaultKind::AuthFailed,
            "NetworkError" => FaultKind::NetworkError,
            "StoreUnavailable" => FaultKind::StoreUnavailable,
            "NotImplemented" => FaultKind::NotImplemented,
            _ => return None,
        })
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault as received by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {reason}")]
pub struct Fault {
    pub kind: FaultKind,
    pub reason: String,
    /// Images removed before an aborted prune
    pub pruned: Vec<String>,
}

impl From<&ImageError> for Fault {
    fn from(err: &ImageError) -> Self {
        let pruned = match err {
            ImageError::PruneAborted { removed, .. } => removed.clone(),
            _ => Vec::new(),
        };
        Fault {
            kind: FaultKind::from_error(err),
            reason: err.to_string(),
            pruned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds() {
        let err = ImageError::NotFound("busybox".to_string());
        assert_eq!(FaultKind::from_error(&err), FaultKind::NotFound);
        let err = ImageError::ContainerNotFound("web".to_string());
        assert_eq!(FaultKind::from_error(&err), FaultKind::NotFound);
    }

    #[test]
    fn test_in_use_maps_to_in_use() {
        let err = ImageError::InUse {
            image: "abc".to_string(),
            containers: 1,
        };
        assert_eq!(FaultKind::from_error(&err), FaultKind::InUse);
    }

    #[test]
    fn test_build_failure_is_invalid_argument() {
        let err = ImageError::Build("RUN exited 2".to_string());
        assert_eq!(FaultKind::from_error(&err), FaultKind::InvalidArgument);
    }

    #[test]
    fn test_registry_errors() {
        let err = ImageError::AuthFailed {
            registry: "quay.io".to_string(),
            message: "denied".to_string(),
        };
        assert_eq!(FaultKind::from_error(&err), FaultKind::AuthFailed);
        let err = ImageError::network("quay.io", "connection refused");
        assert_eq!(FaultKind::from_error(&err), FaultKind::NetworkError);
    }

    #[test]
    fn test_io_maps_to_store_unavailable() {
        let err = ImageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(FaultKind::from_error(&err), FaultKind::StoreUnavailable);
    }

    #[test]
    fn test_prune_aborted_uses_root_kind_and_keeps_removed() {
        let err = ImageError::PruneAborted {
            removed: vec!["aaa".to_string()],
            source: Box::new(ImageError::StoreUnavailable("index".to_string())),
        };
        let fault = Fault::from(&err);
        assert_eq!(fault.kind, FaultKind::StoreUnavailable);
        assert_eq!(fault.pruned, vec!["aaa"]);
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            FaultKind::NotFound,
            FaultKind::InUse,
            FaultKind::InvalidArgument,
            FaultKind::AuthFailed,
            FaultKind::NetworkError,
            FaultKind::StoreUnavailable,
            FaultKind::NotImplemented,
        ] {
            assert_eq!(FaultKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FaultKind::parse("Timeout"), None);
    }
}
