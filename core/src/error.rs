use thiserror::Error;

/// Stevedore image engine error types
#[derive(Error, Debug)]
pub enum ImageError {
    /// No image matches the given name or ID
    #[error("Image not found: {0}")]
    NotFound(String),

    /// No container matches the given name or ID
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Image is referenced by containers and removal was not forced
    #[error("Image {image} is in use by {containers} container(s)")]
    InUse { image: String, containers: usize },

    /// Caller supplied a malformed or unsupported value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Registry rejected the supplied credentials
    #[error("Authentication failed: {registry} - {message}")]
    AuthFailed { registry: String, message: String },

    /// Registry could not be reached or answered with a transport failure
    #[error("Registry error: {registry} - {message}")]
    Network { registry: String, message: String },

    /// Backing store could not be read or written
    #[error("Image store unavailable: {0}")]
    StoreUnavailable(String),

    /// Operation exists in the API but has no implementation
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Build step failed
    #[error("Build error: {0}")]
    Build(String),

    /// Prune stopped at the first failure
    #[error("Prune aborted after removing {} image(s): {source}", removed.len())]
    PruneAborted {
        removed: Vec<String>,
        #[source]
        source: Box<ImageError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ImageError {
    /// Shorthand for a registry transport failure.
    pub fn network(registry: impl Into<String>, message: impl Into<String>) -> Self {
        ImageError::Network {
            registry: registry.into(),
            message: message.into(),
        }
    }

    /// Walk through wrapper variants to the error that actually occurred.
    pub fn root(&self) -> &ImageError {
        match self {
            ImageError::PruneAborted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        ImageError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ImageError {
    fn from(err: serde_yaml::Error) -> Self {
        ImageError::Serialization(err.to_string())
    }
}

/// Result type alias for image engine operations
pub type Result<T> = std::result::Result<T, ImageError>;
