//! Stevedore Image - image management engine.
//!
//! The local image store, transport classification, the registry client,
//! background builds with streamed logs, and the converters between
//! containers, tarballs, archives and images.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod build;
pub mod changes;
pub mod commit;
pub mod container;
pub mod import;
pub mod layout;
pub mod model;
pub mod pull;
pub mod push;
pub mod reference;
pub mod registry;
pub mod runlabel;
pub mod search;
pub mod store;
pub mod transport;

// Re-export common types
pub use build::{BuildBackend, BuildDefaults, BuildEvent, BuildHandle, BuildOrchestrator};
pub use build::{BuildRequest, NativeBuilder, ResourceLimits};
pub use commit::{CommitEngine, CommitOptions};
pub use container::{ContainerRecord, ContainerRuntime, ContainerUsage, StateFileContainers};
pub use import::Importer;
pub use layout::{LayoutBuilder, OciLayout};
pub use model::{HistoryEntry, ImageRecord, ImageSummary};
pub use pull::ImagePuller;
pub use push::{ImagePusher, ManifestFormat, PushOptions};
pub use reference::ImageReference;
pub use registry::{OciRegistryClient, RegistryClient, RegistryOptions, SearchResult, SigningOptions};
pub use runlabel::{Runlabel, RunlabelCommand, RunlabelRequest};
pub use search::ImageSearch;
pub use store::ImageStore;
pub use transport::Transport;
