//! Shared fixtures for gateway tests: in-memory registry, container runtime
//! and build backend around a real on-disk store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use stevedore_core::config::{EngineConfig, ImageFormat};
use stevedore_core::error::{ImageError, Result};
use stevedore_gateway::{Call, Fault, ImageService, Reply};
use stevedore_image::build::{BuildBackend, BuildLog, BuildPlan, CancellationToken};
use stevedore_image::layout::{compute_diff_id, copy_dir_recursive, tar_gz_dir};
use stevedore_image::{
    ContainerRecord, ContainerRuntime, ContainerUsage, ImageRecord, ImageReference, ImageStore,
    LayoutBuilder, OciLayout, RegistryClient, RegistryOptions, SearchResult, SigningOptions,
};

/// Writes a one-layer OCI layout whose config carries `variant` as a label.
pub fn write_layout(dir: &Path, variant: &str) -> OciLayout {
    let rootfs = dir.join("rootfs");
    std::fs::create_dir_all(&rootfs).unwrap();
    std::fs::write(rootfs.join(format!("{}.txt", variant)), variant).unwrap();
    let layer = dir.join("layer.tar.gz");
    tar_gz_dir(&rootfs, &layer).unwrap();

    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "created": "2024-05-01T12:00:00Z",
        "config": { "Labels": { "variant": variant } },
        "rootfs": { "type": "layers", "diff_ids": [compute_diff_id(&layer).unwrap()] },
        "history": [{ "created": "2024-05-01T12:00:00Z", "created_by": format!("ADD {}.txt", variant) }]
    });
    let mut builder = LayoutBuilder::create(dir.join("layout")).unwrap();
    builder
        .add_layer_file(&layer, ImageFormat::Oci.layer_media_type())
        .unwrap();
    builder.finish(&config, ImageFormat::Oci, &[]).unwrap()
}

/// Registry serving fixed layouts and canned search results.
#[derive(Default)]
pub struct FakeRegistry {
    pub layouts: Mutex<HashMap<String, PathBuf>>,
    /// Per registry: hits, or `None` to fail
    pub search_hits: Mutex<HashMap<String, Option<Vec<SearchResult>>>>,
    pub pulls: Mutex<Vec<String>>,
    pub pushes: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn hit(name: &str) -> SearchResult {
        SearchResult {
            name: name.to_string(),
            description: String::new(),
            is_official: false,
            is_automated: false,
            star_count: 1,
        }
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn pull(
        &self,
        reference: &ImageReference,
        dest: &Path,
        _opts: &RegistryOptions,
    ) -> Result<OciLayout> {
        let name = reference.full_reference();
        self.pulls.lock().push(name.clone());
        let source = self
            .layouts
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(name.clone()))?;
        copy_dir_recursive(&source, dest)?;
        OciLayout::open(dest)
    }

    async fn push(
        &self,
        _layout: &OciLayout,
        reference: &ImageReference,
        _format: ImageFormat,
        _opts: &RegistryOptions,
        signing: &SigningOptions,
    ) -> Result<String> {
        if !signing.sign_by.is_empty() {
            return Err(ImageError::NotImplemented("signing".to_string()));
        }
        self.pushes.lock().push(reference.full_reference());
        Ok("sha256:pushed".to_string())
    }

    async fn search(
        &self,
        registry: &str,
        _term: &str,
        _limit: usize,
        _opts: &RegistryOptions,
    ) -> Result<Vec<SearchResult>> {
        match self.search_hits.lock().get(registry) {
            Some(Some(hits)) => Ok(hits.clone()),
            _ => Err(ImageError::network(registry, "connection refused")),
        }
    }
}

/// Containers kept in memory.
#[derive(Default)]
pub struct FakeRuntime {
    pub containers: Mutex<Vec<ContainerRecord>>,
    /// Directory exported as every container's diff; `None` fails the export
    pub diff_source: Mutex<Option<PathBuf>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn add(&self, id: &str, image_id: &str) {
        self.containers.lock().push(ContainerRecord {
            id: id.to_string(),
            name: id.to_string(),
            image_id: image_id.to_string(),
            rootfs: PathBuf::from("/nonexistent"),
            pid: None,
            status: "running".to_string(),
        });
    }

    pub fn status(&self, id: &str) -> String {
        self.containers
            .lock()
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.status.clone())
            .unwrap_or_default()
    }

    fn set_status(&self, id: &str, status: &str) {
        if let Some(c) = self.containers.lock().iter_mut().find(|c| c.id == id) {
            c.status = status.to_string();
        }
    }
}

impl ContainerUsage for FakeRuntime {
    fn containers_using(&self, image_id: &str) -> Result<Vec<String>> {
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|c| c.image_id == image_id)
            .map(|c| c.id.clone())
            .collect())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn lookup(&self, name_or_id: &str) -> Result<ContainerRecord> {
        self.containers
            .lock()
            .iter()
            .find(|c| c.id == name_or_id || c.name == name_or_id)
            .cloned()
            .ok_or_else(|| ImageError::ContainerNotFound(name_or_id.to_string()))
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.calls.lock().push(format!("pause {}", id));
        self.set_status(id, "paused");
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.calls.lock().push(format!("unpause {}", id));
        self.set_status(id, "running");
        Ok(())
    }

    async fn export_diff(&self, id: &str, output: &Path) -> Result<()> {
        self.calls.lock().push(format!("export {}", id));
        let source = self.diff_source.lock().clone();
        match source {
            Some(dir) => tar_gz_dir(&dir, output),
            None => Err(ImageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "diff capture failed",
            ))),
        }
    }
}

/// Build backend that logs a fixed script and registers a small image.
pub struct FakeBackend {
    store: Arc<ImageStore>,
}

#[async_trait]
impl BuildBackend for FakeBackend {
    async fn build(
        &self,
        plan: &BuildPlan,
        log: &mut BuildLog,
        _cancel: CancellationToken,
    ) -> Result<String> {
        log.line("STEP 1/3: FROM scratch");
        tokio::task::yield_now().await;
        log.line("STEP 2/3: COPY app /app");
        log.write("copying ");
        tokio::task::yield_now().await;
        log.write("1 file\nSTEP 3/3: LABEL built=yes\n");
        if plan.build_args.contains_key("FAIL") {
            return Err(ImageError::Build("RUN exited 1".to_string()));
        }
        let scratch = tempfile::tempdir()?;
        let layout = write_layout(scratch.path(), "built");
        let record = self.store.register(&layout, &plan.tags, None).await?;
        log.write("COMMIT");
        Ok(record.id)
    }
}

/// A service wired to the fakes over a temporary store.
pub struct Harness {
    pub tmp: TempDir,
    pub service: Arc<ImageService>,
    pub registry: Arc<FakeRegistry>,
    pub runtime: Arc<FakeRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registries(&["docker.io"])
    }

    pub fn with_registries(registries: &[&str]) -> Self {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig {
            store_dir: tmp.path().join("store"),
            container_state: tmp.path().join("containers.json"),
            socket: tmp.path().join("stevedore.sock"),
            registries: registries.iter().map(|r| r.to_string()).collect(),
            ..EngineConfig::default()
        };
        let registry = Arc::new(FakeRegistry::default());
        let runtime = Arc::new(FakeRuntime::default());
        let service = ImageService::new(
            &config,
            registry.clone(),
            runtime.clone(),
            |store, _puller| -> Arc<dyn BuildBackend> { Arc::new(FakeBackend { store }) },
        )
        .unwrap();
        Self {
            tmp,
            service: Arc::new(service),
            registry,
            runtime,
        }
    }

    /// Store an image labelled `variant` under `names`.
    pub async fn seed(&self, variant: &str, names: &[&str]) -> ImageRecord {
        let layout = write_layout(&self.tmp.path().join(format!("seed-{}", variant)), variant);
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        self.service
            .store()
            .register(&layout, &names, None)
            .await
            .unwrap()
    }

    pub async fn replies(&self, call: Call) -> Vec<Reply> {
        self.service.call(call).await
    }

    /// Make a single-reply call.
    pub async fn call(&self, method: &str, parameters: Value) -> std::result::Result<Value, Fault> {
        let mut replies = self.replies(Call::new(method, parameters)).await;
        assert_eq!(replies.len(), 1, "{} sent {} replies", method, replies.len());
        let reply = replies.remove(0);
        assert!(!reply.continues);
        reply.into_result()
    }

    /// IDs currently listed, sorted.
    pub async fn listed_ids(&self) -> Vec<String> {
        let images = self.call("ListImages", json!({})).await.unwrap();
        let mut ids: Vec<String> = images["images"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    }
}
