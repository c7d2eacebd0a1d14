//! Image API dispatch.
//!
//! Maps each call onto the image engine and its result onto a reply. Every
//! method answers with exactly one terminal reply; `BuildImage` called with
//! `more` may send partial log replies first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use stevedore_core::config::EngineConfig;
use stevedore_core::error::{ImageError, Result};
use stevedore_image::build::{BuildBackend, BuildDefaults, BuildEvent, BuildRequest};
use stevedore_image::{
    BuildOrchestrator, CommitEngine, CommitOptions, ContainerRuntime, ImagePuller, ImagePusher,
    ImageSearch, ImageStore, Importer, NativeBuilder, OciRegistryClient, PushOptions,
    RegistryClient, RegistryOptions, Runlabel, RunlabelRequest, SigningOptions,
    StateFileContainers,
};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::protocol::{Call, Reply};

/// The image API.
pub struct ImageService {
    store: Arc<ImageStore>,
    puller: Arc<ImagePuller>,
    pusher: ImagePusher,
    builds: BuildOrchestrator,
    committer: CommitEngine,
    importer: Importer,
    search: ImageSearch,
    runlabel: Runlabel,
    signature_policy: Option<PathBuf>,
}

impl ImageService {
    /// Wire the engine to the default collaborators: the OCI registry client,
    /// the container state file and the native build backend.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry = Arc::new(OciRegistryClient::new(config.insecure_registries.clone()));
        let runtime = Arc::new(StateFileContainers::new(config.container_state.clone()));
        Self::new(config, registry, runtime, |store, puller| -> Arc<dyn BuildBackend> {
            Arc::new(NativeBuilder::new(store, puller))
        })
    }

    /// Wire the engine to the given collaborators. `backend` receives the
    /// store and puller the service is built around.
    pub fn new<R, F>(
        config: &EngineConfig,
        registry: Arc<dyn RegistryClient>,
        runtime: Arc<R>,
        backend: F,
    ) -> Result<Self>
    where
        R: ContainerRuntime + 'static,
        F: FnOnce(Arc<ImageStore>, Arc<ImagePuller>) -> Arc<dyn BuildBackend>,
    {
        let store = Arc::new(ImageStore::new(&config.store_dir, runtime.clone())?);
        let puller = Arc::new(ImagePuller::new(store.clone(), registry.clone()));
        let defaults = BuildDefaults {
            pull_policy: config.default_pull_policy,
            format: config.default_format,
        };
        let builds = BuildOrchestrator::new(
            store.clone(),
            backend(store.clone(), puller.clone()),
            defaults,
        );

        Ok(Self {
            pusher: ImagePusher::new(store.clone(), registry.clone()),
            committer: CommitEngine::new(store.clone(), runtime, config.default_format),
            importer: Importer::new(store.clone(), config.default_format),
            search: ImageSearch::new(registry, config.registries.clone()),
            runlabel: Runlabel::new(puller.clone()),
            signature_policy: config.signature_policy_path.clone(),
            builds,
            puller,
            store,
        })
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    /// Handle one call, sending its replies to `replies`.
    ///
    /// A closed receiver does not stop the call; a build keeps running and
    /// registers its image.
    pub async fn handle(&self, call: Call, replies: &mpsc::UnboundedSender<Reply>) {
        let span = tracing::info_span!("call", method = %call.method);
        let method = call.method.clone();
        let reply = match self.dispatch(call, replies).instrument(span).await {
            Ok(parameters) => Reply::ok(parameters),
            Err(e) => {
                tracing::warn!(method = %method, error = %e, "Call failed");
                Reply::fault(&e)
            }
        };
        let _ = replies.send(reply);
    }

    /// Handle one call and collect every reply.
    pub async fn call(&self, call: Call) -> Vec<Reply> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.handle(call, &tx).await;
        drop(tx);
        let mut replies = Vec::new();
        while let Some(reply) = rx.recv().await {
            replies.push(reply);
        }
        replies
    }

    async fn dispatch(&self, call: Call, replies: &mpsc::UnboundedSender<Reply>) -> Result<Value> {
        let Call {
            method,
            parameters,
            more,
        } = call;

        match method.as_str() {
            "ListImages" => {
                let images = self.store.list().await?;
                Ok(json!({ "images": images }))
            }
            "GetImage" => {
                let p: NameParams = params(parameters)?;
                let image = self.store.summary(required(&p.name, "name")?).await?;
                Ok(json!({ "image": image }))
            }
            "InspectImage" => {
                let p: NameParams = params(parameters)?;
                let inspected = self.store.inspect(required(&p.name, "name")?).await?;
                Ok(json!({ "image": serde_json::to_string(&inspected)? }))
            }
            "HistoryImage" => {
                let p: NameParams = params(parameters)?;
                let history = self.store.history(required(&p.name, "name")?).await?;
                Ok(json!({ "history": history }))
            }
            "ImageExists" => {
                let p: NameParams = params(parameters)?;
                let exists = self.store.exists(required(&p.name, "name")?).await?;
                Ok(json!({ "exists": exists }))
            }
            "TagImage" => {
                let p: TagParams = params(parameters)?;
                let record = self
                    .store
                    .tag(required(&p.name, "name")?, required(&p.tagged, "tagged")?)
                    .await?;
                Ok(json!({ "image": record.id }))
            }
            "UntagImage" => {
                let p: UntagParams = params(parameters)?;
                let record = self
                    .store
                    .untag(required(&p.name, "name")?, required(&p.tag, "tag")?)
                    .await?;
                Ok(json!({ "image": record.id }))
            }
            "RemoveImage" => {
                let p: RemoveParams = params(parameters)?;
                let id = self.store.remove(required(&p.name, "name")?, p.force).await?;
                Ok(json!({ "image": id }))
            }
            "ImagesPrune" => {
                let pruned = self.store.prune().await?;
                Ok(json!({ "pruned": pruned }))
            }
            "PullImage" => {
                let p: PullParams = params(parameters)?;
                let opts = self.registry_options(
                    &p.creds,
                    p.tls_verify,
                    &p.cert_dir,
                    &p.signature_policy,
                );
                let record = self.puller.pull(required(&p.name, "name")?, &opts).await?;
                Ok(json!({ "id": record.id }))
            }
            "PushImage" => {
                let p: PushParams = params(parameters)?;
                let opts = PushOptions {
                    tag: p.tag.clone(),
                    format: p.format.clone(),
                    compress: p.compress,
                    registry: self.registry_options(
                        &p.creds,
                        p.tls_verify,
                        &p.cert_dir,
                        &p.signature_policy,
                    ),
                    signing: SigningOptions {
                        sign_by: p.sign_by.clone(),
                        remove_signatures: p.remove_signatures,
                    },
                };
                let record = self.pusher.push(required(&p.name, "name")?, &opts).await?;
                Ok(json!({ "image": record.id }))
            }
            "ExportImage" => {
                let p: ExportParams = params(parameters)?;
                let record = self
                    .pusher
                    .export(
                        required(&p.name, "name")?,
                        required(&p.destination, "destination")?,
                        p.compress,
                        &p.tags,
                    )
                    .await?;
                Ok(json!({ "image": record.id }))
            }
            "SearchImage" => {
                let p: SearchParams = params(parameters)?;
                let results = self
                    .search
                    .search(&p.name, p.limit, &RegistryOptions::default())
                    .await?;
                Ok(json!({ "results": results }))
            }
            "Commit" => {
                let p: CommitParams = params(parameters)?;
                let record = self
                    .committer
                    .commit(&CommitOptions {
                        container: required(&p.name, "name")?.to_string(),
                        image_name: p.image_name,
                        changes: p.changes,
                        author: p.author,
                        message: p.message,
                        pause: p.pause,
                        format: p.manifest_type,
                    })
                    .await?;
                Ok(json!({ "image": record.id }))
            }
            "ImportImage" => {
                let p: ImportParams = params(parameters)?;
                let record = self
                    .importer
                    .import(
                        required(&p.source, "source")?,
                        &p.reference,
                        &p.message,
                        &p.changes,
                    )
                    .await?;
                Ok(json!({ "image": record.id }))
            }
            "BuildImage" => {
                let p: BuildParams = params(parameters)?;
                self.build(&p.build, more, replies).await
            }
            "ContainerRunlabel" => {
                let p: RunlabelParams = params(parameters)?;
                let r = p.runlabel;
                let registry =
                    self.registry_options(&r.creds, r.tls_verify, &r.cert_dir, &r.signature_policy);
                self.runlabel
                    .run(&RunlabelRequest {
                        image: required(&r.image, "image")?.to_string(),
                        label: r.label,
                        name: r.name,
                        pull: r.pull,
                        registry,
                        extra_args: r.extra_args,
                        opts: r.opts,
                    })
                    .await?;
                Ok(json!({}))
            }
            "CreateImage" => Err(ImageError::NotImplemented("CreateImage".to_string())),
            other => Err(ImageError::NotImplemented(format!("method {}", other))),
        }
    }

    /// Drive a build, streaming log batches when the caller asked for them.
    /// The returned value is the terminal reply's parameters.
    async fn build(
        &self,
        request: &BuildRequest,
        more: bool,
        replies: &mpsc::UnboundedSender<Reply>,
    ) -> Result<Value> {
        let mut handle = self.builds.start(request)?;
        tracing::info!(build = %handle.id(), streaming = more, "Build accepted");

        let mut collected: Vec<String> = Vec::new();
        while let Some(event) = handle.next().await {
            match event? {
                BuildEvent::Logs(lines) if more => {
                    let _ = replies.send(Reply::partial(json!({ "logs": lines })));
                }
                BuildEvent::Logs(lines) => collected.extend(lines),
                BuildEvent::Finished { logs, image_id } => {
                    collected.extend(logs);
                    return Ok(json!({ "logs": collected, "id": image_id }));
                }
            }
        }
        Err(ImageError::Build("build ended without a result".to_string()))
    }

    fn registry_options(
        &self,
        creds: &str,
        tls_verify: Option<bool>,
        cert_dir: &str,
        signature_policy: &str,
    ) -> RegistryOptions {
        RegistryOptions {
            creds: non_empty(creds).map(String::from),
            tls_verify,
            cert_dir: non_empty(cert_dir).map(PathBuf::from),
            signature_policy: non_empty(signature_policy)
                .map(PathBuf::from)
                .or_else(|| self.signature_policy.clone()),
        }
    }
}

fn params<T: DeserializeOwned>(parameters: Value) -> Result<T> {
    let parameters = if parameters.is_null() {
        json!({})
    } else {
        parameters
    };
    serde_json::from_value(parameters)
        .map_err(|e| ImageError::InvalidArgument(format!("bad parameters: {}", e)))
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(ImageError::InvalidArgument(format!("{} is required", field)));
    }
    Ok(value)
}

fn non_empty(s: &str) -> Option<&str> {
    Some(s).filter(|s| !s.is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NameParams {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TagParams {
    name: String,
    tagged: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UntagParams {
    name: String,
    tag: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoveParams {
    name: String,
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PullParams {
    name: String,
    cert_dir: String,
    creds: String,
    signature_policy: String,
    tls_verify: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PushParams {
    name: String,
    tag: String,
    tls_verify: Option<bool>,
    signature_policy: String,
    creds: String,
    cert_dir: String,
    compress: bool,
    format: String,
    remove_signatures: bool,
    sign_by: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportParams {
    name: String,
    destination: String,
    compress: bool,
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchParams {
    name: String,
    limit: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommitParams {
    name: String,
    image_name: String,
    changes: Vec<String>,
    author: String,
    message: String,
    pause: bool,
    manifest_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImportParams {
    source: String,
    reference: String,
    message: String,
    changes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BuildParams {
    build: BuildRequest,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunlabelParams {
    runlabel: RunlabelInput,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunlabelInput {
    image: String,
    label: String,
    name: String,
    pull: bool,
    creds: String,
    tls_verify: Option<bool>,
    cert_dir: String,
    signature_policy: String,
    extra_args: Vec<String>,
    opts: HashMap<String, String>,
}
