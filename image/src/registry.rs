//! Registry client: pull, push and search.
//!
//! Pull and push go through `oci-distribution`; search uses the registry's
//! v1 search endpoint directly.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oci_distribution::client::{
    Certificate, CertificateEncoding, ClientConfig, ClientProtocol, Config, ImageLayer,
};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use serde::{Deserialize, Serialize};
use stevedore_core::config::ImageFormat;
use stevedore_core::error::{ImageError, Result};

use crate::layout::{
    layer_media_type_for, strip_algorithm, write_index, BlobInfo, OciLayout, OCI_LAYOUT_MARKER,
};
use crate::reference::{ImageReference, DEFAULT_REGISTRY};

/// Per-call registry options. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// `user:password`
    pub creds: Option<String>,
    /// `None` keeps the client default (verify).
    pub tls_verify: Option<bool>,
    /// Directory of `*.crt` PEM roots
    pub cert_dir: Option<PathBuf>,
    pub signature_policy: Option<PathBuf>,
}

impl RegistryOptions {
    pub fn verify_tls(&self) -> bool {
        self.tls_verify.unwrap_or(true)
    }

    pub fn auth(&self) -> Result<RegistryAuth> {
        match self.creds.as_deref() {
            None | Some("") => Ok(RegistryAuth::anonymous()),
            Some(creds) => RegistryAuth::parse(creds),
        }
    }

    /// Fail early on a policy path that does not exist.
    pub fn check_signature_policy(&self) -> Result<()> {
        match &self.signature_policy {
            Some(path) if !path.exists() => Err(ImageError::InvalidArgument(format!(
                "Signature policy {} does not exist",
                path.display()
            ))),
            _ => Ok(()),
        }
    }
}

/// Signing options for push.
#[derive(Debug, Clone, Default)]
pub struct SigningOptions {
    /// Key identity to sign with; empty for unsigned pushes
    pub sign_by: String,
    pub remove_signatures: bool,
}

/// Authentication credentials for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Parse `user:password`. The password may contain colons.
    pub fn parse(creds: &str) -> Result<Self> {
        match creds.split_once(':') {
            Some((user, password)) if !user.is_empty() => Ok(Self::basic(user, password)),
            _ => Err(ImageError::InvalidArgument(
                "Credentials must be given as user:password".to_string(),
            )),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_official: bool,
    #[serde(default)]
    pub is_automated: bool,
    #[serde(default)]
    pub star_count: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

/// Remote registry operations.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Pull `reference` into a new OCI layout at `dest`.
    async fn pull(
        &self,
        reference: &ImageReference,
        dest: &Path,
        opts: &RegistryOptions,
    ) -> Result<OciLayout>;

    /// Push a layout to `reference` in the given manifest format. Returns the
    /// pushed manifest digest.
    async fn push(
        &self,
        layout: &OciLayout,
        reference: &ImageReference,
        format: ImageFormat,
        opts: &RegistryOptions,
        signing: &SigningOptions,
    ) -> Result<String>;

    /// Search one registry.
    async fn search(
        &self,
        registry: &str,
        term: &str,
        limit: usize,
        opts: &RegistryOptions,
    ) -> Result<Vec<SearchResult>>;
}

/// [`RegistryClient`] backed by `oci-distribution` and `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct OciRegistryClient {
    insecure_registries: Vec<String>,
}

impl OciRegistryClient {
    pub fn new(insecure_registries: Vec<String>) -> Self {
        Self {
            insecure_registries,
        }
    }

    fn client(&self, opts: &RegistryOptions) -> Result<Client> {
        let protocol = if self.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(self.insecure_registries.clone())
        };
        let config = ClientConfig {
            protocol,
            accept_invalid_certificates: !opts.verify_tls(),
            extra_root_certificates: load_certificates(opts.cert_dir.as_deref())?
                .into_iter()
                .map(|data| Certificate {
                    encoding: CertificateEncoding::Pem,
                    data,
                })
                .collect(),
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Ok(Client::new(config))
    }

    fn http_client(&self, opts: &RegistryOptions) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!opts.verify_tls());
        for pem in load_certificates(opts.cert_dir.as_deref())? {
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ImageError::InvalidArgument(format!("Invalid certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| ImageError::Other(format!("Failed to build HTTP client: {}", e)))
    }

    fn search_url(&self, registry: &str, term: &str, limit: usize) -> String {
        let host = if registry == DEFAULT_REGISTRY {
            "index.docker.io"
        } else {
            registry
        };
        let scheme = if self.insecure_registries.iter().any(|r| r == registry) {
            "http"
        } else {
            "https"
        };
        let mut url = format!("{}://{}/v1/search?q={}", scheme, host, encode_query(term));
        if limit > 0 {
            url.push_str(&format!("&n={}", limit));
        }
        url
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn pull(
        &self,
        reference: &ImageReference,
        dest: &Path,
        opts: &RegistryOptions,
    ) -> Result<OciLayout> {
        opts.check_signature_policy()?;
        let client = self.client(opts)?;
        let auth = opts.auth()?.to_oci_auth();
        let oci_ref = to_oci_reference(reference)?;
        let registry = reference.registry.as_str();

        tracing::info!(
            reference = %reference,
            target = %dest.display(),
            "Pulling image from registry"
        );

        let blobs_dir = dest.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir)?;

        let (manifest, _) = client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| classify(registry, "pull manifest", e))?;

        let mut config_data: Vec<u8> = Vec::new();
        client
            .pull_blob(&oci_ref, &manifest.config, &mut config_data)
            .await
            .map_err(|e| classify(registry, "pull config", e))?;
        std::fs::write(
            blobs_dir.join(strip_algorithm(&manifest.config.digest)),
            &config_data,
        )?;

        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            let mut layer_data: Vec<u8> = Vec::new();
            client
                .pull_blob(&oci_ref, layer, &mut layer_data)
                .await
                .map_err(|e| classify(registry, &format!("pull layer {}", layer.digest), e))?;
            std::fs::write(blobs_dir.join(strip_algorithm(&layer.digest)), &layer_data)?;
        }

        // Re-serialized, so the digest is of the bytes we store.
        let manifest_json = serde_json::to_vec(&manifest)?;
        let manifest_hex = crate::layout::sha256_bytes(&manifest_json);
        std::fs::write(blobs_dir.join(&manifest_hex), &manifest_json)?;
        write_index(
            dest,
            &BlobInfo {
                digest: format!("sha256:{}", manifest_hex),
                size: manifest_json.len() as u64,
                media_type: manifest
                    .media_type
                    .clone()
                    .unwrap_or_else(|| ImageFormat::Oci.manifest_media_type().to_string()),
            },
            &[reference.full_reference()],
        )?;
        std::fs::write(dest.join("oci-layout"), OCI_LAYOUT_MARKER)?;

        let layout = OciLayout::open(dest)?;
        tracing::info!(
            reference = %reference,
            digest = %layout.manifest_digest(),
            "Image pulled"
        );
        Ok(layout)
    }

    async fn push(
        &self,
        layout: &OciLayout,
        reference: &ImageReference,
        format: ImageFormat,
        opts: &RegistryOptions,
        signing: &SigningOptions,
    ) -> Result<String> {
        opts.check_signature_policy()?;
        if !signing.sign_by.is_empty() {
            return Err(ImageError::NotImplemented(
                "Signing pushed images".to_string(),
            ));
        }
        if signing.remove_signatures {
            tracing::debug!(reference = %reference, "Pushing without signatures");
        }

        let client = self.client(opts)?;
        let auth = opts.auth()?.to_oci_auth();
        let oci_ref = to_oci_reference(reference)?;

        tracing::info!(
            reference = %reference,
            source = %layout.root().display(),
            format = ?format,
            "Pushing image to registry"
        );

        let config_desc = layout.config_descriptor()?;
        let config = Config::new(
            layout.config_bytes()?,
            format.config_media_type().to_string(),
            None,
        );

        let mut layers = Vec::new();
        let mut layer_descriptors = Vec::new();
        for layer in layout.layers() {
            let data = std::fs::read(layout.blob_path(&layer.digest)).map_err(|e| {
                ImageError::StoreUnavailable(format!(
                    "Failed to read layer blob {}: {}",
                    layer.digest, e
                ))
            })?;
            let media_type = layer_media_type_for(&layer.media_type, format);
            tracing::debug!(digest = %layer.digest, size = data.len(), "Read layer for push");
            layer_descriptors.push(OciDescriptor {
                media_type: media_type.clone(),
                digest: layer.digest.clone(),
                size: layer.size as i64,
                ..Default::default()
            });
            layers.push(ImageLayer::new(data, media_type, None));
        }

        let manifest = OciImageManifest {
            schema_version: 2,
            media_type: Some(format.manifest_media_type().to_string()),
            config: OciDescriptor {
                media_type: format.config_media_type().to_string(),
                digest: config_desc.digest.clone(),
                size: config_desc.size as i64,
                ..Default::default()
            },
            layers: layer_descriptors,
            ..Default::default()
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let digest = format!("sha256:{}", crate::layout::sha256_bytes(&manifest_bytes));

        let response = client
            .push(&oci_ref, &layers, config, &auth, Some(manifest))
            .await
            .map_err(|e| classify(&reference.registry, "push image", e))?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Image pushed"
        );
        Ok(digest)
    }

    async fn search(
        &self,
        registry: &str,
        term: &str,
        limit: usize,
        opts: &RegistryOptions,
    ) -> Result<Vec<SearchResult>> {
        let url = self.search_url(registry, term, limit);
        tracing::debug!(registry, url = %url, "Searching registry");

        let auth = opts.auth()?;
        let mut request = self.http_client(opts)?.get(&url);
        if let (Some(u), Some(p)) = (&auth.username, &auth.password) {
            request = request.basic_auth(u, Some(p));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImageError::network(registry, e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ImageError::AuthFailed {
                registry: registry.to_string(),
                message: format!("search returned {}", status),
            });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ImageError::NotFound(format!(
                "search endpoint on {}",
                registry
            )));
        }
        if !status.is_success() {
            return Err(ImageError::network(
                registry,
                format!("search returned {}", status),
            ));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ImageError::network(registry, format!("bad search response: {}", e)))?;

        let mut results = body.results;
        if limit > 0 {
            results.truncate(limit);
        }
        Ok(results)
    }
}

/// Map an `oci-distribution` failure to the error taxonomy.
fn classify(registry: &str, action: &str, err: OciDistributionError) -> ImageError {
    let message = format!("Failed to {}: {}", action, err);
    match err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => ImageError::AuthFailed {
            registry: registry.to_string(),
            message,
        },
        OciDistributionError::ImageManifestNotFoundError(_) => ImageError::NotFound(message),
        OciDistributionError::ServerError { code: 404, .. } => ImageError::NotFound(message),
        OciDistributionError::ServerError { code: 401 | 403, .. } => ImageError::AuthFailed {
            registry: registry.to_string(),
            message,
        },
        _ => ImageError::network(registry, message),
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        ImageError::InvalidArgument(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// PEM bytes of every `*.crt` file in `cert_dir`.
fn load_certificates(cert_dir: Option<&Path>) -> Result<Vec<Vec<u8>>> {
    let Some(dir) = cert_dir else {
        return Ok(Vec::new());
    };
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ImageError::InvalidArgument(format!(
            "Cannot read certificate directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |ext| ext == "crt"))
        .collect();
    paths.sort();

    let mut certs = Vec::new();
    for path in paths {
        certs.push(std::fs::read(&path)?);
    }
    Ok(certs)
}

fn encode_query(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for b in term.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Selects the linux manifest for the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
