//! OCI registry source.
//!
//! Resolution fetches only the manifest: its SHA-256 is the module digest,
//! so a tag that still points at a cached image costs one small request. The
//! layer blob is downloaded by the deferred payload.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{DeferredFetch, FetchContext, ModuleSource, Payload, Resolved};
use crate::digest::{is_sha256_hex, normalize_checksum, sha256_hex, SHA256_PREFIX};
use crate::error::{CacheError, CacheResult};
use crate::observer::FetchOutcome;
use crate::reference::ImageRef;
use crate::validate::file_from_tar_gz;

pub mod auth;
pub mod manifest;

use auth::{Challenge, Credentials};
use manifest::{accept_header, LayerFormat, Manifest, PLUGIN_FILE};

const CONTENT_DIGEST: &str = "docker-content-digest";

/// Pulls single-layer wasm images from OCI registries.
#[derive(Debug, Clone)]
pub struct OciSource {
    client: reqwest::Client,
}

impl OciSource {
    pub fn new() -> CacheResult<Self> {
        Ok(Self {
            client: super::http::build_client()?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ModuleSource for OciSource {
    async fn resolve(&self, url: &str, ctx: &FetchContext) -> CacheResult<Resolved> {
        let image = ImageRef::parse_url(url)?;
        let credentials = match &ctx.pull_secret {
            Some(secret) => Credentials::from_pull_secret(secret, &image.registry)?,
            None => None,
        };

        let mut session = RegistrySession {
            client: self.client.clone(),
            url: url.to_string(),
            base: format!(
                "{}://{}",
                if ctx.insecure { "http" } else { "https" },
                image.registry
            ),
            repository: image.repository.clone(),
            credentials,
            authorization: None,
            timeout: ctx.timeout,
        };

        let endpoint = format!("/v2/{}/manifests/{}", image.repository, image.reference());
        let response = session.get(&endpoint, Some(&accept_header())).await?;

        let advertised = header_str(&response, CONTENT_DIGEST).map(|d| normalize_checksum(&d));
        let content_type = header_str(&response, CONTENT_TYPE.as_str());
        let body = response
            .bytes()
            .await
            .map_err(|e| CacheError::fetch(url, format!("failed to read manifest: {}", e)))?;

        let computed = sha256_hex(&body);
        let digest = match advertised.filter(|d| is_sha256_hex(d)) {
            Some(advertised) if advertised != computed => {
                warn!(url, advertised = %advertised, computed = %computed, "registry digest header disagrees with manifest");
                return Err(CacheError::ChecksumMismatch {
                    url: url.to_string(),
                    expected: advertised,
                    actual: computed,
                });
            }
            Some(advertised) => advertised,
            None => computed,
        };

        if let Some(pinned) = &image.digest {
            if pinned != &digest {
                return Err(CacheError::ChecksumMismatch {
                    url: url.to_string(),
                    expected: pinned.clone(),
                    actual: digest,
                });
            }
        }

        let manifest = Manifest::parse(url, &body, content_type.as_deref())?;
        let (layer, format) = manifest.module_layer(url)?;
        let layer_digest = normalize_checksum(&layer.digest);
        if !is_sha256_hex(&layer_digest) {
            return Err(CacheError::fetch(
                url,
                format!("unsupported layer digest {}", layer.digest),
            ));
        }

        debug!(url, digest = %digest, layer = %layer_digest, ?format, "resolved image manifest");

        Ok(Resolved {
            digest,
            payload: Payload::Deferred(Box::new(LayerFetch {
                session,
                layer_digest,
                format,
            })),
        })
    }

    fn resolve_failure(&self) -> FetchOutcome {
        FetchOutcome::ManifestFailure
    }
}

/// Layer download, run only when the module is not cached.
struct LayerFetch {
    session: RegistrySession,
    layer_digest: String,
    format: LayerFormat,
}

#[async_trait]
impl DeferredFetch for LayerFetch {
    async fn fetch(self: Box<Self>) -> CacheResult<Vec<u8>> {
        let LayerFetch {
            mut session,
            layer_digest,
            format,
        } = *self;

        let endpoint = format!(
            "/v2/{}/blobs/{}{}",
            session.repository, SHA256_PREFIX, layer_digest
        );
        let response = session.get(&endpoint, None).await?;
        let blob = response
            .bytes()
            .await
            .map_err(|e| CacheError::fetch(&session.url, format!("failed to read layer: {}", e)))?;

        let actual = sha256_hex(&blob);
        if actual != layer_digest {
            return Err(CacheError::ChecksumMismatch {
                url: session.url,
                expected: layer_digest,
                actual,
            });
        }

        match format {
            LayerFormat::Wasm => Ok(blob.to_vec()),
            LayerFormat::TarGz => {
                file_from_tar_gz(&blob, PLUGIN_FILE).map_err(|e| CacheError::InvalidModule {
                    url: session.url,
                    reason: format!("could not extract {}: {}", PLUGIN_FILE, e),
                })
            }
        }
    }
}

/// Connection state for one image: base URL and negotiated authorization.
struct RegistrySession {
    client: reqwest::Client,
    url: String,
    base: String,
    repository: String,
    credentials: Option<Credentials>,
    authorization: Option<String>,
    timeout: Duration,
}

impl RegistrySession {
    /// GET `endpoint`, answering one auth challenge if the registry sends it.
    async fn get(&mut self, endpoint: &str, accept: Option<&str>) -> CacheResult<reqwest::Response> {
        let mut response = self.send(endpoint, accept).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = header_str(&response, WWW_AUTHENTICATE.as_str());
            self.authorize(challenge.as_deref()).await?;
            response = self.send(endpoint, accept).await?;
        }

        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(response),
            401 | 403 => Err(CacheError::fetch(
                &self.url,
                format!("registry denied access: HTTP {}", status),
            )),
            404 => Err(CacheError::fetch(
                &self.url,
                format!("{} not found: HTTP {}", endpoint, status),
            )),
            _ => Err(CacheError::fetch(&self.url, format!("HTTP {}", status))),
        }
    }

    async fn send(&self, endpoint: &str, accept: Option<&str>) -> CacheResult<reqwest::Response> {
        let mut request = self.client.get(format!("{}{}", self.base, endpoint));
        if !self.timeout.is_zero() {
            request = request.timeout(self.timeout);
        }
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(authorization) = &self.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                CacheError::Timeout {
                    url: self.url.clone(),
                    timeout: self.timeout,
                }
            } else {
                CacheError::fetch(&self.url, e)
            }
        })
    }

    async fn authorize(&mut self, challenge: Option<&str>) -> CacheResult<()> {
        match challenge.and_then(Challenge::parse) {
            Some(Challenge::Basic) => {
                let credentials = self.credentials.as_ref().ok_or_else(|| {
                    CacheError::fetch(&self.url, "registry requires credentials")
                })?;
                self.authorization = Some(credentials.basic());
            }
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let scope =
                    scope.unwrap_or_else(|| format!("repository:{}:pull", self.repository));
                let token = auth::fetch_token(
                    &self.client,
                    &realm,
                    service.as_deref(),
                    &scope,
                    self.credentials.as_ref(),
                    self.timeout,
                )
                .await?;
                self.authorization = Some(format!("Bearer {}", token));
            }
            None => {
                return Err(CacheError::fetch(
                    &self.url,
                    "registry requires authentication but sent no usable challenge",
                ))
            }
        }
        Ok(())
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
