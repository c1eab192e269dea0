use std::sync::Arc;

use http::Uri;
use secret::SecretResolver;
use upstream_client::uri::{IntoUri as _, UriExtension as _};
use upstream_client::{Credentials, UpstreamClient, UpstreamError};

use super::{RemoteAdapter, RemoteArtifact, RemoteRequest, sparse_index_path};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::SUPPORTED_MEDIA_TYPES;
use crate::model::{UpstreamProxyConfig, UpstreamSource};

const CRATES_IO_DOWNLOADS: &str = "https://static.crates.io/crates";

/// Fetches over HTTP with [`UpstreamClient`], resolving credentials per request.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: UpstreamClient,
    secrets: Arc<dyn SecretResolver>,
}

impl HttpRemote {
    /// Create an adapter.
    pub fn new(client: UpstreamClient, secrets: Arc<dyn SecretResolver>) -> Self {
        Self { client, secrets }
    }

    /// Where a request lives on an upstream.
    pub fn url(upstream: &UpstreamProxyConfig, request: &RemoteRequest) -> RegistryResult<Uri> {
        let base = upstream.url.clone();
        let joined = match request {
            RemoteRequest::Manifest { image, reference } => {
                let image = repository(upstream.source, image);
                base.join(format!("v2/{image}/manifests/{reference}"))
            }
            RemoteRequest::Blob { image, digest } => {
                let image = repository(upstream.source, image);
                base.join(format!("v2/{image}/blobs/{digest}"))
            }
            RemoteRequest::CargoIndex { name } => match upstream.source {
                UpstreamSource::CratesIo => base.join(sparse_index_path(name)),
                _ => base.join(format!("index/{}", sparse_index_path(name))),
            },
            RemoteRequest::CargoCrate { name, version } => match upstream.source {
                UpstreamSource::CratesIo => {
                    format!("{CRATES_IO_DOWNLOADS}/{name}/{name}-{version}.crate").as_str().into_uri()
                }
                _ => base.join(format!("api/v1/crates/{name}/{version}/download")),
            },
            RemoteRequest::File {
                image,
                version,
                filename,
            } => base.join(format!("{image}/{version}/{filename}")),
        };

        joined.map_err(|err| RegistryError::Unknown(format!("upstream url: {err}")))
    }

    async fn credentials(&self, upstream: &UpstreamProxyConfig) -> RegistryResult<Credentials> {
        let Some(configured) = &upstream.credentials else {
            return Ok(Credentials::Anonymous);
        };

        let password = self
            .secrets
            .resolve(&configured.secret)
            .await
            .map_err(|err| RegistryError::Unavailable(format!("upstream credentials: {err}")))?;
        Ok(Credentials::basic(configured.username.as_str(), Some(password)))
    }
}

/// Docker Hub keeps official images under `library/`.
fn repository(source: UpstreamSource, image: &str) -> String {
    if source == UpstreamSource::DockerHub && !image.contains('/') {
        format!("library/{image}")
    } else {
        image.to_owned()
    }
}

fn map_error(request: &RemoteRequest, error: UpstreamError) -> RegistryError {
    match error {
        UpstreamError::NotFound(uri) => match request {
            RemoteRequest::Manifest { .. } => RegistryError::ManifestUnknown(uri.to_string()),
            RemoteRequest::Blob { .. } => RegistryError::BlobUnknown(uri.to_string()),
            _ => RegistryError::ArtifactNotFound(uri.to_string()),
        },
        UpstreamError::Denied { status, uri } => {
            RegistryError::Denied(format!("upstream answered {status} for {uri}"))
        }
        other => RegistryError::Unavailable(other.to_string()),
    }
}

#[async_trait::async_trait]
impl RemoteAdapter for HttpRemote {
    #[tracing::instrument(skip(self, upstream), fields(upstream = %upstream.url))]
    async fn fetch(
        &self,
        upstream: &UpstreamProxyConfig,
        request: &RemoteRequest,
    ) -> RegistryResult<RemoteArtifact> {
        let uri = Self::url(upstream, request)?;
        let credentials = self.credentials(upstream).await?;
        let accept: &[&str] = match request {
            RemoteRequest::Manifest { .. } => SUPPORTED_MEDIA_TYPES,
            _ => &[],
        };

        let response = self
            .client
            .get(uri, &credentials, accept)
            .await
            .map_err(|err| map_error(request, err))?;

        let digest = response
            .header("docker-content-digest")
            .and_then(|value| value.parse().ok());
        let content_type = response.content_type().map(str::to_owned);

        Ok(RemoteArtifact {
            bytes: response.into_body(),
            content_type,
            digest,
        })
    }
}
