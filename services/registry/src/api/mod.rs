//! API server builder and router

mod cargo;
mod generic;
mod oci;

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue};
use axum::routing::{any, get};
use secret::EnvSecrets;
use storage::{MemoryStorage, Storage};
use tower_http::set_header::SetResponseHeaderLayer;
use upstream_client::UpstreamClient;

use crate::config::Limits;
use crate::context::RegistryContext;
use crate::metadata::{MemoryMetadataStore, MetadataStore};
use crate::model::Principal;
use crate::remote::{HttpRemote, RemoteAdapter};

/// Prefix of environment variables consulted for upstream secrets by default.
pub const SECRET_ENV_PREFIX: &str = "REGISTRY_SECRET_";

/// Registry builder for configuring and creating the registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    storage: Option<Storage>,
    bucket: Option<String>,
    metadata: Option<Arc<dyn MetadataStore>>,
    remote: Option<Arc<dyn RemoteAdapter>>,
    limits: Limits,
    oci_scope: Option<String>,
    base_url: Option<String>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend; in-memory storage when unset
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the metadata store; an empty in-memory store when unset
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the upstream adapter; HTTP with secrets from the environment when unset
    pub fn remote(mut self, remote: Arc<dyn RemoteAdapter>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Set size limits and timeouts
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the scope OCI registry names are resolved in
    pub fn oci_scope(mut self, scope: impl Into<String>) -> Self {
        self.oci_scope = Some(scope.into());
        self
    }

    /// Set the public URL written into Cargo's `config.json`
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Wire up the shared state without building a router.
    pub fn context(self) -> RegistryContext {
        let storage = self
            .storage
            .unwrap_or_else(|| Storage::new(MemoryStorage::new()));
        let bucket = storage.bucket(self.bucket.unwrap_or_else(|| "registry".to_string()));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(MemoryMetadataStore::new()));
        let remote = self.remote.unwrap_or_else(|| {
            Arc::new(HttpRemote::new(
                UpstreamClient::new(self.limits.upstream_timeout()),
                Arc::new(EnvSecrets::with_prefix(SECRET_ENV_PREFIX)),
            ))
        });

        RegistryContext::new(bucket, metadata, remote, self.limits)
            .with_oci_scope(self.oci_scope.unwrap_or_else(|| "root".to_string()))
            .with_base_url(self.base_url)
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        router(self.context())
    }
}

/// The HTTP surface over an existing context.
pub fn router(context: RegistryContext) -> Router {
    Router::new()
        .route("/v2/", get(oci::version_check))
        .route("/v2", get(oci::version_check))
        .route("/v2/{registry}/{*rest}", any(oci::dispatch))
        .merge(cargo::router(context.limits()))
        .merge(generic::router())
        .layer(DefaultBodyLimit::disable())
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("docker-distribution-api-version"),
            HeaderValue::from_static("registry/2.0"),
        ))
        .with_state(context)
}

/// Authentication runs in front of the router and leaves a [`Principal`] in the request
/// extensions; without one the caller is anonymous.
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Principal>()
            .cloned()
            .unwrap_or_else(Principal::anonymous))
    }
}
