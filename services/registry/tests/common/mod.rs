//! Shared fixtures for the HTTP integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use artifact_registry::config::Limits;
use artifact_registry::metadata::MemoryMetadataStore;
use artifact_registry::model::{
    ImagePolicy, PackageType, Registry, RegistryId, RegistryKind, UpstreamProxyConfig,
    UpstreamSource,
};
use artifact_registry::remote::HttpRemote;
use artifact_registry::{RegistryBuilder, RegistryContext, router};
use axum::body::Body;
use axum::http::{Request, Response};
use bytes::{BufMut as _, Bytes, BytesMut};
use camino::Utf8Path;
use http_body_util::BodyExt as _;
use secret::StaticSecrets;
use storage::{Driver, Metadata, MemoryStorage, Storage, StorageError};
use storage_driver::{Reader, Writer};
use tokio::sync::{Notify, Semaphore};
use tower::ServiceExt as _;
use upstream_client::UpstreamClient;
use upstream_client::mock::MockUpstream;

pub const SCOPE: &str = "root";

/// A virtual registry falling back to `proxies`, in order.
pub fn virtual_registry(id: u64, name: &str, package_type: PackageType, proxies: &[u64]) -> Registry {
    Registry {
        id: RegistryId(id),
        name: name.into(),
        scope: SCOPE.into(),
        package_type,
        kind: RegistryKind::Virtual {
            upstream_proxies: proxies.iter().copied().map(RegistryId).collect(),
        },
        policy: ImagePolicy::default(),
    }
}

/// An upstream proxy pointing at the mock, under `url`.
pub fn proxy_registry(id: u64, name: &str, package_type: PackageType, url: &str) -> Registry {
    Registry {
        id: RegistryId(id),
        name: name.into(),
        scope: SCOPE.into(),
        package_type,
        kind: RegistryKind::UpstreamProxy(UpstreamProxyConfig {
            url: url.parse().unwrap(),
            source: UpstreamSource::Url,
            credentials: None,
        }),
        policy: ImagePolicy::default(),
    }
}

pub struct TestRegistry {
    pub context: RegistryContext,
    pub metadata: Arc<MemoryMetadataStore>,
    pub upstream: MockUpstream,
}

impl TestRegistry {
    pub fn new(registries: Vec<Registry>) -> Self {
        Self::with_upstream(registries, MockUpstream::new())
    }

    pub fn with_upstream(registries: Vec<Registry>, upstream: MockUpstream) -> Self {
        let storage = MemoryStorage::with_buckets(&["registry"]).into();
        Self::with_storage(registries, upstream, storage)
    }

    pub fn with_storage(registries: Vec<Registry>, upstream: MockUpstream, storage: Storage) -> Self {
        Self::build(registries, upstream, storage, Limits::default())
    }

    pub fn with_limits(registries: Vec<Registry>, limits: Limits) -> Self {
        let storage = MemoryStorage::with_buckets(&["registry"]).into();
        Self::build(registries, MockUpstream::new(), storage, limits)
    }

    fn build(
        registries: Vec<Registry>,
        upstream: MockUpstream,
        storage: Storage,
        limits: Limits,
    ) -> Self {
        let metadata = Arc::new(MemoryMetadataStore::with_registries(registries));
        let remote = HttpRemote::new(
            UpstreamClient::with_service(upstream.clone(), Duration::from_secs(5)),
            Arc::new(StaticSecrets::new()),
        );
        let context = RegistryBuilder::new()
            .storage(storage)
            .bucket("registry")
            .metadata(metadata.clone())
            .remote(Arc::new(remote))
            .limits(limits)
            .oci_scope(SCOPE)
            .context();

        Self {
            context,
            metadata,
            upstream,
        }
    }

    /// Send a request from a spawned task, so it can be left waiting.
    pub fn spawn(&self, request: Request<Body>) -> tokio::task::JoinHandle<Response<Body>> {
        let router = router(self.context.clone());
        tokio::spawn(async move { router.oneshot(request).await.unwrap() })
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        router(self.context.clone()).oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn put(&self, uri: &str, body: impl Into<Bytes>) -> Response<Body> {
        self.send(Request::put(uri).body(Body::from(body.into())).unwrap())
            .await
    }

    /// Wait for detached cache writes.
    pub async fn settle(&self) {
        self.context.cache().flush().await;
    }
}

pub async fn body(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body(response).await).unwrap()
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response.headers()[name].to_str().unwrap()
}

/// Frame a `cargo publish` body.
pub fn publish_body(name: &str, version: &str, archive: &[u8]) -> Bytes {
    let metadata = serde_json::json!({
        "name": name,
        "vers": version,
        "deps": [],
        "features": {},
    });
    let json = serde_json::to_vec(&metadata).unwrap();
    let mut body = BytesMut::new();
    body.put_u32_le(json.len() as u32);
    body.put_slice(&json);
    body.put_u32_le(archive.len() as u32);
    body.put_slice(archive);
    body.freeze()
}

/// Memory storage whose appends park until [`GatedStorage::release`] is called.
#[derive(Debug)]
pub struct GatedStorage {
    inner: MemoryStorage,
    entered: Notify,
    permits: Semaphore,
}

impl GatedStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStorage::with_buckets(&["registry"]),
            entered: Notify::new(),
            permits: Semaphore::new(0),
        })
    }

    /// Wait until an append is parked at the gate.
    pub async fn parked(&self) {
        self.entered.notified().await;
    }

    /// Let one parked append through.
    pub fn release(&self) {
        self.permits.add_permits(1);
    }
}

#[async_trait::async_trait]
impl Driver for GatedStorage {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.inner.delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.inner.metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.inner.upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.inner.download(bucket, remote, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.list(bucket, prefix).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.inner.rename(bucket, from, to).await
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.entered.notify_one();
        self.permits.acquire().await.unwrap().forget();
        self.inner.append(bucket, remote, reader).await
    }
}
