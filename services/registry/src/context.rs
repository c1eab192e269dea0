//! Shared state handed to every request handler.

use std::sync::Arc;

use storage::StorageBucket;

use crate::cache::PullThroughCacheWriter;
use crate::config::Limits;
use crate::content::ContentStore;
use crate::formats::{
    CargoArtifacts, CargoIndexFiles, GenericArtifacts, LocalCargo, LocalGeneric, LocalOci,
    OciArtifacts, ProxyCargo, ProxyGeneric, ProxyOci, Upstream,
};
use crate::manifest::ManifestStore;
use crate::metadata::MetadataStore;
use crate::proxy::{Capabilities, ProxyCoordinator};
use crate::remote::RemoteAdapter;
use crate::resolver::RegistryResolver;
use crate::upload::UploadSessionManager;

/// Everything a handler needs, wired together once at startup.
#[derive(Debug, Clone)]
pub struct RegistryContext {
    metadata: Arc<dyn MetadataStore>,
    content: ContentStore,
    uploads: Arc<UploadSessionManager>,
    cache: PullThroughCacheWriter,
    oci: ProxyCoordinator<dyn OciArtifacts>,
    cargo: ProxyCoordinator<dyn CargoArtifacts>,
    generic: ProxyCoordinator<dyn GenericArtifacts>,
    limits: Limits,
    oci_scope: String,
    base_url: Option<String>,
}

impl RegistryContext {
    /// Build the stores, capability tables and coordinators over one bucket.
    pub fn new(
        bucket: StorageBucket,
        metadata: Arc<dyn MetadataStore>,
        remote: Arc<dyn RemoteAdapter>,
        limits: Limits,
    ) -> Self {
        let content = ContentStore::new(bucket.clone());
        let manifests = ManifestStore::new(
            content.clone(),
            metadata.clone(),
            limits.max_manifest_bytes,
        );
        let index = CargoIndexFiles::new(bucket);
        let uploads = Arc::new(UploadSessionManager::new(
            content.clone(),
            limits.upload_session_ttl(),
        ));
        let cache = PullThroughCacheWriter::new(
            content.clone(),
            manifests.clone(),
            metadata.clone(),
            index.clone(),
            limits.cache_write_timeout(),
        );
        let upstream = Upstream::new(remote, cache.clone());
        let resolver = RegistryResolver::new(metadata.clone());

        let local_oci = LocalOci::new(
            content.clone(),
            manifests,
            metadata.clone(),
            uploads.clone(),
        );
        let oci = Capabilities::new(
            Arc::new(local_oci.clone()) as Arc<dyn OciArtifacts>,
            Arc::new(ProxyOci::new(local_oci, upstream.clone())) as Arc<dyn OciArtifacts>,
        );

        let local_cargo = LocalCargo::new(content.clone(), metadata.clone(), index);
        let cargo = Capabilities::new(
            Arc::new(local_cargo.clone()) as Arc<dyn CargoArtifacts>,
            Arc::new(ProxyCargo::new(local_cargo, upstream.clone())) as Arc<dyn CargoArtifacts>,
        );

        let local_generic = LocalGeneric::new(content.clone(), metadata.clone());
        let generic = Capabilities::new(
            Arc::new(local_generic.clone()) as Arc<dyn GenericArtifacts>,
            Arc::new(ProxyGeneric::new(local_generic, upstream)) as Arc<dyn GenericArtifacts>,
        );

        Self {
            metadata,
            content,
            uploads,
            cache,
            oci: ProxyCoordinator::new(resolver.clone(), Arc::new(oci)),
            cargo: ProxyCoordinator::new(resolver.clone(), Arc::new(cargo)),
            generic: ProxyCoordinator::new(resolver, Arc::new(generic)),
            limits,
            oci_scope: "root".to_owned(),
            base_url: None,
        }
    }

    /// Scope that `/v2/{registry}` names are looked up in.
    pub fn with_oci_scope(mut self, scope: impl Into<String>) -> Self {
        self.oci_scope = scope.into();
        self
    }

    /// Public URL advertised in Cargo's `config.json`.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.map(|url| url.trim_end_matches('/').to_owned());
        self
    }

    /// Registry, artifact and manifest records.
    pub fn metadata_store(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Digest-addressed blob storage.
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Open OCI upload sessions.
    pub fn uploads(&self) -> &Arc<UploadSessionManager> {
        &self.uploads
    }

    /// The detached cache writer, flushed on shutdown.
    pub fn cache(&self) -> &PullThroughCacheWriter {
        &self.cache
    }

    /// OCI operations across registry chains.
    pub fn oci(&self) -> &ProxyCoordinator<dyn OciArtifacts> {
        &self.oci
    }

    /// Cargo operations across registry chains.
    pub fn cargo(&self) -> &ProxyCoordinator<dyn CargoArtifacts> {
        &self.cargo
    }

    /// Generic file operations across registry chains.
    pub fn generic(&self) -> &ProxyCoordinator<dyn GenericArtifacts> {
        &self.generic
    }

    /// Size limits and timeouts.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Scope of OCI registry names.
    pub fn oci_scope(&self) -> &str {
        &self.oci_scope
    }

    /// Configured public URL, if any.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }
}
