//! Generic packages: files addressed by `{image}/{version}/{filename}`.

use std::sync::Arc;

use bytes::Bytes;

use super::{Upstream, denied};
use crate::cache::CacheEntry;
use crate::content::ContentStore;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::MetadataStore;
use crate::model::{Artifact, ArtifactFile, Principal, Registry};
use crate::remote::RemoteRequest;

/// File operations on one registry.
#[async_trait::async_trait]
pub trait GenericArtifacts: std::fmt::Debug + Send + Sync {
    /// Read a file.
    async fn get_file(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        version: &str,
        filename: &str,
    ) -> RegistryResult<Bytes>;

    /// Store or replace a file.
    async fn put_file(
        &self,
        registry: &Registry,
        image: &str,
        version: &str,
        filename: &str,
        bytes: Bytes,
    ) -> RegistryResult<ArtifactFile>;

    /// Remove a file; the version goes away with its last file.
    async fn delete_file(
        &self,
        registry: &Registry,
        image: &str,
        version: &str,
        filename: &str,
    ) -> RegistryResult<()>;
}

fn not_found(image: &str, version: &str, filename: &str) -> RegistryError {
    RegistryError::ArtifactNotFound(format!("{image}/{version}/{filename}"))
}

/// Files uploaded to this registry.
#[derive(Debug, Clone)]
pub struct LocalGeneric {
    content: ContentStore,
    metadata: Arc<dyn MetadataStore>,
}

impl LocalGeneric {
    /// Create the local implementation.
    pub fn new(content: ContentStore, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { content, metadata }
    }
}

#[async_trait::async_trait]
impl GenericArtifacts for LocalGeneric {
    async fn get_file(
        &self,
        _principal: &Principal,
        registry: &Registry,
        image: &str,
        version: &str,
        filename: &str,
    ) -> RegistryResult<Bytes> {
        let artifact = self
            .metadata
            .artifact(registry.id, image, version)
            .await?
            .ok_or_else(|| not_found(image, version, filename))?;
        let file = artifact
            .file(filename)
            .ok_or_else(|| not_found(image, version, filename))?;
        self.content.get(&file.digest).await
    }

    #[tracing::instrument(skip(self, bytes), fields(registry = %registry, size = bytes.len()))]
    async fn put_file(
        &self,
        registry: &Registry,
        image: &str,
        version: &str,
        filename: &str,
        bytes: Bytes,
    ) -> RegistryResult<ArtifactFile> {
        let stored = self.content.put_bytes(&bytes, None).await?;
        let file = ArtifactFile {
            name: filename.to_owned(),
            digest: stored.digest,
            size: stored.size,
        };

        let mut artifact = self
            .metadata
            .artifact(registry.id, image, version)
            .await?
            .unwrap_or_else(|| Artifact::new(registry.id, image, version));
        artifact.upsert_file(file.clone());
        self.metadata.upsert_artifact(artifact).await?;
        Ok(file)
    }

    async fn delete_file(
        &self,
        registry: &Registry,
        image: &str,
        version: &str,
        filename: &str,
    ) -> RegistryResult<()> {
        let mut artifact = self
            .metadata
            .artifact(registry.id, image, version)
            .await?
            .ok_or_else(|| not_found(image, version, filename))?;

        let before = artifact.files.len();
        artifact.files.retain(|file| file.name != filename);
        if artifact.files.len() == before {
            return Err(not_found(image, version, filename));
        }

        if artifact.files.is_empty() {
            self.metadata
                .delete_artifact(registry.id, image, version)
                .await?;
        } else {
            self.metadata.upsert_artifact(artifact).await?;
        }
        Ok(())
    }
}

/// Pull-through access to a plain HTTP file server.
#[derive(Debug, Clone)]
pub struct ProxyGeneric {
    local: LocalGeneric,
    upstream: Upstream,
}

impl ProxyGeneric {
    /// Wrap the local implementation, which holds the proxy's cache.
    pub fn new(local: LocalGeneric, upstream: Upstream) -> Self {
        Self { local, upstream }
    }
}

#[async_trait::async_trait]
impl GenericArtifacts for ProxyGeneric {
    async fn get_file(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        version: &str,
        filename: &str,
    ) -> RegistryResult<Bytes> {
        match self
            .local
            .get_file(principal, registry, image, version, filename)
            .await
        {
            Err(err) if err.is_not_found() => {}
            cached => return cached,
        }

        let artifact = self
            .upstream
            .fetch(
                registry,
                RemoteRequest::File {
                    image: image.to_owned(),
                    version: version.to_owned(),
                    filename: filename.to_owned(),
                },
            )
            .await?;
        self.upstream.cache(
            principal,
            registry,
            image,
            CacheEntry::File {
                version: version.to_owned(),
                filename: filename.to_owned(),
                bytes: artifact.bytes.clone(),
            },
        );
        Ok(artifact.bytes)
    }

    async fn put_file(
        &self,
        registry: &Registry,
        _image: &str,
        _version: &str,
        _filename: &str,
        _bytes: Bytes,
    ) -> RegistryResult<ArtifactFile> {
        Err(denied(registry))
    }

    async fn delete_file(
        &self,
        registry: &Registry,
        _image: &str,
        _version: &str,
        _filename: &str,
    ) -> RegistryResult<()> {
        Err(denied(registry))
    }
}
