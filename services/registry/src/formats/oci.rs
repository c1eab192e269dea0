//! OCI images: manifests, blobs and uploads.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use super::{Upstream, denied};
use crate::cache::CacheEntry;
use crate::content::{ContentStore, StoredBlob};
use crate::digest::{Algorithm, Digest};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{ManifestStore, Reference, SUPPORTED_MEDIA_TYPES};
use crate::metadata::MetadataStore;
use crate::model::{ManifestRecord, Principal, Registry};
use crate::remote::RemoteRequest;
use crate::upload::{CommittedBlob, UploadId, UploadSession, UploadSessionManager};

/// A manifest ready to be served.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    /// Payload digest
    pub digest: Digest,
    /// `Content-Type` to serve it with
    pub media_type: String,
    /// Payload
    pub payload: Bytes,
}

impl From<(ManifestRecord, Bytes)> for ManifestResponse {
    fn from((record, payload): (ManifestRecord, Bytes)) -> Self {
        Self {
            digest: record.digest,
            media_type: record.media_type,
            payload,
        }
    }
}

/// A `Range: bytes=start-end` request header. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRange {
    /// First byte
    pub start: u64,
    /// Last byte, or the end of the blob
    pub end: Option<u64>,
}

impl BlobRange {
    /// Offset and length within a blob of `size` bytes.
    ///
    /// An `end` past the blob is clamped; a `start` past it is unsatisfiable.
    pub fn bounds(&self, size: u64) -> RegistryResult<(u64, u64)> {
        if self.start >= size {
            return Err(RegistryError::RangeInvalid(format!(
                "range starts at {} but the blob has {size} bytes",
                self.start
            )));
        }
        let last = self.end.map_or(size - 1, |end| end.min(size - 1));
        Ok((self.start, last - self.start + 1))
    }
}

impl FromStr for BlobRange {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::RangeInvalid(format!("unsupported range: {s}"));
        let spec = s.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        let (start, end) = spec.split_once('-').ok_or_else(invalid)?;

        let start = start.trim().parse().map_err(|_| invalid())?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse().map_err(|_| invalid())?),
        };
        if end.is_some_and(|end| end < start) {
            return Err(invalid());
        }

        Ok(Self { start, end })
    }
}

/// Blob bytes, possibly a slice of the whole.
#[derive(Debug, Clone)]
pub struct BlobResponse {
    /// Blob digest
    pub digest: Digest,
    /// Size of the whole blob
    pub size: u64,
    /// Served slice as `(first, last)`, when a range was requested
    pub range: Option<(u64, u64)>,
    /// The bytes served
    pub bytes: Bytes,
}

fn slice(digest: Digest, bytes: Bytes, range: Option<BlobRange>) -> RegistryResult<BlobResponse> {
    let size = bytes.len() as u64;
    match range {
        None => Ok(BlobResponse {
            digest,
            size,
            range: None,
            bytes,
        }),
        Some(range) => {
            let (offset, length) = range.bounds(size)?;
            let start = offset as usize;
            Ok(BlobResponse {
                digest,
                size,
                range: Some((offset, offset + length - 1)),
                bytes: bytes.slice(start..start + length as usize),
            })
        }
    }
}

/// OCI operations on one registry.
#[async_trait::async_trait]
pub trait OciArtifacts: std::fmt::Debug + Send + Sync {
    /// Fetch a manifest by tag or digest.
    async fn get_manifest(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<ManifestResponse>;

    /// Size of a blob, for `HEAD`.
    async fn blob_size(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        digest: &Digest,
    ) -> RegistryResult<u64>;

    /// Fetch a blob or a range of it.
    async fn get_blob(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        digest: &Digest,
        range: Option<BlobRange>,
    ) -> RegistryResult<BlobResponse>;

    /// Tags of a repository, sorted.
    async fn list_tags(&self, registry: &Registry, image: &str) -> RegistryResult<Vec<String>>;

    /// Store a pushed manifest.
    async fn put_manifest(
        &self,
        registry: &Registry,
        image: &str,
        reference: &Reference,
        content_type: Option<&str>,
        payload: Bytes,
    ) -> RegistryResult<ManifestRecord>;

    /// Delete a tag or a manifest.
    async fn delete_manifest(
        &self,
        registry: &Registry,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<()>;

    /// Remove a blob from a repository.
    async fn delete_blob(&self, registry: &Registry, image: &str, digest: &Digest)
    -> RegistryResult<()>;

    /// Open an upload session.
    async fn start_upload(&self, registry: &Registry, image: &str) -> RegistryResult<UploadSession>;

    /// Store a whole blob sent in one request.
    async fn put_blob(
        &self,
        registry: &Registry,
        image: &str,
        digest: &Digest,
        bytes: Bytes,
    ) -> RegistryResult<StoredBlob>;

    /// Link a blob from another repository of the same registry, if it is there.
    async fn mount_blob(
        &self,
        registry: &Registry,
        image: &str,
        from: &str,
        digest: &Digest,
    ) -> RegistryResult<Option<u64>>;

    /// Finish an upload session and link the blob.
    async fn complete_upload(
        &self,
        registry: &Registry,
        image: &str,
        id: UploadId,
        trailing: Bytes,
        digest: &Digest,
    ) -> RegistryResult<CommittedBlob>;
}

/// Serves and stores images in this registry's own storage.
#[derive(Debug, Clone)]
pub struct LocalOci {
    content: ContentStore,
    manifests: ManifestStore,
    metadata: Arc<dyn MetadataStore>,
    uploads: Arc<UploadSessionManager>,
}

impl LocalOci {
    /// Create the local implementation.
    pub fn new(
        content: ContentStore,
        manifests: ManifestStore,
        metadata: Arc<dyn MetadataStore>,
        uploads: Arc<UploadSessionManager>,
    ) -> Self {
        Self {
            content,
            manifests,
            metadata,
            uploads,
        }
    }

    async fn check_quarantine(
        &self,
        registry: &Registry,
        image: &str,
        digest: &Digest,
    ) -> RegistryResult<()> {
        if self.metadata.is_quarantined(registry.id, image, digest).await? {
            return Err(RegistryError::Quarantined(digest.clone()));
        }
        Ok(())
    }

    async fn linked_size(
        &self,
        registry: &Registry,
        image: &str,
        digest: &Digest,
    ) -> RegistryResult<u64> {
        let size = self
            .metadata
            .blob_link(registry.id, image, digest)
            .await?
            .ok_or_else(|| RegistryError::BlobUnknown(digest.to_string()))?;
        self.check_quarantine(registry, image, digest).await?;
        Ok(size)
    }
}

#[async_trait::async_trait]
impl OciArtifacts for LocalOci {
    async fn get_manifest(
        &self,
        _principal: &Principal,
        registry: &Registry,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<ManifestResponse> {
        self.manifests
            .get(registry.id, image, reference)
            .await
            .map(ManifestResponse::from)
    }

    async fn blob_size(
        &self,
        _principal: &Principal,
        registry: &Registry,
        image: &str,
        digest: &Digest,
    ) -> RegistryResult<u64> {
        self.linked_size(registry, image, digest).await
    }

    async fn get_blob(
        &self,
        _principal: &Principal,
        registry: &Registry,
        image: &str,
        digest: &Digest,
        range: Option<BlobRange>,
    ) -> RegistryResult<BlobResponse> {
        let size = self.linked_size(registry, image, digest).await?;

        match range {
            None => Ok(BlobResponse {
                digest: digest.clone(),
                size,
                range: None,
                bytes: self.content.get(digest).await?,
            }),
            Some(range) => {
                let (offset, length) = range.bounds(size)?;
                Ok(BlobResponse {
                    digest: digest.clone(),
                    size,
                    range: Some((offset, offset + length - 1)),
                    bytes: self.content.get_range(digest, offset, Some(length)).await?,
                })
            }
        }
    }

    async fn list_tags(&self, registry: &Registry, image: &str) -> RegistryResult<Vec<String>> {
        let tags = self.manifests.list_tags(registry.id, image).await?;
        if tags.is_empty() {
            return Err(RegistryError::ArtifactNotFound(image.to_owned()));
        }
        Ok(tags)
    }

    async fn put_manifest(
        &self,
        registry: &Registry,
        image: &str,
        reference: &Reference,
        content_type: Option<&str>,
        payload: Bytes,
    ) -> RegistryResult<ManifestRecord> {
        self.manifests
            .commit(registry.id, image, reference, content_type, &payload)
            .await
    }

    async fn delete_manifest(
        &self,
        registry: &Registry,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<()> {
        self.manifests.delete(registry.id, image, reference).await
    }

    async fn delete_blob(
        &self,
        registry: &Registry,
        image: &str,
        digest: &Digest,
    ) -> RegistryResult<()> {
        // the bytes stay: other repositories may link the same digest
        if !self.metadata.unlink_blob(registry.id, image, digest).await? {
            return Err(RegistryError::BlobUnknown(digest.to_string()));
        }
        Ok(())
    }

    async fn start_upload(&self, registry: &Registry, image: &str) -> RegistryResult<UploadSession> {
        self.uploads.initiate(registry.id, image).await
    }

    async fn put_blob(
        &self,
        registry: &Registry,
        image: &str,
        digest: &Digest,
        bytes: Bytes,
    ) -> RegistryResult<StoredBlob> {
        let stored = self.content.put_bytes(&bytes, Some(digest)).await?;
        self.metadata
            .link_blob(registry.id, image, &stored.digest, stored.size)
            .await?;
        Ok(stored)
    }

    async fn mount_blob(
        &self,
        registry: &Registry,
        image: &str,
        from: &str,
        digest: &Digest,
    ) -> RegistryResult<Option<u64>> {
        let Some(size) = self.metadata.blob_link(registry.id, from, digest).await? else {
            return Ok(None);
        };
        if !self.content.exists(digest).await? {
            return Ok(None);
        }

        self.metadata.link_blob(registry.id, image, digest, size).await?;
        tracing::debug!(%digest, from, to = image, "blob mounted");
        Ok(Some(size))
    }

    async fn complete_upload(
        &self,
        registry: &Registry,
        image: &str,
        id: UploadId,
        trailing: Bytes,
        digest: &Digest,
    ) -> RegistryResult<CommittedBlob> {
        let session = self.uploads.status(id).await?;
        if session.registry != registry.id || session.image != image {
            return Err(RegistryError::BlobUploadUnknown(id.to_string()));
        }

        let committed = self.uploads.complete(id, trailing, digest).await?;
        self.metadata
            .link_blob(registry.id, image, &committed.digest, committed.size)
            .await?;
        Ok(committed)
    }
}

/// Serves from the proxy's cache, fetching and caching misses from its upstream.
#[derive(Debug, Clone)]
pub struct ProxyOci {
    local: LocalOci,
    upstream: Upstream,
}

impl ProxyOci {
    /// Wrap the local implementation, which holds the proxy's cache.
    pub fn new(local: LocalOci, upstream: Upstream) -> Self {
        Self { local, upstream }
    }

    async fn fetch_manifest(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<ManifestResponse> {
        let artifact = self
            .upstream
            .fetch(
                registry,
                RemoteRequest::Manifest {
                    image: image.to_owned(),
                    reference: reference.to_string(),
                },
            )
            .await?;

        // trust the upstream content type only when it is a manifest type
        let content_type = artifact
            .content_type
            .as_deref()
            .filter(|content_type| SUPPORTED_MEDIA_TYPES.contains(content_type));
        let parsed = self.local.manifests.validate(content_type, &artifact.bytes)?;

        let digest = match reference {
            Reference::Digest(expected) => {
                expected.verify(&artifact.bytes)?;
                expected.clone()
            }
            Reference::Tag(_) => Digest::compute(Algorithm::Sha256, &artifact.bytes),
        };
        self.local.check_quarantine(registry, image, &digest).await?;

        let tag = match reference {
            Reference::Tag(tag) => Some(tag.clone()),
            Reference::Digest(_) => None,
        };
        self.upstream.cache(
            principal,
            registry,
            image,
            CacheEntry::Manifest {
                tag,
                media_type: Some(parsed.media_type.clone()),
                bytes: artifact.bytes.clone(),
            },
        );

        Ok(ManifestResponse {
            digest,
            media_type: parsed.media_type,
            payload: artifact.bytes,
        })
    }

    async fn fetch_blob(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        digest: &Digest,
    ) -> RegistryResult<Bytes> {
        let artifact = self
            .upstream
            .fetch(
                registry,
                RemoteRequest::Blob {
                    image: image.to_owned(),
                    digest: digest.clone(),
                },
            )
            .await?;
        digest.verify(&artifact.bytes)?;
        self.local.check_quarantine(registry, image, digest).await?;

        self.upstream.cache(
            principal,
            registry,
            image,
            CacheEntry::Blob {
                digest: digest.clone(),
                bytes: artifact.bytes.clone(),
            },
        );
        Ok(artifact.bytes)
    }
}

#[async_trait::async_trait]
impl OciArtifacts for ProxyOci {
    async fn get_manifest(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<ManifestResponse> {
        match self
            .local
            .get_manifest(principal, registry, image, reference)
            .await
        {
            Err(err) if err.is_not_found() => {
                tracing::debug!(%registry, image, %reference, "manifest cache miss");
                self.fetch_manifest(principal, registry, image, reference)
                    .await
            }
            cached => cached,
        }
    }

    async fn blob_size(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        digest: &Digest,
    ) -> RegistryResult<u64> {
        match self.local.blob_size(principal, registry, image, digest).await {
            Err(err) if err.is_not_found() => {
                let bytes = self.fetch_blob(principal, registry, image, digest).await?;
                Ok(bytes.len() as u64)
            }
            cached => cached,
        }
    }

    async fn get_blob(
        &self,
        principal: &Principal,
        registry: &Registry,
        image: &str,
        digest: &Digest,
        range: Option<BlobRange>,
    ) -> RegistryResult<BlobResponse> {
        match self
            .local
            .get_blob(principal, registry, image, digest, range)
            .await
        {
            Err(err) if err.is_not_found() => {
                tracing::debug!(%registry, image, %digest, "blob cache miss");
                let bytes = self.fetch_blob(principal, registry, image, digest).await?;
                slice(digest.clone(), bytes, range)
            }
            cached => cached,
        }
    }

    /// Only tags already pulled through are listed.
    async fn list_tags(&self, registry: &Registry, image: &str) -> RegistryResult<Vec<String>> {
        self.local.list_tags(registry, image).await
    }

    async fn put_manifest(
        &self,
        registry: &Registry,
        _image: &str,
        _reference: &Reference,
        _content_type: Option<&str>,
        _payload: Bytes,
    ) -> RegistryResult<ManifestRecord> {
        Err(denied(registry))
    }

    async fn delete_manifest(
        &self,
        registry: &Registry,
        _image: &str,
        _reference: &Reference,
    ) -> RegistryResult<()> {
        Err(denied(registry))
    }

    async fn delete_blob(
        &self,
        registry: &Registry,
        _image: &str,
        _digest: &Digest,
    ) -> RegistryResult<()> {
        Err(denied(registry))
    }

    async fn start_upload(&self, registry: &Registry, _image: &str) -> RegistryResult<UploadSession> {
        Err(denied(registry))
    }

    async fn put_blob(
        &self,
        registry: &Registry,
        _image: &str,
        _digest: &Digest,
        _bytes: Bytes,
    ) -> RegistryResult<StoredBlob> {
        Err(denied(registry))
    }

    async fn mount_blob(
        &self,
        registry: &Registry,
        _image: &str,
        _from: &str,
        _digest: &Digest,
    ) -> RegistryResult<Option<u64>> {
        Err(denied(registry))
    }

    async fn complete_upload(
        &self,
        registry: &Registry,
        _image: &str,
        _id: UploadId,
        _trailing: Bytes,
        _digest: &Digest,
    ) -> RegistryResult<CommittedBlob> {
        Err(denied(registry))
    }
}
