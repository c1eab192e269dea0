//! Detached persistence of artifacts fetched from upstream proxies.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::task::TaskTracker;
use tracing::Instrument as _;

use crate::content::ContentStore;
use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::formats::cargo::{CargoIndexFiles, crate_file_name};
use crate::manifest::ManifestStore;
use crate::metadata::MetadataStore;
use crate::model::{Artifact, ArtifactFile, Principal, RegistryId};

/// Who asked, and where the result belongs. Nothing else from the request survives.
#[derive(Debug, Clone)]
pub struct CacheContext {
    /// The requesting principal
    pub principal: Principal,
    /// The upstream proxy registry that fetched it
    pub registry: RegistryId,
    /// Repository, package or crate name
    pub image: String,
}

/// Fetched content to persist.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// A verified OCI blob
    Blob {
        /// Its digest
        digest: Digest,
        /// Its bytes
        bytes: Bytes,
    },
    /// An OCI manifest, bound to `tag` when fetched by tag
    Manifest {
        /// Tag it was requested by
        tag: Option<String>,
        /// Media type reported upstream
        media_type: Option<String>,
        /// Payload
        bytes: Bytes,
    },
    /// A generic file
    File {
        /// Version
        version: String,
        /// File name
        filename: String,
        /// Contents
        bytes: Bytes,
    },
    /// A `.crate` archive
    CargoCrate {
        /// Version
        version: String,
        /// Archive bytes
        bytes: Bytes,
    },
    /// A sparse index file
    CargoIndex {
        /// File contents
        bytes: Bytes,
    },
}

impl CacheEntry {
    fn kind(&self) -> &'static str {
        match self {
            CacheEntry::Blob { .. } => "blob",
            CacheEntry::Manifest { .. } => "manifest",
            CacheEntry::File { .. } => "file",
            CacheEntry::CargoCrate { .. } => "crate",
            CacheEntry::CargoIndex { .. } => "index",
        }
    }
}

/// Writes fetched artifacts into local storage on tasks that outlive the request.
#[derive(Debug, Clone)]
pub struct PullThroughCacheWriter {
    tracker: TaskTracker,
    timeout: Duration,
    content: ContentStore,
    manifests: ManifestStore,
    metadata: Arc<dyn MetadataStore>,
    index: CargoIndexFiles,
}

impl PullThroughCacheWriter {
    /// Create a writer whose tasks each get `timeout` to finish.
    pub fn new(
        content: ContentStore,
        manifests: ManifestStore,
        metadata: Arc<dyn MetadataStore>,
        index: CargoIndexFiles,
        timeout: Duration,
    ) -> Self {
        Self {
            tracker: TaskTracker::new(),
            timeout,
            content,
            manifests,
            metadata,
            index,
        }
    }

    /// Number of cache writes still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Persist an entry in the background.
    ///
    /// The task is not tied to the calling request: dropping the request future does
    /// not cancel it, and its span only follows from the request span. Failures are
    /// logged and otherwise ignored.
    pub fn schedule(&self, context: CacheContext, entry: CacheEntry) {
        let span = tracing::info_span!(
            parent: None,
            "cache_write",
            registry = %context.registry,
            image = %context.image,
            principal = %context.principal,
            kind = entry.kind(),
        );
        span.follows_from(tracing::Span::current());

        let writer = self.clone();
        let timeout = self.timeout;
        self.tracker.spawn(
            async move {
                match tokio::time::timeout(timeout, writer.write(&context, entry)).await {
                    Ok(Ok(())) => tracing::debug!("cached"),
                    Ok(Err(error)) => tracing::warn!(%error, "cache write failed"),
                    Err(_) => tracing::warn!(?timeout, "cache write timed out"),
                }
            }
            .instrument(span),
        );
    }

    /// Wait until every scheduled write has finished.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn write(&self, context: &CacheContext, entry: CacheEntry) -> RegistryResult<()> {
        let registry = context.registry;
        let image = context.image.as_str();

        match entry {
            CacheEntry::Blob { digest, bytes } => {
                let stored = self.content.put_bytes(&bytes, Some(&digest)).await?;
                self.metadata
                    .link_blob(registry, image, &stored.digest, stored.size)
                    .await?;
            }
            CacheEntry::Manifest {
                tag,
                media_type,
                bytes,
            } => {
                let parsed = self.manifests.validate(media_type.as_deref(), &bytes)?;
                self.manifests
                    .store(registry, image, tag.as_deref(), parsed, &bytes)
                    .await?;
            }
            CacheEntry::File {
                version,
                filename,
                bytes,
            } => {
                self.add_file(registry, image, &version, &filename, &bytes)
                    .await?;
            }
            CacheEntry::CargoCrate { version, bytes } => {
                let filename = crate_file_name(image, &version);
                self.add_file(registry, image, &version, &filename, &bytes)
                    .await?;
            }
            CacheEntry::CargoIndex { bytes } => {
                self.index.write(registry, image, &bytes).await?;
            }
        }
        Ok(())
    }

    async fn add_file(
        &self,
        registry: RegistryId,
        image: &str,
        version: &str,
        filename: &str,
        bytes: &[u8],
    ) -> RegistryResult<()> {
        let stored = self.content.put_bytes(bytes, None).await?;
        let mut artifact = self
            .metadata
            .artifact(registry, image, version)
            .await?
            .unwrap_or_else(|| Artifact::new(registry, image, version));
        artifact.upsert_file(ArtifactFile {
            name: filename.to_owned(),
            digest: stored.digest,
            size: stored.size,
        });
        self.metadata.upsert_artifact(artifact).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::metadata::MemoryMetadataStore;

    fn writer(timeout: Duration) -> (PullThroughCacheWriter, Arc<MemoryMetadataStore>) {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let bucket = Storage::new(MemoryStorage::new()).bucket("registry");
        let content = ContentStore::new(bucket.clone());
        let manifests = ManifestStore::new(content.clone(), metadata.clone(), 1024 * 1024);
        let writer = PullThroughCacheWriter::new(
            content,
            manifests,
            metadata.clone(),
            CargoIndexFiles::new(bucket),
            timeout,
        );
        (writer, metadata)
    }

    fn context() -> CacheContext {
        CacheContext {
            principal: Principal::new("ci"),
            registry: RegistryId(2),
            image: "tool".into(),
        }
    }

    #[tokio::test]
    async fn writes_blobs_and_files() {
        let (writer, metadata) = writer(Duration::from_secs(5));
        let digest = Digest::sha256(b"blob");

        writer.schedule(
            context(),
            CacheEntry::Blob {
                digest: digest.clone(),
                bytes: Bytes::from_static(b"blob"),
            },
        );
        writer.schedule(
            context(),
            CacheEntry::File {
                version: "1.0".into(),
                filename: "tool.tgz".into(),
                bytes: Bytes::from_static(b"file"),
            },
        );
        writer.flush().await;

        assert_eq!(writer.in_flight(), 0);
        assert_eq!(
            metadata.blob_link(RegistryId(2), "tool", &digest).await.unwrap(),
            Some(4)
        );
        let artifact = metadata
            .artifact(RegistryId(2), "tool", "1.0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.file("tool.tgz").unwrap().digest, Digest::sha256(b"file"));
    }

    #[tokio::test]
    async fn failures_are_dropped() {
        let (writer, metadata) = writer(Duration::from_secs(5));
        let digest = Digest::sha256(b"expected");

        writer.schedule(
            context(),
            CacheEntry::Blob {
                digest: digest.clone(),
                bytes: Bytes::from_static(b"tampered"),
            },
        );
        writer.flush().await;

        assert!(!writer.content.exists(&digest).await.unwrap());
        assert_eq!(
            metadata.blob_link(RegistryId(2), "tool", &digest).await.unwrap(),
            None
        );

        // the tracker accepts new work after a flush
        writer.schedule(
            context(),
            CacheEntry::CargoIndex {
                bytes: Bytes::from_static(b"{}\n"),
            },
        );
        writer.flush().await;
        assert_eq!(
            &writer.index.read(RegistryId(2), "tool").await.unwrap().unwrap()[..],
            b"{}\n"
        );
    }
}
