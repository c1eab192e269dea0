//! # Metadata store
//!
//! Registries, artifact versions, manifests, tags, blob links and quarantine markers.
//! The relational layout of a production store is not modelled here; [`MetadataStore`]
//! is the seam, and [`memory::MemoryMetadataStore`] backs tests and single-node servers.

pub mod memory;

use crate::digest::Digest;
use crate::model::{Artifact, ManifestRecord, Registry, RegistryId};

pub use self::memory::MemoryMetadataStore;

/// Metadata errors
#[derive(thiserror::Error, Debug, Clone)]
pub enum MetadataError {
    /// The record already exists
    #[error("already exists: {0}")]
    Conflict(String),

    /// The backing store failed
    #[error("metadata store error: {0}")]
    Internal(String),
}

/// Persistent registry metadata.
///
/// Lookups that find nothing return `Ok(None)` / `Ok(false)`; errors are reserved for
/// the store itself failing or for conflicting writes.
#[async_trait::async_trait]
pub trait MetadataStore: std::fmt::Debug + Send + Sync {
    /// Look a registry up by scope and name.
    async fn registry(&self, scope: &str, name: &str) -> Result<Option<Registry>, MetadataError>;

    /// Look a registry up by id.
    async fn registry_by_id(&self, id: RegistryId) -> Result<Option<Registry>, MetadataError>;

    /// Fetch one artifact version.
    async fn artifact(
        &self,
        registry: RegistryId,
        image: &str,
        version: &str,
    ) -> Result<Option<Artifact>, MetadataError>;

    /// Every version of an image, oldest first.
    async fn artifacts(
        &self,
        registry: RegistryId,
        image: &str,
    ) -> Result<Vec<Artifact>, MetadataError>;

    /// Store a new version; [`MetadataError::Conflict`] if it already exists.
    async fn insert_artifact(&self, artifact: Artifact) -> Result<(), MetadataError>;

    /// Store or replace a version.
    async fn upsert_artifact(&self, artifact: Artifact) -> Result<(), MetadataError>;

    /// Remove a version. Returns whether it existed.
    async fn delete_artifact(
        &self,
        registry: RegistryId,
        image: &str,
        version: &str,
    ) -> Result<bool, MetadataError>;

    /// Record that a blob belongs to a repository.
    async fn link_blob(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
        size: u64,
    ) -> Result<(), MetadataError>;

    /// Size of a blob linked into a repository.
    async fn blob_link(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<Option<u64>, MetadataError>;

    /// Remove a blob link. Returns whether it existed.
    async fn unlink_blob(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<bool, MetadataError>;

    /// Record a manifest.
    async fn put_manifest(&self, record: ManifestRecord) -> Result<(), MetadataError>;

    /// Fetch a manifest by digest.
    async fn manifest(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<Option<ManifestRecord>, MetadataError>;

    /// Remove a manifest and every tag pointing at it. Returns whether it existed.
    async fn delete_manifest(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<bool, MetadataError>;

    /// Manifest lists in the repository that reference `digest`.
    async fn referencing_lists(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<Vec<Digest>, MetadataError>;

    /// Point a tag at a manifest, replacing any previous binding.
    async fn tag(
        &self,
        registry: RegistryId,
        image: &str,
        tag: &str,
        digest: &Digest,
    ) -> Result<(), MetadataError>;

    /// Resolve a tag.
    async fn resolve_tag(
        &self,
        registry: RegistryId,
        image: &str,
        tag: &str,
    ) -> Result<Option<Digest>, MetadataError>;

    /// Remove a tag. Returns whether it existed.
    async fn untag(&self, registry: RegistryId, image: &str, tag: &str)
    -> Result<bool, MetadataError>;

    /// Tags of a repository, sorted.
    async fn tags(&self, registry: RegistryId, image: &str) -> Result<Vec<String>, MetadataError>;

    /// Whether content has been quarantined by the (external) scanner.
    async fn is_quarantined(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<bool, MetadataError>;
}
