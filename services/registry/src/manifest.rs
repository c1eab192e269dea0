//! Manifest validation, storage and tags.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;

use crate::content::ContentStore;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::MetadataStore;
use crate::model::{ManifestRecord, RegistryId};

/// Docker schema 1, unsigned
pub const DOCKER_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Docker schema 1, signed
pub const DOCKER_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker schema 2 image manifest
pub const DOCKER_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list
pub const DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Every media type accepted on push, also sent as `Accept` upstream.
pub const SUPPORTED_MEDIA_TYPES: &[&str] = &[
    OCI_MANIFEST,
    OCI_INDEX,
    DOCKER_V2,
    DOCKER_LIST,
    DOCKER_V1,
    DOCKER_V1_SIGNED,
];

fn is_list(media_type: &str) -> bool {
    matches!(media_type, OCI_INDEX | DOCKER_LIST)
}

/// A manifest reference from a URL: a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A mutable tag
    Tag(String),
    /// A content digest
    Digest(Digest),
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            return s.parse().map(Reference::Digest);
        }

        let valid = !s.is_empty()
            && s.len() <= 128
            && s.bytes().enumerate().all(|(i, b)| {
                b.is_ascii_alphanumeric() || b == b'_' || (i > 0 && (b == b'.' || b == b'-'))
            });
        if !valid {
            return Err(RegistryError::ManifestInvalid(format!("invalid tag: {s}")));
        }
        Ok(Reference::Tag(s.to_owned()))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => digest.fmt(f),
        }
    }
}

/// What validation learned about a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedManifest {
    /// Effective media type
    pub media_type: String,
    /// Referenced blobs (config and layers)
    pub blobs: Vec<Digest>,
    /// Referenced manifests (for lists)
    pub manifests: Vec<Digest>,
}

/// Detect manifest type from content
fn detect_manifest_type(json: &Value) -> &str {
    if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
        return media_type;
    }

    match json.get("schemaVersion").and_then(|v| v.as_u64()) {
        Some(1) if json.get("signatures").is_some() => DOCKER_V1_SIGNED,
        Some(1) => DOCKER_V1,
        Some(2) if json.get("manifests").is_some() => DOCKER_LIST,
        Some(2) => DOCKER_V2,
        _ => OCI_MANIFEST,
    }
}

fn strip_parameters(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

fn parse_digest(value: Option<&Value>, what: &str) -> RegistryResult<Digest> {
    value
        .and_then(Value::as_str)
        .ok_or_else(|| RegistryError::ManifestInvalid(format!("missing {what} digest")))?
        .parse()
        .map_err(|_| RegistryError::ManifestInvalid(format!("invalid {what} digest")))
}

fn digests(json: &Value, array: &str, field: &str) -> RegistryResult<Vec<Digest>> {
    match json.get(array) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| parse_digest(entry.get(field), array))
            .collect(),
        Some(_) => Err(RegistryError::ManifestInvalid(format!("{array} is not an array"))),
    }
}

/// Validates and persists manifests.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    content: ContentStore,
    metadata: Arc<dyn MetadataStore>,
    max_bytes: usize,
}

impl ManifestStore {
    /// Create a store with a payload size cap.
    pub fn new(content: ContentStore, metadata: Arc<dyn MetadataStore>, max_bytes: usize) -> Self {
        Self {
            content,
            metadata,
            max_bytes,
        }
    }

    /// Check size, media type and JSON shape, and collect references.
    pub fn validate(&self, content_type: Option<&str>, payload: &[u8]) -> RegistryResult<ParsedManifest> {
        if payload.len() > self.max_bytes {
            return Err(RegistryError::SizeInvalid(format!(
                "manifest is {} bytes, limit is {}",
                payload.len(),
                self.max_bytes
            )));
        }

        let json: Value = serde_json::from_slice(payload)
            .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;
        if !json.is_object() {
            return Err(RegistryError::ManifestInvalid("not a JSON object".into()));
        }
        if json.get("schemaVersion").and_then(Value::as_u64).is_none() {
            return Err(RegistryError::ManifestInvalid("missing schemaVersion".into()));
        }

        let declared = json.get("mediaType").and_then(Value::as_str);
        let media_type = match content_type.map(strip_parameters) {
            Some(content_type) => {
                if declared.is_some_and(|declared| declared != content_type) {
                    return Err(RegistryError::ManifestInvalid(format!(
                        "mediaType {} does not match Content-Type {content_type}",
                        declared.unwrap_or_default()
                    )));
                }
                content_type
            }
            None => detect_manifest_type(&json),
        };

        if !SUPPORTED_MEDIA_TYPES.contains(&media_type) {
            return Err(RegistryError::UnsupportedMediaType(media_type.to_owned()));
        }

        if media_type == DOCKER_V1_SIGNED && json.get("signatures").is_none() {
            return Err(RegistryError::ManifestUnverified(
                "signed manifest carries no signatures".into(),
            ));
        }

        let (blobs, manifests) = Self::references(media_type, &json)?;
        Ok(ParsedManifest {
            media_type: media_type.to_owned(),
            blobs,
            manifests,
        })
    }

    /// Blob and manifest digests a manifest points at.
    pub fn references(media_type: &str, json: &Value) -> RegistryResult<(Vec<Digest>, Vec<Digest>)> {
        match media_type {
            OCI_INDEX | DOCKER_LIST => Ok((Vec::new(), digests(json, "manifests", "digest")?)),
            DOCKER_V1 | DOCKER_V1_SIGNED => Ok((digests(json, "fsLayers", "blobSum")?, Vec::new())),
            _ => {
                let mut blobs = vec![parse_digest(
                    json.get("config").and_then(|config| config.get("digest")),
                    "config",
                )?];
                blobs.extend(digests(json, "layers", "digest")?);
                Ok((blobs, Vec::new()))
            }
        }
    }

    /// Every referenced blob must be stored, every referenced manifest in this repository.
    pub async fn resolve(
        &self,
        registry: RegistryId,
        image: &str,
        parsed: &ParsedManifest,
    ) -> RegistryResult<()> {
        for blob in &parsed.blobs {
            if !self.content.exists(blob).await? {
                return Err(RegistryError::ManifestBlobUnknown(blob.clone()));
            }
        }
        for manifest in &parsed.manifests {
            if self.metadata.manifest(registry, image, manifest).await?.is_none() {
                return Err(RegistryError::ManifestBlobUnknown(manifest.clone()));
            }
        }
        Ok(())
    }

    /// Validate, resolve and store a pushed manifest.
    #[tracing::instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn commit(
        &self,
        registry: RegistryId,
        image: &str,
        reference: &Reference,
        content_type: Option<&str>,
        payload: &[u8],
    ) -> RegistryResult<ManifestRecord> {
        let parsed = self.validate(content_type, payload)?;

        let tag = match reference {
            Reference::Digest(expected) => {
                expected.verify(payload)?;
                None
            }
            Reference::Tag(tag) => Some(tag.as_str()),
        };

        self.resolve(registry, image, &parsed).await?;
        self.store(registry, image, tag, parsed, payload).await
    }

    /// Persist an already validated manifest and rebind `tag`.
    ///
    /// Referenced blobs that are present get linked into the repository; pull-through
    /// caching stores manifests before their layers have been fetched.
    pub(crate) async fn store(
        &self,
        registry: RegistryId,
        image: &str,
        tag: Option<&str>,
        parsed: ParsedManifest,
        payload: &[u8],
    ) -> RegistryResult<ManifestRecord> {
        let stored = self.content.put_bytes(payload, None).await?;

        for blob in &parsed.blobs {
            match self.content.size(blob).await {
                Ok(size) => self.metadata.link_blob(registry, image, blob, size).await?,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        let record = ManifestRecord {
            registry,
            image: image.to_owned(),
            digest: stored.digest.clone(),
            media_type: parsed.media_type,
            size: stored.size,
            blobs: parsed.blobs,
            manifests: parsed.manifests,
            created: Utc::now(),
        };
        self.metadata.put_manifest(record.clone()).await?;

        if let Some(tag) = tag {
            self.metadata.tag(registry, image, tag, &record.digest).await?;
        }

        tracing::debug!(digest = %record.digest, ?tag, "manifest stored");
        Ok(record)
    }

    async fn lookup(
        &self,
        registry: RegistryId,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<ManifestRecord> {
        let unknown = || RegistryError::ManifestUnknown(format!("{image}:{reference}"));

        let digest = match reference {
            Reference::Digest(digest) => digest.clone(),
            Reference::Tag(tag) => self
                .metadata
                .resolve_tag(registry, image, tag)
                .await?
                .ok_or_else(unknown)?,
        };

        self.metadata
            .manifest(registry, image, &digest)
            .await?
            .ok_or_else(unknown)
    }

    /// Fetch a manifest record and its payload, refusing quarantined content.
    pub async fn get(
        &self,
        registry: RegistryId,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<(ManifestRecord, Bytes)> {
        let record = self.lookup(registry, image, reference).await?;

        if self
            .metadata
            .is_quarantined(registry, image, &record.digest)
            .await?
        {
            return Err(RegistryError::Quarantined(record.digest));
        }

        let payload = self.content.get(&record.digest).await?;
        Ok((record, payload))
    }

    /// Delete a tag, or a manifest by digest along with the tags pointing at it.
    #[tracing::instrument(skip(self))]
    pub async fn delete(
        &self,
        registry: RegistryId,
        image: &str,
        reference: &Reference,
    ) -> RegistryResult<()> {
        match reference {
            Reference::Tag(tag) => {
                if !self.metadata.untag(registry, image, tag).await? {
                    return Err(RegistryError::ManifestUnknown(format!("{image}:{tag}")));
                }
            }
            Reference::Digest(digest) => {
                let lists = self.metadata.referencing_lists(registry, image, digest).await?;
                if let Some(list) = lists.into_iter().next() {
                    return Err(RegistryError::ManifestReferencedInList {
                        digest: digest.clone(),
                        list,
                    });
                }

                if !self.metadata.delete_manifest(registry, image, digest).await? {
                    return Err(RegistryError::ManifestUnknown(format!("{image}@{digest}")));
                }
            }
        }
        Ok(())
    }

    /// Tags of a repository, sorted.
    pub async fn list_tags(&self, registry: RegistryId, image: &str) -> RegistryResult<Vec<String>> {
        Ok(self.metadata.tags(registry, image).await?)
    }
}
