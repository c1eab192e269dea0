//! Cargo crates: the sparse index, downloads, publish and yank.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Buf as _, Bytes};
use camino::Utf8PathBuf;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use storage::StorageBucket;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Upstream, denied};
use crate::cache::CacheEntry;
use crate::content::ContentStore;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::{MetadataError, MetadataStore};
use crate::model::{Artifact, ArtifactFile, Principal, Registry, RegistryId};
use crate::remote::RemoteRequest;

/// `{name}-{version}.crate`
pub fn crate_file_name(name: &str, version: &str) -> String {
    format!("{name}-{version}.crate")
}

/// The name crates are stored under: Cargo treats case and `-`/`_` as equivalent.
pub fn canonical_crate_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '_' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Crate names: ASCII letters, digits, `-` and `_`, starting with a letter.
pub fn check_crate_name(name: &str) -> RegistryResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        return Err(RegistryError::NameInvalid(name.to_owned()));
    }
    Ok(())
}

/// `MAJOR.MINOR.PATCH` with optional pre-release and build suffixes.
fn check_version(version: &str) -> RegistryResult<()> {
    let core = version.split('+').next().unwrap_or(version);
    let core = core.split('-').next().unwrap_or(core);
    let parts: Vec<_> = core.split('.').collect();
    let numeric = |part: &&str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());

    if parts.len() != 3 || !parts.iter().all(numeric) {
        return Err(RegistryError::PackageInvalid(format!(
            "invalid version: {version}"
        )));
    }
    Ok(())
}

/// Sparse index files, one per crate and registry.
#[derive(Debug, Clone)]
pub struct CargoIndexFiles {
    bucket: StorageBucket,
}

impl CargoIndexFiles {
    /// Store index files in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    fn path(registry: RegistryId, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("index/{registry}/{}", canonical_crate_name(name)))
    }

    /// The index file of a crate, if one was written.
    pub async fn read(&self, registry: RegistryId, name: &str) -> RegistryResult<Option<Bytes>> {
        match self.bucket.read(&Self::path(registry, name)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the index file of a crate.
    pub async fn write(&self, registry: RegistryId, name: &str, data: &[u8]) -> RegistryResult<()> {
        self.bucket.write(&Self::path(registry, name), data).await?;
        Ok(())
    }
}

/// A dependency as `cargo publish` describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishDependency {
    /// Name of the dependency as published
    pub name: String,
    /// Version requirement
    pub version_req: String,
    /// Enabled features
    #[serde(default)]
    pub features: Vec<String>,
    /// Whether it is optional
    #[serde(default)]
    pub optional: bool,
    /// Whether default features are on
    #[serde(default = "default_true")]
    pub default_features: bool,
    /// Target platform
    #[serde(default)]
    pub target: Option<String>,
    /// `normal`, `dev` or `build`
    #[serde(default)]
    pub kind: Option<String>,
    /// Registry index URL, for crates from another registry
    #[serde(default)]
    pub registry: Option<String>,
    /// Renamed dependency name in `Cargo.toml`
    #[serde(default)]
    pub explicit_name_in_toml: Option<String>,
}

fn default_true() -> bool {
    true
}

/// The JSON half of a publish request. Fields not listed are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMetadata {
    /// Crate name
    pub name: String,
    /// Version
    pub vers: String,
    /// Dependencies
    #[serde(default)]
    pub deps: Vec<PublishDependency>,
    /// Feature table
    #[serde(default)]
    pub features: BTreeMap<String, Vec<String>>,
    /// Native library linked
    #[serde(default)]
    pub links: Option<String>,
    /// Minimum supported Rust version
    #[serde(default)]
    pub rust_version: Option<String>,
}

/// A decoded `PUT /api/v1/crates/new` body.
#[derive(Debug, Clone)]
pub struct CratePublish {
    /// Package metadata
    pub metadata: PublishMetadata,
    /// The `.crate` archive
    pub archive: Bytes,
}

fn take_frame(body: &mut Bytes, what: &str) -> RegistryResult<Bytes> {
    let truncated = || RegistryError::PackageInvalid(format!("truncated publish body: {what}"));
    if body.remaining() < 4 {
        return Err(truncated());
    }
    let len = body.get_u32_le() as usize;
    if body.remaining() < len {
        return Err(truncated());
    }
    Ok(body.split_to(len))
}

impl CratePublish {
    /// Decode `u32 LE length, JSON, u32 LE length, archive`.
    pub fn parse(mut body: Bytes) -> RegistryResult<Self> {
        let json = take_frame(&mut body, "metadata")?;
        let archive = take_frame(&mut body, "crate")?;

        let metadata: PublishMetadata = serde_json::from_slice(&json)
            .map_err(|err| RegistryError::PackageInvalid(format!("publish metadata: {err}")))?;
        check_crate_name(&metadata.name)?;
        check_version(&metadata.vers)?;

        Ok(Self { metadata, archive })
    }
}

/// A dependency line of the sparse index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDependency {
    /// Name used in code (the rename, if any)
    pub name: String,
    /// Version requirement
    pub req: String,
    /// Enabled features
    pub features: Vec<String>,
    /// Whether it is optional
    pub optional: bool,
    /// Whether default features are on
    pub default_features: bool,
    /// Target platform
    pub target: Option<String>,
    /// `normal`, `dev` or `build`
    pub kind: Option<String>,
    /// Registry index URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Real crate name, when renamed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

impl From<PublishDependency> for IndexDependency {
    fn from(dep: PublishDependency) -> Self {
        let (name, package) = match dep.explicit_name_in_toml {
            Some(rename) => (rename, Some(dep.name)),
            None => (dep.name, None),
        };
        Self {
            name,
            req: dep.version_req,
            features: dep.features,
            optional: dep.optional,
            default_features: dep.default_features,
            target: dep.target,
            kind: dep.kind,
            registry: dep.registry,
            package,
        }
    }
}

/// One line of a sparse index file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Crate name
    pub name: String,
    /// Version
    pub vers: String,
    /// Dependencies
    pub deps: Vec<IndexDependency>,
    /// SHA-256 of the `.crate` file, hex
    pub cksum: String,
    /// Features using only the original syntax
    pub features: BTreeMap<String, Vec<String>>,
    /// Features using `dep:` or `?/` syntax
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features2: BTreeMap<String, Vec<String>>,
    /// Whether the version is yanked
    pub yanked: bool,
    /// Native library linked
    pub links: Option<String>,
    /// Minimum supported Rust version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rust_version: Option<String>,
    /// Index format version, 2 when `features2` is present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u32>,
}

impl IndexEntry {
    /// Build the index line of a freshly published version.
    pub fn new(metadata: PublishMetadata, cksum: String) -> Self {
        let (features2, features): (BTreeMap<_, _>, BTreeMap<_, _>) =
            metadata.features.into_iter().partition(|(_, values)| {
                values
                    .iter()
                    .any(|value| value.starts_with("dep:") || value.contains("?/"))
            });
        let v = (!features2.is_empty()).then_some(2);

        Self {
            name: metadata.name,
            vers: metadata.vers,
            deps: metadata.deps.into_iter().map(IndexDependency::from).collect(),
            cksum,
            features,
            features2,
            yanked: false,
            links: metadata.links,
            rust_version: metadata.rust_version,
            v,
        }
    }
}

/// Cargo registry operations on one registry.
#[async_trait::async_trait]
pub trait CargoArtifacts: std::fmt::Debug + Send + Sync {
    /// The sparse index file of a crate.
    async fn index_file(
        &self,
        principal: &Principal,
        registry: &Registry,
        name: &str,
    ) -> RegistryResult<Bytes>;

    /// The `.crate` archive of a version.
    async fn download(
        &self,
        principal: &Principal,
        registry: &Registry,
        name: &str,
        version: &str,
    ) -> RegistryResult<Bytes>;

    /// Store a new version and add it to the index.
    async fn publish(&self, registry: &Registry, publish: CratePublish) -> RegistryResult<IndexEntry>;

    /// Set or clear the yank flag of a version.
    async fn set_yanked(
        &self,
        registry: &Registry,
        name: &str,
        version: &str,
        yanked: bool,
    ) -> RegistryResult<()>;

    /// Rebuild a crate's index file from stored versions.
    async fn regenerate_index(&self, registry: &Registry, name: &str) -> RegistryResult<()>;
}

/// Crates published to this registry.
///
/// Versions are keyed by [`canonical_crate_name`]. Every change to a crate's versions
/// and the index rewrite that follows it run under that crate's lock.
#[derive(Debug, Clone)]
pub struct LocalCargo {
    content: ContentStore,
    metadata: Arc<dyn MetadataStore>,
    index: CargoIndexFiles,
    locks: Arc<DashMap<(RegistryId, String), Arc<Mutex<()>>>>,
}

impl LocalCargo {
    /// Create the local implementation.
    pub fn new(
        content: ContentStore,
        metadata: Arc<dyn MetadataStore>,
        index: CargoIndexFiles,
    ) -> Self {
        Self {
            content,
            metadata,
            index,
            locks: Arc::new(DashMap::new()),
        }
    }

    async fn lock(&self, registry: RegistryId, canonical: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry((registry, canonical.to_owned()))
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn version(
        &self,
        registry: &Registry,
        name: &str,
        version: &str,
    ) -> RegistryResult<Artifact> {
        self.metadata
            .artifact(registry.id, &canonical_crate_name(name), version)
            .await?
            .ok_or_else(|| RegistryError::ArtifactNotFound(format!("{name}@{version}")))
    }

    /// Refuse a publish whose name differs only in case or `-`/`_` from an existing crate.
    async fn check_spelling(
        &self,
        registry: &Registry,
        canonical: &str,
        name: &str,
    ) -> RegistryResult<()> {
        let existing = self.metadata.artifacts(registry.id, canonical).await?;
        let Some(artifact) = existing.first() else {
            return Ok(());
        };

        let published = artifact
            .metadata
            .get("name")
            .and_then(|value| value.as_str())
            .unwrap_or(canonical);
        if published != name {
            return Err(MetadataError::Conflict(format!(
                "crate {name} conflicts with existing crate {published}"
            ))
            .into());
        }
        Ok(())
    }

    /// Rewrite the index file from stored versions. The caller holds the crate lock.
    async fn write_index(&self, registry: &Registry, canonical: &str) -> RegistryResult<()> {
        let versions = self.metadata.artifacts(registry.id, canonical).await?;
        if versions.is_empty() {
            return Err(RegistryError::ArtifactNotFound(canonical.to_owned()));
        }

        let mut file = String::new();
        for artifact in versions {
            let mut entry: IndexEntry = serde_json::from_value(artifact.metadata).map_err(|err| {
                RegistryError::Unknown(format!("stored index entry for {canonical}: {err}"))
            })?;
            entry.yanked = artifact.yanked;
            let line = serde_json::to_string(&entry)
                .map_err(|err| RegistryError::Unknown(format!("index entry: {err}")))?;
            file.push_str(&line);
            file.push('\n');
        }

        self.index.write(registry.id, canonical, file.as_bytes()).await
    }
}

#[async_trait::async_trait]
impl CargoArtifacts for LocalCargo {
    async fn index_file(
        &self,
        _principal: &Principal,
        registry: &Registry,
        name: &str,
    ) -> RegistryResult<Bytes> {
        self.index
            .read(registry.id, name)
            .await?
            .ok_or_else(|| RegistryError::ArtifactNotFound(name.to_owned()))
    }

    async fn download(
        &self,
        _principal: &Principal,
        registry: &Registry,
        name: &str,
        version: &str,
    ) -> RegistryResult<Bytes> {
        let artifact = self.version(registry, name, version).await?;
        let file_name = crate_file_name(&canonical_crate_name(name), version);
        let file = artifact
            .file(&file_name)
            .ok_or_else(|| RegistryError::ArtifactNotFound(file_name.clone()))?;
        self.content.get(&file.digest).await
    }

    #[tracing::instrument(skip(self, publish), fields(name = %publish.metadata.name, vers = %publish.metadata.vers))]
    async fn publish(&self, registry: &Registry, publish: CratePublish) -> RegistryResult<IndexEntry> {
        let CratePublish { metadata, archive } = publish;
        let canonical = canonical_crate_name(&metadata.name);
        let version = metadata.vers.clone();

        let _guard = self.lock(registry.id, &canonical).await;
        self.check_spelling(registry, &canonical, &metadata.name).await?;

        let stored = self.content.put_bytes(&archive, None).await?;
        let entry = IndexEntry::new(metadata, stored.digest.hex().to_owned());

        let mut artifact = Artifact::new(registry.id, &canonical, &version);
        artifact.metadata = serde_json::to_value(&entry)
            .map_err(|err| RegistryError::Unknown(format!("index entry: {err}")))?;
        artifact.files.push(ArtifactFile {
            name: crate_file_name(&canonical, &version),
            digest: stored.digest,
            size: stored.size,
        });
        self.metadata.insert_artifact(artifact).await?;

        self.write_index(registry, &canonical).await?;
        tracing::info!(%registry, "crate published");
        Ok(entry)
    }

    async fn set_yanked(
        &self,
        registry: &Registry,
        name: &str,
        version: &str,
        yanked: bool,
    ) -> RegistryResult<()> {
        let canonical = canonical_crate_name(name);
        let _guard = self.lock(registry.id, &canonical).await;

        let mut artifact = self.version(registry, name, version).await?;
        artifact.yanked = yanked;
        self.metadata.upsert_artifact(artifact).await?;
        self.write_index(registry, &canonical).await
    }

    async fn regenerate_index(&self, registry: &Registry, name: &str) -> RegistryResult<()> {
        let canonical = canonical_crate_name(name);
        let _guard = self.lock(registry.id, &canonical).await;
        self.write_index(registry, &canonical).await
    }
}

/// Pull-through access to crates.io or another Cargo registry.
#[derive(Debug, Clone)]
pub struct ProxyCargo {
    local: LocalCargo,
    upstream: Upstream,
}

impl ProxyCargo {
    /// Wrap the local implementation, which holds the proxy's cache.
    pub fn new(local: LocalCargo, upstream: Upstream) -> Self {
        Self { local, upstream }
    }
}

#[async_trait::async_trait]
impl CargoArtifacts for ProxyCargo {
    /// Index files change upstream, so the cached copy is only used when the upstream
    /// is unreachable.
    async fn index_file(
        &self,
        principal: &Principal,
        registry: &Registry,
        name: &str,
    ) -> RegistryResult<Bytes> {
        let request = RemoteRequest::CargoIndex {
            name: name.to_owned(),
        };
        match self.upstream.fetch(registry, request).await {
            Ok(artifact) => {
                self.upstream.cache(
                    principal,
                    registry,
                    name,
                    CacheEntry::CargoIndex {
                        bytes: artifact.bytes.clone(),
                    },
                );
                Ok(artifact.bytes)
            }
            Err(err) if err.is_not_found() => Err(err),
            Err(err) => {
                tracing::warn!(%registry, name, error = %err, "upstream index unavailable, serving cached copy");
                match self.local.index_file(principal, registry, name).await {
                    Ok(cached) => Ok(cached),
                    Err(cache_err) if cache_err.is_not_found() => Err(err),
                    Err(cache_err) => Err(cache_err),
                }
            }
        }
    }

    async fn download(
        &self,
        principal: &Principal,
        registry: &Registry,
        name: &str,
        version: &str,
    ) -> RegistryResult<Bytes> {
        match self.local.download(principal, registry, name, version).await {
            Err(err) if err.is_not_found() => {}
            cached => return cached,
        }

        let artifact = self
            .upstream
            .fetch(
                registry,
                RemoteRequest::CargoCrate {
                    name: name.to_owned(),
                    version: version.to_owned(),
                },
            )
            .await?;
        self.upstream.cache(
            principal,
            registry,
            &canonical_crate_name(name),
            CacheEntry::CargoCrate {
                version: version.to_owned(),
                bytes: artifact.bytes.clone(),
            },
        );
        Ok(artifact.bytes)
    }

    async fn publish(&self, registry: &Registry, _publish: CratePublish) -> RegistryResult<IndexEntry> {
        Err(denied(registry))
    }

    async fn set_yanked(
        &self,
        registry: &Registry,
        _name: &str,
        _version: &str,
        _yanked: bool,
    ) -> RegistryResult<()> {
        Err(denied(registry))
    }

    async fn regenerate_index(&self, registry: &Registry, _name: &str) -> RegistryResult<()> {
        Err(denied(registry))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut as _, BytesMut};
    use serde_json::json;
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::digest::Digest;
    use crate::metadata::{MemoryMetadataStore, MetadataError};
    use crate::model::{ImagePolicy, PackageType, RegistryKind};

    fn publish_body(metadata: serde_json::Value, archive: &[u8]) -> Bytes {
        let json = serde_json::to_vec(&metadata).unwrap();
        let mut body = BytesMut::new();
        body.put_u32_le(json.len() as u32);
        body.put_slice(&json);
        body.put_u32_le(archive.len() as u32);
        body.put_slice(archive);
        body.freeze()
    }

    fn local() -> (LocalCargo, Registry) {
        let bucket = Storage::new(MemoryStorage::new()).bucket("registry");
        let local = LocalCargo::new(
            ContentStore::new(bucket.clone()),
            Arc::new(MemoryMetadataStore::new()),
            CargoIndexFiles::new(bucket),
        );
        let registry = Registry {
            id: RegistryId(1),
            name: "crates".into(),
            scope: "root".into(),
            package_type: PackageType::Cargo,
            kind: RegistryKind::Virtual {
                upstream_proxies: vec![],
            },
            policy: ImagePolicy::default(),
        };
        (local, registry)
    }

    #[test]
    fn parses_publish_framing() {
        let body = publish_body(
            json!({
                "name": "demo",
                "vers": "0.1.0",
                "deps": [{
                    "name": "serde",
                    "version_req": "^1",
                    "features": ["derive"],
                    "optional": false,
                    "default_features": true,
                    "target": null,
                    "kind": "normal",
                    "explicit_name_in_toml": "serde_crate"
                }],
                "features": {"full": ["dep:serde"], "std": []},
                "authors": ["someone"],
                "links": null
            }),
            b"archive",
        );

        let publish = CratePublish::parse(body).unwrap();
        assert_eq!(&publish.archive[..], b"archive");

        let entry = IndexEntry::new(publish.metadata, "00".into());
        assert_eq!(entry.deps[0].name, "serde_crate");
        assert_eq!(entry.deps[0].package.as_deref(), Some("serde"));
        assert_eq!(entry.deps[0].req, "^1");
        assert!(entry.features.contains_key("std"));
        assert!(entry.features2.contains_key("full"));
        assert_eq!(entry.v, Some(2));
    }

    #[test]
    fn rejects_bad_publishes() {
        let truncated = Bytes::from_static(&[10, 0, 0, 0, b'{']);
        assert!(matches!(
            CratePublish::parse(truncated),
            Err(RegistryError::PackageInvalid(_))
        ));

        let bad_name = publish_body(json!({"name": "1bad", "vers": "1.0.0"}), b"");
        assert!(matches!(
            CratePublish::parse(bad_name),
            Err(RegistryError::NameInvalid(_))
        ));

        let bad_version = publish_body(json!({"name": "ok", "vers": "1.0"}), b"");
        assert!(CratePublish::parse(bad_version).is_err());
        assert!(check_version("1.0.0-beta.1+build.5").is_ok());
    }

    #[tokio::test]
    async fn publish_writes_index_and_yank_rewrites_it() {
        let (local, registry) = local();
        let principal = Principal::anonymous();
        let body = publish_body(json!({"name": "demo", "vers": "0.1.0"}), b"crate bytes");

        let entry = local
            .publish(&registry, CratePublish::parse(body.clone()).unwrap())
            .await
            .unwrap();
        assert_eq!(entry.cksum, Digest::sha256(b"crate bytes").hex());

        let index = local.index_file(&principal, &registry, "Demo").await.unwrap();
        let line: serde_json::Value = serde_json::from_slice(&index).unwrap();
        assert_eq!(line["vers"], "0.1.0");
        assert_eq!(line["yanked"], false);

        let err = local
            .publish(&registry, CratePublish::parse(body).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Metadata(MetadataError::Conflict(_))));

        local.set_yanked(&registry, "demo", "0.1.0", true).await.unwrap();
        let index = local.index_file(&principal, &registry, "demo").await.unwrap();
        let line: serde_json::Value = serde_json::from_slice(&index).unwrap();
        assert_eq!(line["yanked"], true);

        let archive = local
            .download(&principal, &registry, "demo", "0.1.0")
            .await
            .unwrap();
        assert_eq!(&archive[..], b"crate bytes");

        assert!(
            local
                .set_yanked(&registry, "demo", "9.9.9", true)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishes_all_reach_the_index() {
        let (local, registry) = local();
        let mut tasks = tokio::task::JoinSet::new();
        for minor in 0..16 {
            let local = local.clone();
            let registry = registry.clone();
            tasks.spawn(async move {
                let vers = format!("1.{minor}.0");
                let body = publish_body(json!({"name": "demo", "vers": &vers}), vers.as_bytes());
                local
                    .publish(&registry, CratePublish::parse(body).unwrap())
                    .await
                    .unwrap();
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        let index = local
            .index_file(&Principal::anonymous(), &registry, "demo")
            .await
            .unwrap();
        let lines = std::str::from_utf8(&index).unwrap().lines().count();
        assert_eq!(lines, 16);
    }

    #[tokio::test]
    async fn crate_names_ignore_case_and_separators() {
        let (local, registry) = local();
        let principal = Principal::anonymous();
        let publish = |name: &str, vers: &str| {
            let body = publish_body(json!({"name": name, "vers": vers}), vers.as_bytes());
            CratePublish::parse(body).unwrap()
        };

        local.publish(&registry, publish("Foo_Bar", "1.0.0")).await.unwrap();

        for other in ["foo_bar", "foo-bar", "FOO-BAR"] {
            let err = local
                .publish(&registry, publish(other, "2.0.0"))
                .await
                .unwrap_err();
            assert!(matches!(err, RegistryError::Metadata(MetadataError::Conflict(_))));
        }

        local.publish(&registry, publish("Foo_Bar", "2.0.0")).await.unwrap();

        let index = local.index_file(&principal, &registry, "foo-bar").await.unwrap();
        let lines: Vec<serde_json::Value> = std::str::from_utf8(&index)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| line["name"] == "Foo_Bar"));

        let archive = local
            .download(&principal, &registry, "foo-bar", "1.0.0")
            .await
            .unwrap();
        assert_eq!(&archive[..], b"1.0.0");

        local.set_yanked(&registry, "FOO_BAR", "2.0.0", true).await.unwrap();
        assert_eq!(canonical_crate_name("Foo_Bar"), "foo-bar");
    }
}
