use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::RwLock;

use super::{MetadataError, MetadataStore};
use crate::digest::Digest;
use crate::model::{Artifact, ManifestRecord, Registry, RegistryId};

type Repo = (RegistryId, String);
type Keyed<K> = (RegistryId, String, K);

#[derive(Debug, Default)]
struct Tables {
    registries: BTreeMap<RegistryId, Registry>,
    artifacts: HashMap<Repo, Vec<Artifact>>,
    blobs: HashMap<Keyed<Digest>, u64>,
    manifests: HashMap<Keyed<Digest>, ManifestRecord>,
    tags: BTreeMap<Keyed<String>, Digest>,
    quarantine: HashSet<Keyed<Digest>>,
}

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl MemoryMetadataStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with registries.
    pub fn with_registries<I: IntoIterator<Item = Registry>>(registries: I) -> Self {
        let tables = Tables {
            registries: registries
                .into_iter()
                .map(|registry| (registry.id, registry))
                .collect(),
            ..Default::default()
        };
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Add or replace a registry.
    pub async fn insert_registry(&self, registry: Registry) {
        self.tables
            .write()
            .await
            .registries
            .insert(registry.id, registry);
    }

    /// Remove a registry record, leaving its content in place.
    pub async fn remove_registry(&self, id: RegistryId) -> Option<Registry> {
        self.tables.write().await.registries.remove(&id)
    }

    /// Set or clear a quarantine marker.
    pub async fn set_quarantine(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
        quarantined: bool,
    ) {
        let key = (registry, image.to_owned(), digest.clone());
        let mut tables = self.tables.write().await;
        if quarantined {
            tables.quarantine.insert(key);
        } else {
            tables.quarantine.remove(&key);
        }
    }
}

fn repo(registry: RegistryId, image: &str) -> Repo {
    (registry, image.to_owned())
}

fn keyed<K: Clone>(registry: RegistryId, image: &str, key: &K) -> Keyed<K> {
    (registry, image.to_owned(), key.clone())
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn registry(&self, scope: &str, name: &str) -> Result<Option<Registry>, MetadataError> {
        let tables = self.tables.read().await;
        Ok(tables
            .registries
            .values()
            .find(|registry| registry.scope == scope && registry.name == name)
            .cloned())
    }

    async fn registry_by_id(&self, id: RegistryId) -> Result<Option<Registry>, MetadataError> {
        Ok(self.tables.read().await.registries.get(&id).cloned())
    }

    async fn artifact(
        &self,
        registry: RegistryId,
        image: &str,
        version: &str,
    ) -> Result<Option<Artifact>, MetadataError> {
        let tables = self.tables.read().await;
        Ok(tables
            .artifacts
            .get(&repo(registry, image))
            .and_then(|versions| versions.iter().find(|a| a.version == version))
            .cloned())
    }

    async fn artifacts(
        &self,
        registry: RegistryId,
        image: &str,
    ) -> Result<Vec<Artifact>, MetadataError> {
        let tables = self.tables.read().await;
        Ok(tables
            .artifacts
            .get(&repo(registry, image))
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_artifact(&self, artifact: Artifact) -> Result<(), MetadataError> {
        let mut tables = self.tables.write().await;
        let versions = tables
            .artifacts
            .entry(repo(artifact.registry, &artifact.image))
            .or_default();

        if versions.iter().any(|a| a.version == artifact.version) {
            return Err(MetadataError::Conflict(format!(
                "{}@{}",
                artifact.image, artifact.version
            )));
        }

        versions.push(artifact);
        Ok(())
    }

    async fn upsert_artifact(&self, artifact: Artifact) -> Result<(), MetadataError> {
        let mut tables = self.tables.write().await;
        let versions = tables
            .artifacts
            .entry(repo(artifact.registry, &artifact.image))
            .or_default();

        match versions.iter_mut().find(|a| a.version == artifact.version) {
            Some(existing) => *existing = artifact,
            None => versions.push(artifact),
        }
        Ok(())
    }

    async fn delete_artifact(
        &self,
        registry: RegistryId,
        image: &str,
        version: &str,
    ) -> Result<bool, MetadataError> {
        let mut tables = self.tables.write().await;
        let Some(versions) = tables.artifacts.get_mut(&repo(registry, image)) else {
            return Ok(false);
        };

        let before = versions.len();
        versions.retain(|a| a.version != version);
        Ok(versions.len() != before)
    }

    async fn link_blob(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
        size: u64,
    ) -> Result<(), MetadataError> {
        self.tables
            .write()
            .await
            .blobs
            .insert(keyed(registry, image, digest), size);
        Ok(())
    }

    async fn blob_link(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<Option<u64>, MetadataError> {
        let tables = self.tables.read().await;
        Ok(tables.blobs.get(&keyed(registry, image, digest)).copied())
    }

    async fn unlink_blob(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<bool, MetadataError> {
        let mut tables = self.tables.write().await;
        Ok(tables.blobs.remove(&keyed(registry, image, digest)).is_some())
    }

    async fn put_manifest(&self, record: ManifestRecord) -> Result<(), MetadataError> {
        let key = keyed(record.registry, &record.image, &record.digest);
        self.tables.write().await.manifests.insert(key, record);
        Ok(())
    }

    async fn manifest(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<Option<ManifestRecord>, MetadataError> {
        let tables = self.tables.read().await;
        Ok(tables.manifests.get(&keyed(registry, image, digest)).cloned())
    }

    async fn delete_manifest(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<bool, MetadataError> {
        let mut tables = self.tables.write().await;
        let existed = tables
            .manifests
            .remove(&keyed(registry, image, digest))
            .is_some();

        tables
            .tags
            .retain(|(r, i, _), target| !(*r == registry && i == image && target == digest));

        Ok(existed)
    }

    async fn referencing_lists(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<Vec<Digest>, MetadataError> {
        let tables = self.tables.read().await;
        let mut lists: Vec<Digest> = tables
            .manifests
            .values()
            .filter(|m| m.registry == registry && m.image == image)
            .filter(|m| m.manifests.contains(digest))
            .map(|m| m.digest.clone())
            .collect();
        lists.sort();
        Ok(lists)
    }

    async fn tag(
        &self,
        registry: RegistryId,
        image: &str,
        tag: &str,
        digest: &Digest,
    ) -> Result<(), MetadataError> {
        self.tables
            .write()
            .await
            .tags
            .insert(keyed(registry, image, &tag.to_owned()), digest.clone());
        Ok(())
    }

    async fn resolve_tag(
        &self,
        registry: RegistryId,
        image: &str,
        tag: &str,
    ) -> Result<Option<Digest>, MetadataError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .get(&keyed(registry, image, &tag.to_owned()))
            .cloned())
    }

    async fn untag(
        &self,
        registry: RegistryId,
        image: &str,
        tag: &str,
    ) -> Result<bool, MetadataError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .tags
            .remove(&keyed(registry, image, &tag.to_owned()))
            .is_some())
    }

    async fn tags(&self, registry: RegistryId, image: &str) -> Result<Vec<String>, MetadataError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .keys()
            .filter(|(r, i, _)| *r == registry && i == image)
            .map(|(_, _, tag)| tag.clone())
            .collect())
    }

    async fn is_quarantined(
        &self,
        registry: RegistryId,
        image: &str,
        digest: &Digest,
    ) -> Result<bool, MetadataError> {
        let tables = self.tables.read().await;
        Ok(tables.quarantine.contains(&keyed(registry, image, digest)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn manifest(digest: &Digest, manifests: Vec<Digest>) -> ManifestRecord {
        ManifestRecord {
            registry: RegistryId(1),
            image: "app".into(),
            digest: digest.clone(),
            media_type: "application/vnd.oci.image.index.v1+json".into(),
            size: 2,
            blobs: Vec::new(),
            manifests,
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_versions_conflict() {
        let store = MemoryMetadataStore::new();
        let artifact = Artifact::new(RegistryId(1), "serde", "1.0.0");
        store.insert_artifact(artifact.clone()).await.unwrap();

        let err = store.insert_artifact(artifact.clone()).await.unwrap_err();
        assert!(matches!(err, MetadataError::Conflict(_)));

        let mut yanked = artifact;
        yanked.yanked = true;
        store.upsert_artifact(yanked).await.unwrap();
        let stored = store
            .artifact(RegistryId(1), "serde", "1.0.0")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.yanked);
        assert_eq!(store.artifacts(RegistryId(1), "serde").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_manifest_drops_its_tags() {
        let store = MemoryMetadataStore::new();
        let child = Digest::sha256(b"child");
        let list = Digest::sha256(b"list");

        store.put_manifest(manifest(&child, vec![])).await.unwrap();
        store
            .put_manifest(manifest(&list, vec![child.clone()]))
            .await
            .unwrap();
        store.tag(RegistryId(1), "app", "latest", &child).await.unwrap();
        store.tag(RegistryId(1), "app", "v1", &list).await.unwrap();

        assert_eq!(
            store
                .referencing_lists(RegistryId(1), "app", &child)
                .await
                .unwrap(),
            vec![list.clone()]
        );

        assert!(store.delete_manifest(RegistryId(1), "app", &child).await.unwrap());
        assert_eq!(store.tags(RegistryId(1), "app").await.unwrap(), vec!["v1"]);
        assert!(!store.delete_manifest(RegistryId(1), "app", &child).await.unwrap());
    }

    #[tokio::test]
    async fn quarantine_is_per_repository() {
        let store = MemoryMetadataStore::new();
        let digest = Digest::sha256(b"bad");
        store.set_quarantine(RegistryId(1), "app", &digest, true).await;

        assert!(store.is_quarantined(RegistryId(1), "app", &digest).await.unwrap());
        assert!(!store.is_quarantined(RegistryId(1), "other", &digest).await.unwrap());

        store.set_quarantine(RegistryId(1), "app", &digest, false).await;
        assert!(!store.is_quarantined(RegistryId(1), "app", &digest).await.unwrap());
    }
}
