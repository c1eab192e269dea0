//! Content-addressable blob storage.
//!
//! Blobs live at `blobs/<algorithm>/<hex>` in the registry bucket. Writes land in a
//! staging object first and are renamed into place only once their digest is known,
//! so a blob path never holds bytes that do not hash to its name.

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use storage::StorageBucket;
use tokio::io::{AsyncRead, BufReader};

use crate::digest::{Algorithm, Digest, HashingReader};
use crate::error::{RegistryError, RegistryResult};

/// How a commit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The bytes were moved into place.
    Stored,
    /// The digest already existed and the new copy was discarded.
    Deduplicated,
}

/// A blob that is now addressable by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Content digest
    pub digest: Digest,
    /// Size in bytes
    pub size: u64,
    /// Whether this call wrote the bytes
    pub outcome: CommitOutcome,
}

/// Blob store over a storage bucket.
#[derive(Debug, Clone)]
pub struct ContentStore {
    bucket: StorageBucket,
}

impl ContentStore {
    /// Wrap a bucket.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    /// The underlying bucket, shared with upload staging and index files.
    pub fn bucket(&self) -> &StorageBucket {
        &self.bucket
    }

    fn staging_path() -> Utf8PathBuf {
        Utf8PathBuf::from(format!("_staging/{}", uuid::Uuid::new_v4()))
    }

    /// Whether a blob exists.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.bucket.exists(&digest.blob_path()).await?)
    }

    /// Size of a stored blob.
    pub async fn size(&self, digest: &Digest) -> RegistryResult<u64> {
        match self.bucket.metadata(&digest.blob_path()).await {
            Ok(metadata) => Ok(metadata.size),
            Err(err) if err.is_not_found() => Err(RegistryError::BlobUnknown(digest.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Stream content in, hashing as it goes.
    ///
    /// Without a declared digest the content is hashed with SHA-256. On a digest or size
    /// mismatch nothing is kept.
    #[tracing::instrument(skip(self, reader))]
    pub async fn put<R>(
        &self,
        reader: R,
        declared_size: Option<u64>,
        declared_digest: Option<&Digest>,
    ) -> RegistryResult<StoredBlob>
    where
        R: AsyncRead + Unpin + Send + Sync,
    {
        let algorithm = declared_digest
            .map(Digest::algorithm)
            .unwrap_or(Algorithm::Sha256);
        let staged = Self::staging_path();

        let mut hashing = BufReader::new(HashingReader::new(reader, algorithm));
        self.bucket.upload(&staged, &mut hashing).await?;
        let (digest, size) = hashing.into_inner().finish();

        if let Some(expected) = declared_digest.filter(|expected| **expected != digest) {
            self.discard(&staged).await;
            return Err(RegistryError::DigestInvalid {
                expected: expected.clone(),
                actual: digest,
            });
        }

        if let Some(expected) = declared_size.filter(|expected| *expected != size) {
            self.discard(&staged).await;
            return Err(RegistryError::SizeInvalid(format!(
                "declared {expected} bytes, received {size}"
            )));
        }

        let outcome = self.commit_staged(&staged, &digest).await?;
        Ok(StoredBlob {
            digest,
            size,
            outcome,
        })
    }

    /// [`ContentStore::put`] for content already in memory.
    pub async fn put_bytes(
        &self,
        data: &[u8],
        declared_digest: Option<&Digest>,
    ) -> RegistryResult<StoredBlob> {
        self.put(data, Some(data.len() as u64), declared_digest).await
    }

    /// Move a staged object (already verified to hash to `digest`) into place.
    ///
    /// When the digest already exists the staged object is removed instead. Two racing
    /// commits of the same digest both succeed and leave one copy.
    #[tracing::instrument(skip(self))]
    pub async fn commit_staged(
        &self,
        staged: &Utf8Path,
        digest: &Digest,
    ) -> RegistryResult<CommitOutcome> {
        let target = digest.blob_path();

        if self.bucket.exists(&target).await? {
            tracing::debug!(%digest, "blob already stored, discarding staged copy");
            self.discard(staged).await;
            return Ok(CommitOutcome::Deduplicated);
        }

        self.bucket.rename(staged, &target).await?;
        tracing::debug!(%digest, "blob committed");
        Ok(CommitOutcome::Stored)
    }

    /// Read a whole blob.
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Bytes> {
        match self.bucket.read(&digest.blob_path()).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.is_not_found() => Err(RegistryError::BlobUnknown(digest.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Read `length` bytes (or the rest) starting at `offset`.
    pub async fn get_range(
        &self,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> RegistryResult<Bytes> {
        let mut data = Vec::new();
        match self
            .bucket
            .download_range(&digest.blob_path(), offset, length, &mut data)
            .await
        {
            Ok(()) => Ok(Bytes::from(data)),
            Err(err) if err.is_not_found() => Err(RegistryError::BlobUnknown(digest.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a blob.
    pub async fn delete(&self, digest: &Digest) -> RegistryResult<()> {
        match self.bucket.delete(&digest.blob_path()).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Err(RegistryError::BlobUnknown(digest.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn discard(&self, staged: &Utf8Path) {
        match self.bucket.delete(staged).await {
            Err(error) if !error.is_not_found() => {
                tracing::warn!(%staged, %error, "failed to remove staged object");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use storage::{MemoryStorage, Storage};

    use super::*;

    fn store() -> ContentStore {
        ContentStore::new(Storage::new(MemoryStorage::new()).bucket("registry"))
    }

    async fn objects(store: &ContentStore) -> Vec<String> {
        store.bucket().list(None).await.unwrap()
    }

    #[tokio::test]
    async fn identical_puts_keep_one_copy() {
        let store = store();
        let first = store.put_bytes(b"layer", None).await.unwrap();
        let second = store.put_bytes(b"layer", None).await.unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(first.outcome, CommitOutcome::Stored);
        assert_eq!(second.outcome, CommitOutcome::Deduplicated);
        assert_eq!(objects(&store).await, vec![first.digest.blob_path().to_string()]);
        assert_eq!(&store.get(&first.digest).await.unwrap()[..], b"layer");
    }

    #[tokio::test]
    async fn concurrent_commits_both_succeed() {
        let store = store();
        let (a, b) = tokio::join!(store.put_bytes(b"same", None), store.put_bytes(b"same", None));
        assert_eq!(a.unwrap().digest, b.unwrap().digest);
        assert_eq!(objects(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn mismatched_digest_keeps_nothing() {
        let store = store();
        let wrong = Digest::sha256(b"something else");
        let err = store.put_bytes(b"content", Some(&wrong)).await.unwrap_err();

        assert!(matches!(err, RegistryError::DigestInvalid { .. }));
        assert!(objects(&store).await.is_empty());
        assert!(!store.exists(&Digest::sha256(b"content")).await.unwrap());
    }

    #[tokio::test]
    async fn mismatched_size_keeps_nothing() {
        let store = store();
        let err = store.put(&b"12345"[..], Some(4), None).await.unwrap_err();
        assert!(matches!(err, RegistryError::SizeInvalid(_)));
        assert!(objects(&store).await.is_empty());
    }

    #[tokio::test]
    async fn sha512_declared_digest() {
        let store = store();
        let digest = Digest::compute(Algorithm::Sha512, b"data");
        let stored = store.put_bytes(b"data", Some(&digest)).await.unwrap();
        assert_eq!(stored.digest, digest);
        assert!(stored.digest.blob_path().as_str().starts_with("blobs/sha512/"));
    }

    #[tokio::test]
    async fn ranges_and_missing_blobs() {
        let store = store();
        let stored = store.put_bytes(b"0123456789", None).await.unwrap();

        assert_eq!(&store.get_range(&stored.digest, 2, Some(3)).await.unwrap()[..], b"234");
        assert_eq!(&store.get_range(&stored.digest, 7, None).await.unwrap()[..], b"789");
        assert_eq!(store.size(&stored.digest).await.unwrap(), 10);

        let missing = Digest::sha256(b"missing");
        assert!(matches!(
            store.get(&missing).await,
            Err(RegistryError::BlobUnknown(_))
        ));

        store.delete(&stored.digest).await.unwrap();
        assert!(!store.exists(&stored.digest).await.unwrap());
    }
}
