use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{slice_range, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that keeps objects in memory.
///
/// All mutations take the bucket write lock, so `rename` is atomic with respect to
/// every other operation on the driver.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let map = buckets
            .iter()
            .map(|bucket| (bucket.to_string(), HashMap::new()))
            .collect();

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }

    /// Number of objects currently held in a bucket.
    pub async fn object_count(&self, bucket: &str) -> usize {
        let buckets = self.buckets.read().await;
        buckets.get(bucket).map(HashMap::len).unwrap_or_default()
    }

    fn missing_bucket(&self, bucket: &str) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            format!("bucket not found: {bucket}"),
        )
        .bucket(bucket)
        .build()
    }
}

async fn drain(engine: &'static str, reader: &mut Reader<'_>) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::new();
    tokio::io::copy_buf(reader, &mut buf)
        .await
        .map_err(|err| StorageError::io(engine, err))?;
    Ok(buf)
}

async fn write_out(
    engine: &'static str,
    mut data: &[u8],
    writer: &mut Writer<'_>,
) -> Result<(), StorageError> {
    tokio::io::copy(&mut data, writer)
        .await
        .map_err(|err| StorageError::io(engine, err))?;
    writer
        .flush()
        .await
        .map_err(|err| StorageError::io(engine, err))
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        objects
            .get(remote)
            .map(Metadata::from)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        objects
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let buf = drain(self.name(), local).await?;

        let mut buckets = self.buckets.write().await;
        let objects = buckets.entry(bucket.to_string()).or_default();
        objects.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let data = {
            let buckets = self.buckets.read().await;
            let objects = buckets
                .get(bucket)
                .ok_or_else(|| self.missing_bucket(bucket))?;
            objects
                .get(remote)
                .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?
                .data
                .clone()
        };

        write_out(self.name(), &data, local).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let mut paths: Vec<String> = objects
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        let item = objects
            .remove(from)
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, from.as_str()))?;
        objects.insert(to.to_owned(), item);
        Ok(())
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let buf = drain(self.name(), reader).await?;

        let mut buckets = self.buckets.write().await;
        let objects = buckets.entry(bucket.to_string()).or_default();
        let item = objects
            .entry(remote.to_owned())
            .or_insert_with(|| Vec::new().into());
        item.data.extend_from_slice(&buf);
        Ok(item.data.len() as u64)
    }

    async fn download_range(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        length: Option<u64>,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let data = {
            let buckets = self.buckets.read().await;
            let objects = buckets
                .get(bucket)
                .ok_or_else(|| self.missing_bucket(bucket))?;
            let item = objects
                .get(remote)
                .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))?;
            slice_range(self.name(), &item.data, offset, length)?.to_vec()
        };

        write_out(self.name(), &data, writer).await
    }
}
