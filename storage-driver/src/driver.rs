use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io::{self, AsyncWriteExt};

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata common to all drivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,
}

/// A storage driver: the physical byte store underneath the registry.
///
/// Drivers only move opaque bytes around; naming, hashing and
/// deduplication happen above this trait.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Delete an object by path.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Write an object from a reader stream, replacing any existing object.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Read an object into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// List the objects in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// Move an object to a new path, replacing whatever is there.
    ///
    /// Drivers that can rename atomically must override this; the default copies and
    /// then deletes, so readers may briefly see both objects.
    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%from, %to, "rename by copy");
        let mut data = Vec::new();
        self.download(bucket, from, &mut data).await?;
        self.upload(bucket, to, &mut data.as_slice()).await?;
        self.delete(bucket, from).await
    }

    /// Append the reader's contents to an object, creating it if missing.
    /// Returns the size of the object afterwards.
    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let mut data = Vec::new();
        match self.download(bucket, remote, &mut data).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        tokio::io::copy_buf(reader, &mut data)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;
        let size = data.len() as u64;
        self.upload(bucket, remote, &mut data.as_slice()).await?;
        Ok(size)
    }

    /// Read `length` bytes (or everything) starting at `offset` into a writer.
    async fn download_range(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        length: Option<u64>,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let mut data = Vec::new();
        self.download(bucket, remote, &mut data).await?;
        let slice = slice_range(self.name(), &data, offset, length)?;
        writer
            .write_all(slice)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;
        writer
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err))
    }
}

/// Select the `offset..offset+length` window of an in-memory object.
pub fn slice_range<'d>(
    engine: &'static str,
    data: &'d [u8],
    offset: u64,
    length: Option<u64>,
) -> Result<&'d [u8], StorageError> {
    let size = data.len() as u64;
    let end = match length {
        Some(length) => offset.checked_add(length),
        None => Some(size),
    };

    match end {
        Some(end) if offset <= size && end <= size => Ok(&data[offset as usize..end as usize]),
        _ => Err(StorageError::new(
            engine,
            StorageErrorKind::RangeNotSatisfiable,
            format!("range {offset}+{length:?} outside object of {size} bytes"),
        )),
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.deref().rename(bucket, from, to).await
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.deref().append(bucket, remote, reader).await
    }

    async fn download_range(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        length: Option<u64>,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref()
            .download_range(bucket, remote, offset, length, writer)
            .await
    }
}
