use std::io::SeekFrom;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Stores objects as files below a root directory, one directory per bucket.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Store below `root`, which must exist.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path.push(remote);
        path
    }

    fn error(&self, bucket: &str, remote: &Utf8Path, context: &str, err: std::io::Error) -> StorageError {
        StorageError::builder(self.name(), err.kind().into(), err)
            .bucket(bucket)
            .path(remote.as_str())
            .context(context)
            .build()
    }

    async fn create_parent(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let path = self.path(bucket, remote);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.error(bucket, remote, "create_dir_all", err))?;
        }
        Ok(path)
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|err| self.error(bucket, remote, "metadata", err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: metadata
                .created()
                .or_else(|_| metadata.modified())
                .map_err(|err| self.error(bucket, remote, "created", err))?
                .into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| self.error(bucket, remote, "remove_file", err))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.create_parent(bucket, remote).await?;

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .map_err(|err| self.error(bucket, remote, "create", err))?,
        );

        tokio::io::copy_buf(local, &mut writer)
            .await
            .map_err(|err| self.error(bucket, remote, "copy", err))?;

        writer
            .shutdown()
            .await
            .map_err(|err| self.error(bucket, remote, "shutdown writer", err))
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.error(bucket, remote, "open", err))?,
        );

        tokio::io::copy_buf(&mut reader, local)
            .await
            .map_err(|err| self.error(bucket, remote, "copy", err))?;

        local
            .flush()
            .await
            .map_err(|err| self.error(bucket, remote, "flush writer", err))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let mut base = self.root.join(bucket);
        base.push("b");

        let walk = base.clone();
        let items = tokio::task::spawn_blocking(move || collect_list(&walk))
            .in_current_span()
            .await
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(|err| StorageError::io(self.name(), err))?;

        tracing::debug!("Found {} entries", items.len());

        let mut items: Vec<String> = items
            .into_iter()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        items.sort();
        Ok(items)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let source = self.path(bucket, from);
        let target = self.create_parent(bucket, to).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|err| self.error(bucket, from, "rename", err))
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let path = self.create_parent(bucket, remote).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| self.error(bucket, remote, "open for append", err))?;

        tokio::io::copy_buf(reader, &mut file)
            .await
            .map_err(|err| self.error(bucket, remote, "append", err))?;
        file.flush()
            .await
            .map_err(|err| self.error(bucket, remote, "flush", err))?;

        let metadata = file
            .metadata()
            .await
            .map_err(|err| self.error(bucket, remote, "metadata", err))?;
        Ok(metadata.len())
    }

    async fn download_range(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        length: Option<u64>,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| self.error(bucket, remote, "open", err))?;
        let size = file
            .metadata()
            .await
            .map_err(|err| self.error(bucket, remote, "metadata", err))?
            .len();

        let end = match length {
            Some(length) => offset.checked_add(length),
            None => Some(size),
        };
        let length = match end {
            Some(end) if offset <= size && end <= size => end - offset,
            _ => {
                return Err(StorageError::builder(
                    self.name(),
                    StorageErrorKind::RangeNotSatisfiable,
                    format!("range {offset}+{length:?} outside object of {size} bytes"),
                )
                .bucket(bucket)
                .path(remote.as_str())
                .build())
            }
        };

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| self.error(bucket, remote, "seek", err))?;
        let mut window = tokio::io::BufReader::new(file.take(length));
        tokio::io::copy_buf(&mut window, writer)
            .await
            .map_err(|err| self.error(bucket, remote, "copy", err))?;
        writer
            .flush()
            .await
            .map_err(|err| self.error(bucket, remote, "flush writer", err))
    }
}

#[tracing::instrument]
fn collect_list(root: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if root.exists() {
        visit(root, &mut files)?;
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn upload_rename_and_list() {
        let (_dir, driver) = driver();
        driver
            .upload("reg", Utf8Path::new("_staging/x"), &mut &b"hello"[..])
            .await
            .unwrap();
        driver
            .rename("reg", Utf8Path::new("_staging/x"), Utf8Path::new("blobs/sha256/ab"))
            .await
            .unwrap();

        let listed = driver.list("reg", Some(Utf8Path::new("blobs"))).await.unwrap();
        assert_eq!(listed, vec!["blobs/sha256/ab".to_string()]);

        let mut out = Vec::new();
        driver
            .download("reg", Utf8Path::new("blobs/sha256/ab"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn append_and_read_window() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("_uploads/s/data");
        assert_eq!(driver.append("reg", path, &mut &b"0123"[..]).await.unwrap(), 4);
        assert_eq!(driver.append("reg", path, &mut &b"4567"[..]).await.unwrap(), 8);

        let mut out = Vec::new();
        driver
            .download_range("reg", path, 3, Some(2), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"34");

        let err = driver
            .download_range("reg", path, 6, Some(10), &mut Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::RangeNotSatisfiable);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (_dir, driver) = driver();
        let err = driver
            .metadata("reg", Utf8Path::new("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
