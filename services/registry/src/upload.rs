//! Resumable chunked blob uploads.
//!
//! A session moves through `Initiated -> Receiving -> Completing -> {Committed | Aborted}`.
//! Bytes are appended to a per-session staging object while a running SHA-256 is kept,
//! so completing a session never re-reads the upload for the common algorithm.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use bytes::Bytes;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::content::{CommitOutcome, ContentStore};
use crate::digest::{Algorithm, Digest, Hasher};
use crate::error::{RegistryError, RegistryResult};
use crate::model::RegistryId;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UploadId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| RegistryError::BlobUploadUnknown(s.to_owned()))
    }
}

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    /// Created, no bytes yet.
    Initiated,
    /// At least one chunk accepted.
    Receiving,
    /// Final digest being checked.
    Completing,
    /// Blob stored; the session is gone.
    Committed,
    /// Digest mismatch or cancel; the session is gone.
    Aborted,
}

impl UploadState {
    /// Whether the session still accepts chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initiated | Self::Receiving)
    }
}

/// What a client can learn about a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSession {
    /// Session id, used in the upload URL.
    pub id: UploadId,
    /// Target registry
    pub registry: RegistryId,
    /// Target repository
    pub image: String,
    /// Bytes received so far
    pub offset: u64,
    /// When the session was opened
    pub started: DateTime<Utc>,
}

impl UploadSession {
    /// The `Range` header value: inclusive end, `0-0` before any bytes arrive.
    pub fn range(&self) -> String {
        format!("0-{}", self.offset.saturating_sub(1))
    }
}

/// A `Content-Range` for one chunk; both ends inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    /// First byte offset
    pub start: u64,
    /// Last byte offset
    pub end: u64,
}

impl ChunkRange {
    /// Number of bytes covered, `None` for a range no chunk can match.
    pub fn length(&self) -> Option<u64> {
        self.end.checked_sub(self.start)?.checked_add(1)
    }
}

impl FromStr for ChunkRange {
    type Err = RegistryError;

    /// Accepts `a-b` as sent by OCI clients and `bytes a-b/total`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::RangeInvalid(format!("malformed range: {s}"));

        let range = s.trim();
        let range = range.strip_prefix("bytes").map(str::trim_start).unwrap_or(range);
        let range = range.split_once('/').map(|(r, _)| r).unwrap_or(range);
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;

        let range = Self { start, end };
        if range.length().is_none() {
            return Err(invalid());
        }
        Ok(range)
    }
}

/// A blob that finished uploading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedBlob {
    /// Target registry
    pub registry: RegistryId,
    /// Target repository
    pub image: String,
    /// Verified digest
    pub digest: Digest,
    /// Size in bytes
    pub size: u64,
    /// Whether the bytes were new
    pub outcome: CommitOutcome,
}

fn busy(id: UploadId) -> RegistryError {
    RegistryError::RangeInvalid(format!("upload {id} is busy"))
}

#[derive(Debug)]
struct Slot {
    session: UploadSession,
    state: UploadState,
    hasher: Hasher,
    touched: Instant,
}

/// The opaque `_state` query parameter handed out in `Location` headers.
#[derive(Debug, Serialize, Deserialize)]
struct StateToken {
    id: UploadId,
    registry: RegistryId,
    image: String,
    offset: u64,
}

/// Owns every open upload session.
#[derive(Debug)]
pub struct UploadSessionManager {
    content: ContentStore,
    sessions: DashMap<UploadId, Arc<Mutex<Slot>>>,
    ttl: Duration,
}

impl UploadSessionManager {
    /// Create a manager whose sessions expire after `ttl` without activity.
    pub fn new(content: ContentStore, ttl: Duration) -> Self {
        Self {
            content,
            sessions: DashMap::new(),
            ttl,
        }
    }

    fn data_path(id: UploadId) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("_uploads/{id}/data"))
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no open sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Open a session for a repository.
    #[tracing::instrument(skip(self))]
    pub async fn initiate(&self, registry: RegistryId, image: &str) -> RegistryResult<UploadSession> {
        let id = UploadId::new();
        self.content
            .bucket()
            .write(&Self::data_path(id), &[])
            .await?;

        let session = UploadSession {
            id,
            registry,
            image: image.to_owned(),
            offset: 0,
            started: Utc::now(),
        };
        let slot = Slot {
            session: session.clone(),
            state: UploadState::Initiated,
            hasher: Algorithm::Sha256.hasher(),
            touched: Instant::now(),
        };
        self.sessions.insert(id, Arc::new(Mutex::new(slot)));

        tracing::debug!(%id, "upload session opened");
        Ok(session)
    }

    fn slot(&self, id: UploadId) -> RegistryResult<Arc<Mutex<Slot>>> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::BlobUploadUnknown(id.to_string()))
    }

    fn expired(&self, slot: &Slot) -> bool {
        slot.touched.elapsed() >= self.ttl
    }

    /// Drop a session and its staged bytes.
    async fn discard(&self, id: UploadId) {
        self.sessions.remove(&id);
        match self.content.bucket().delete(&Self::data_path(id)).await {
            Err(error) if !error.is_not_found() => {
                tracing::warn!(%id, %error, "failed to remove staged upload");
            }
            _ => {}
        }
    }

    /// Reject sessions that expired or already finished.
    async fn ensure_active(&self, slot: &Slot) -> RegistryResult<()> {
        let id = slot.session.id;
        if self.expired(slot) {
            tracing::debug!(%id, "upload session expired");
            self.discard(id).await;
            return Err(RegistryError::BlobUploadUnknown(id.to_string()));
        }
        if !slot.state.is_active() {
            return Err(RegistryError::BlobUploadUnknown(id.to_string()));
        }
        Ok(())
    }

    async fn write_chunk(&self, slot: &mut Slot, data: &[u8]) -> RegistryResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut reader = data;
        self.content
            .bucket()
            .append(&Self::data_path(slot.session.id), &mut reader)
            .await?;

        slot.hasher.update(data);
        slot.session.offset += data.len() as u64;
        slot.state = UploadState::Receiving;
        slot.touched = Instant::now();
        Ok(())
    }

    /// Append a chunk, returning the new offset.
    ///
    /// A declared range must start at the current offset and cover exactly the chunk.
    /// Rejected chunks, including ones racing another append on the same session, leave
    /// the session as it was.
    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    pub async fn append_chunk(
        &self,
        id: UploadId,
        range: Option<ChunkRange>,
        data: Bytes,
    ) -> RegistryResult<u64> {
        let slot = self.slot(id)?;
        let mut slot = slot.try_lock().map_err(|_| busy(id))?;
        self.ensure_active(&slot).await?;

        if let Some(range) = range {
            let offset = slot.session.offset;
            if range.start != offset || range.length() != Some(data.len() as u64) {
                return Err(RegistryError::RangeInvalid(format!(
                    "chunk {}-{} does not continue upload at offset {offset}",
                    range.start, range.end
                )));
            }
        }

        self.write_chunk(&mut slot, &data).await?;
        Ok(slot.session.offset)
    }

    /// Append any trailing bytes, verify the digest and commit the blob.
    #[tracing::instrument(skip(self, trailing), fields(len = trailing.len()))]
    pub async fn complete(
        &self,
        id: UploadId,
        trailing: Bytes,
        declared: &Digest,
    ) -> RegistryResult<CommittedBlob> {
        let slot = self.slot(id)?;
        let mut slot = slot.try_lock().map_err(|_| busy(id))?;
        self.ensure_active(&slot).await?;

        self.write_chunk(&mut slot, &trailing).await?;
        slot.state = UploadState::Completing;

        let path = Self::data_path(id);
        let actual = match declared.algorithm() {
            Algorithm::Sha256 => slot.hasher.clone().finalize(),
            algorithm => {
                let data = self.content.bucket().read(&path).await?;
                Digest::compute(algorithm, &data)
            }
        };

        if &actual != declared {
            slot.state = UploadState::Aborted;
            self.discard(id).await;
            tracing::debug!(%id, %declared, %actual, "upload digest mismatch");
            return Err(RegistryError::DigestInvalid {
                expected: declared.clone(),
                actual,
            });
        }

        let outcome = match self.content.commit_staged(&path, declared).await {
            Ok(outcome) => outcome,
            Err(error) => {
                slot.state = UploadState::Receiving;
                return Err(error);
            }
        };
        slot.state = UploadState::Committed;
        self.sessions.remove(&id);

        tracing::debug!(%id, digest = %declared, ?outcome, "upload committed");
        Ok(CommittedBlob {
            registry: slot.session.registry,
            image: slot.session.image.clone(),
            digest: declared.clone(),
            size: slot.session.offset,
            outcome,
        })
    }

    /// Current state of a session.
    pub async fn status(&self, id: UploadId) -> RegistryResult<UploadSession> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        self.ensure_active(&slot).await?;
        Ok(slot.session.clone())
    }

    /// Like [`UploadSessionManager::status`], but a session another request is writing to
    /// is reported as busy instead of waited for.
    pub async fn try_status(&self, id: UploadId) -> RegistryResult<UploadSession> {
        let slot = self.slot(id)?;
        let slot = slot.try_lock().map_err(|_| busy(id))?;
        self.ensure_active(&slot).await?;
        Ok(slot.session.clone())
    }

    /// Abandon a session.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: UploadId) -> RegistryResult<()> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        slot.state = UploadState::Aborted;
        self.discard(id).await;
        Ok(())
    }

    /// Discard sessions idle for longer than the TTL. Busy sessions are left alone.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<UploadId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|slot| self.expired(&slot))
                    .unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &expired {
            self.discard(*id).await;
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired upload sessions removed");
        }
        expired.len()
    }

    /// Encode the `_state` parameter for a session.
    pub fn state_token(session: &UploadSession) -> String {
        let token = StateToken {
            id: session.id,
            registry: session.registry,
            image: session.image.clone(),
            offset: session.offset,
        };
        let json = serde_json::to_vec(&token).unwrap_or_default();
        BASE64_URL_SAFE_NO_PAD.encode(json)
    }

    /// Check a `_state` parameter presented by a client against the live session.
    pub fn check_state_token(token: &str, session: &UploadSession) -> RegistryResult<()> {
        let invalid = || RegistryError::BlobUploadInvalid(format!("state does not match upload {}", session.id));

        let json = BASE64_URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let state: StateToken = serde_json::from_slice(&json).map_err(|_| invalid())?;

        if state.id != session.id || state.registry != session.registry || state.image != session.image {
            return Err(invalid());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use storage::{MemoryStorage, Storage};

    use super::*;

    fn manager(ttl: Duration) -> UploadSessionManager {
        let bucket = Storage::new(MemoryStorage::new()).bucket("registry");
        UploadSessionManager::new(ContentStore::new(bucket), ttl)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn parse_content_range() {
        assert_eq!(
            "0-99".parse::<ChunkRange>().unwrap(),
            ChunkRange { start: 0, end: 99 }
        );
        assert_eq!(
            "bytes 100-199/300".parse::<ChunkRange>().unwrap(),
            ChunkRange {
                start: 100,
                end: 199
            }
        );
        assert!("10-5".parse::<ChunkRange>().is_err());
        assert!("abc".parse::<ChunkRange>().is_err());
    }

    #[test]
    fn range_ending_at_the_last_offset_is_rejected() {
        let err = "0-18446744073709551615".parse::<ChunkRange>().unwrap_err();
        assert!(matches!(err, RegistryError::RangeInvalid(_)));
        assert_eq!(
            "bytes 0-18446744073709551614/*".parse::<ChunkRange>().unwrap().length(),
            Some(u64::MAX)
        );
        assert_eq!(ChunkRange { start: 5, end: 4 }.length(), None);
    }

    #[tokio::test]
    async fn chunked_upload_commits() {
        let uploads = manager(HOUR);
        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();

        let offset = uploads
            .append_chunk(session.id, Some("0-4".parse().unwrap()), Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(offset, 5);
        assert_eq!(uploads.status(session.id).await.unwrap().range(), "0-4");

        let digest = Digest::sha256(b"hello world");
        let blob = uploads
            .complete(session.id, Bytes::from_static(b" world"), &digest)
            .await
            .unwrap();
        assert_eq!(blob.size, 11);
        assert_eq!(blob.outcome, CommitOutcome::Stored);
        assert_eq!(&uploads.content.get(&digest).await.unwrap()[..], b"hello world");

        assert!(matches!(
            uploads.status(session.id).await,
            Err(RegistryError::BlobUploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn overlapping_chunk_is_rejected() {
        let uploads = manager(HOUR);
        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();
        uploads
            .append_chunk(session.id, Some("0-99".parse().unwrap()), Bytes::from(vec![1u8; 100]))
            .await
            .unwrap();

        let err = uploads
            .append_chunk(session.id, Some("50-149".parse().unwrap()), Bytes::from(vec![2u8; 100]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RangeInvalid(_)));
        assert_eq!(uploads.status(session.id).await.unwrap().offset, 100);

        let err = uploads
            .append_chunk(session.id, Some("100-109".parse().unwrap()), Bytes::from(vec![2u8; 5]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RangeInvalid(_)));
        assert_eq!(uploads.status(session.id).await.unwrap().offset, 100);
    }

    #[tokio::test]
    async fn busy_session_rejects_append() {
        let uploads = manager(HOUR);
        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();

        let slot = uploads.slot(session.id).unwrap();
        let _held = slot.lock().await;
        let err = uploads
            .append_chunk(session.id, None, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RangeInvalid(_)));
    }

    #[tokio::test]
    async fn digest_mismatch_aborts() {
        let uploads = manager(HOUR);
        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();
        uploads
            .append_chunk(session.id, None, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let wrong = Digest::sha256(b"abd");
        let err = uploads
            .complete(session.id, Bytes::new(), &wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestInvalid { .. }));
        assert!(!uploads.content.exists(&wrong).await.unwrap());
        assert!(!uploads.content.exists(&Digest::sha256(b"abc")).await.unwrap());
        assert!(uploads.content.bucket().list(None).await.unwrap().is_empty());
        assert!(uploads.is_empty());
    }

    #[tokio::test]
    async fn empty_upload_and_sha512() {
        let uploads = manager(HOUR);

        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();
        let empty = Digest::sha256(b"");
        let blob = uploads.complete(session.id, Bytes::new(), &empty).await.unwrap();
        assert_eq!(blob.size, 0);

        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();
        let digest = Digest::compute(Algorithm::Sha512, b"payload");
        uploads
            .complete(session.id, Bytes::from_static(b"payload"), &digest)
            .await
            .unwrap();
        assert!(uploads.content.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn expired_sessions_are_unknown() {
        let uploads = manager(Duration::ZERO);
        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();
        let err = uploads
            .append_chunk(session.id, None, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BlobUploadUnknown(_)));

        uploads.initiate(RegistryId(1), "app").await.unwrap();
        assert_eq!(uploads.sweep_expired().await, 1);
        assert!(uploads.is_empty());
        assert!(uploads.content.bucket().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_invalidates() {
        let uploads = manager(HOUR);
        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();
        uploads.cancel(session.id).await.unwrap();
        assert!(matches!(
            uploads.cancel(session.id).await,
            Err(RegistryError::BlobUploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn state_token_binds_session() {
        let uploads = manager(HOUR);
        let session = uploads.initiate(RegistryId(1), "app").await.unwrap();
        let other = uploads.initiate(RegistryId(1), "app").await.unwrap();

        let token = UploadSessionManager::state_token(&session);
        UploadSessionManager::check_state_token(&token, &session).unwrap();
        assert!(UploadSessionManager::check_state_token(&token, &other).is_err());
        assert!(UploadSessionManager::check_state_token("not-base64!", &session).is_err());
    }
}
