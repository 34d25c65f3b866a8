//! Resumable upload sessions.
//!
//! Each session owns a streaming chunker and a running fingerprint of the
//! whole artifact. Chunks are stored as soon as the chunker cuts them, so a
//! session never buffers more than one chunk of unstored content. Sessions
//! are independent: each has its own lock, and writes to different sessions
//! proceed concurrently.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::block::BlockStore;
use crate::chunker::{Chunk, ChunkPolicy, Chunker};
use crate::digest::{Digest, Fingerprinter};
use crate::error::{Corruption, EngineError, EngineResult};
use crate::recipe::{Recipe, RecipeEntry, RecipeStore};

/// Default time an upload session may sit idle before it is expired.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const MAX_REPOSITORY_LEN: usize = 255;

/// Identifier of an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Accepting writes.
    Receiving,
    /// The artifact was verified and its recipe saved.
    Committed,
    /// The upload failed; nothing was committed.
    Failed,
    /// The upload was cancelled or expired; nothing was committed.
    Cancelled,
}

/// Progress of an open upload, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    /// Session identifier
    pub id: SessionId,
    /// Repository the upload targets
    pub repository: String,
    /// Bytes received so far; the next write must start here
    pub offset: u64,
    /// When the session was started
    pub started: DateTime<Utc>,
    /// When the session last received a request
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug)]
struct UploadSession {
    offset: u64,
    chunker: Chunker,
    hasher: Fingerprinter,
    entries: Vec<RecipeEntry>,
    state: SessionState,
}

#[derive(Debug)]
struct SessionHandle {
    id: SessionId,
    repository: String,
    started: DateTime<Utc>,
    last_activity: AtomicI64,
    cancel: CancellationToken,
    session: Mutex<UploadSession>,
}

impl SessionHandle {
    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.started)
    }
}

/// Owns the table of open upload sessions.
#[derive(Debug)]
pub(crate) struct UploadManager {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    blocks: BlockStore,
    recipes: Arc<RecipeStore>,
    policy: ChunkPolicy,
    timeout: Duration,
}

impl UploadManager {
    pub(crate) fn new(
        blocks: BlockStore,
        recipes: Arc<RecipeStore>,
        policy: ChunkPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            blocks,
            recipes,
            policy,
            timeout,
        }
    }

    fn handle(&self, id: SessionId) -> EngineResult<Arc<SessionHandle>> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::SessionNotFound(id))
    }

    /// Number of open sessions.
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn start(&self, repository: &str) -> EngineResult<SessionId> {
        validate_repository(repository)?;

        let id = SessionId::new();
        let now = Utc::now();
        let handle = SessionHandle {
            id,
            repository: repository.to_owned(),
            started: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            cancel: CancellationToken::new(),
            session: Mutex::new(UploadSession {
                offset: 0,
                chunker: Chunker::new(self.policy),
                hasher: Fingerprinter::new(),
                entries: Vec::new(),
                state: SessionState::Receiving,
            }),
        };
        self.sessions.insert(id, Arc::new(handle));
        tracing::debug!(%id, %repository, "started upload session");
        Ok(id)
    }

    pub(crate) async fn write(&self, id: SessionId, offset: u64, data: Bytes) -> EngineResult<u64> {
        let handle = self.handle(id)?;
        handle.touch();
        let mut session = handle.session.lock().await;
        check_open(&handle, &session)?;

        if offset != session.offset {
            return Err(EngineError::OffsetConflict {
                expected: session.offset,
                actual: offset,
            });
        }

        let mut input = &data[..];
        while let Some(chunk) = session.chunker.next_chunk(&mut input) {
            if handle.cancel.is_cancelled() {
                return Err(EngineError::Cancelled(id));
            }
            if let Err(error) = self.store(&mut session, chunk).await {
                return Err(self.fail(&handle, &mut session, error));
            }
        }

        session.hasher.update(&data);
        session.offset += data.len() as u64;
        handle.touch();
        Ok(session.offset)
    }

    pub(crate) async fn finalize(&self, id: SessionId, declared: Digest) -> EngineResult<Digest> {
        let handle = self.handle(id)?;
        handle.touch();
        let mut session = handle.session.lock().await;
        check_open(&handle, &session)?;

        match self.commit(&handle, &mut session, declared).await {
            Ok(()) => {
                session.state = SessionState::Committed;
                self.sessions.remove(&id);
                tracing::debug!(%id, digest = %declared, size = session.offset, "committed upload");
                Ok(declared)
            }
            Err(EngineError::Cancelled(id)) => Err(EngineError::Cancelled(id)),
            Err(error) => Err(self.fail(&handle, &mut session, error)),
        }
    }

    async fn commit(
        &self,
        handle: &SessionHandle,
        session: &mut UploadSession,
        declared: Digest,
    ) -> EngineResult<()> {
        if let Some(chunk) = session.chunker.finish() {
            if handle.cancel.is_cancelled() {
                return Err(EngineError::Cancelled(handle.id));
            }
            self.store(session, chunk).await?;
        }

        let computed = std::mem::take(&mut session.hasher).finalize();
        if computed != declared {
            return Err(EngineError::DigestMismatch { declared, computed });
        }

        let recipe = Recipe::new(declared, std::mem::take(&mut session.entries));

        if self.recipes.exists(&declared).await? {
            let existing = self.recipes.load(&declared).await?;
            if existing.entries_digest() != recipe.entries_digest() {
                tracing::debug!(
                    digest = %declared,
                    "artifact already stored with a different block layout"
                );
            }
            tracing::debug!(digest = %declared, "duplicate push of an existing artifact");
            return Ok(());
        }

        if let Some(missing) = recipe
            .chunks
            .iter()
            .find(|entry| !self.blocks.exists(&entry.digest))
        {
            return Err(Corruption::MissingBlock {
                artifact: declared,
                block: missing.digest,
            }
            .into());
        }

        self.recipes.save(&recipe).await
    }

    async fn store(&self, session: &mut UploadSession, chunk: Chunk) -> EngineResult<()> {
        let digest = chunk.fingerprint();
        let length = chunk.len() as u64;
        self.blocks.put(digest, chunk.data).await?;
        session.entries.push(RecipeEntry { digest, length });
        Ok(())
    }

    fn fail(
        &self,
        handle: &SessionHandle,
        session: &mut UploadSession,
        error: EngineError,
    ) -> EngineError {
        tracing::warn!(id = %handle.id, %error, "upload failed");
        session.state = SessionState::Failed;
        self.sessions.remove(&handle.id);
        error
    }

    pub(crate) async fn cancel(&self, id: SessionId) -> EngineResult<()> {
        let (_, handle) = self
            .sessions
            .remove(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        handle.cancel.cancel();

        // Waits for an in-flight write to observe the token.
        let mut session = handle.session.lock().await;
        session.state = SessionState::Cancelled;
        tracing::debug!(%id, offset = session.offset, "cancelled upload");
        Ok(())
    }

    pub(crate) async fn status(&self, id: SessionId) -> EngineResult<UploadStatus> {
        let handle = self.handle(id)?;
        let session = handle.session.lock().await;
        check_open(&handle, &session)?;
        Ok(UploadStatus {
            id,
            repository: handle.repository.clone(),
            offset: session.offset,
            started: handle.started,
            last_activity: handle.last_activity(),
        })
    }

    /// Cancel every session idle since before `now - timeout`.
    pub(crate) async fn expire_idle(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let Ok(timeout) = chrono::Duration::from_std(self.timeout) else {
            return Vec::new();
        };
        let Some(cutoff) = now.checked_sub_signed(timeout) else {
            return Vec::new();
        };

        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().last_activity() < cutoff)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = Vec::with_capacity(idle.len());
        for id in idle {
            let Some((_, handle)) = self.sessions.remove(&id) else {
                continue;
            };
            handle.cancel.cancel();
            handle.session.lock().await.state = SessionState::Cancelled;
            tracing::warn!(%id, repository = %handle.repository, "expired idle upload session");
            expired.push(id);
        }
        expired
    }
}

fn check_open(handle: &SessionHandle, session: &UploadSession) -> EngineResult<()> {
    if handle.cancel.is_cancelled() {
        return Err(EngineError::Cancelled(handle.id));
    }
    match session.state {
        SessionState::Receiving => Ok(()),
        _ => Err(EngineError::SessionNotFound(handle.id)),
    }
}

/// Check a repository name against the registry naming rules: path
/// components of lowercase alphanumerics joined by `.`, `_`, `__` or runs
/// of `-`, separated by `/`.
pub fn validate_repository(name: &str) -> EngineResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_REPOSITORY_LEN
        && name.split('/').all(valid_component);
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidRepository(name.to_owned()))
    }
}

fn valid_component(component: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let mut rest = component;
    loop {
        let run = rest.find(|c: char| !alnum(c)).unwrap_or(rest.len());
        if run == 0 {
            return false;
        }
        rest = &rest[run..];
        if rest.is_empty() {
            return true;
        }

        let sep = rest.find(alnum).unwrap_or(rest.len());
        let separator = &rest[..sep];
        let allowed = matches!(separator, "." | "_" | "__") || separator.chars().all(|c| c == '-');
        if !allowed {
            return false;
        }
        rest = &rest[sep..];
    }
}

#[cfg(test)]
mod tests {
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::digest::fingerprint;
    use crate::retry::Backoff;

    async fn manager(policy: ChunkPolicy) -> UploadManager {
        let storage: Storage = MemoryStorage::new().into();
        let namespace = storage.namespace("layers");
        let blocks = BlockStore::open(namespace.clone(), Backoff::none())
            .await
            .unwrap();
        let recipes = Arc::new(RecipeStore::new(namespace));
        UploadManager::new(blocks, recipes, policy, DEFAULT_SESSION_TIMEOUT)
    }

    #[test]
    fn repository_names() {
        for name in ["library/ubuntu", "a", "my-org/my_app", "a__b/c.d", "x--y/0"] {
            assert!(validate_repository(name).is_ok(), "{name} should be valid");
        }
        for name in ["", "Library/ubuntu", "a//b", "-a", "a-", "a..b", "a___b", "/a", "a/"] {
            assert!(validate_repository(name).is_err(), "{name:?} should be invalid");
        }
        assert!(validate_repository(&"a".repeat(256)).is_err());
    }

    #[test]
    fn session_id_parses_its_display() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[tokio::test]
    async fn offset_conflict_leaves_session_usable() {
        let uploads = manager(ChunkPolicy::Fixed { size: 4 }).await;
        let id = uploads.start("library/test").unwrap();

        assert_eq!(uploads.write(id, 0, Bytes::from_static(b"abcdef")).await.unwrap(), 6);
        let err = uploads
            .write(id, 2, Bytes::from_static(b"xx"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::OffsetConflict {
                expected: 6,
                actual: 2
            }
        ));

        assert_eq!(uploads.write(id, 6, Bytes::from_static(b"gh")).await.unwrap(), 8);
        let digest = uploads.finalize(id, fingerprint(b"abcdefgh")).await.unwrap();
        assert_eq!(digest, fingerprint(b"abcdefgh"));
        assert_eq!(uploads.len(), 0);
    }

    #[tokio::test]
    async fn status_reports_progress() {
        let uploads = manager(ChunkPolicy::fixed()).await;
        let id = uploads.start("library/test").unwrap();
        uploads.write(id, 0, Bytes::from_static(b"12345")).await.unwrap();

        let status = uploads.status(id).await.unwrap();
        assert_eq!(status.id, id);
        assert_eq!(status.repository, "library/test");
        assert_eq!(status.offset, 5);
        assert!(status.last_activity.timestamp_millis() >= status.started.timestamp_millis());
    }

    #[tokio::test]
    async fn invalid_repository_is_rejected() {
        let uploads = manager(ChunkPolicy::fixed()).await;
        assert!(matches!(
            uploads.start("Not Valid"),
            Err(EngineError::InvalidRepository(_))
        ));
    }

    #[tokio::test]
    async fn mismatch_removes_session() {
        let uploads = manager(ChunkPolicy::fixed()).await;
        let id = uploads.start("library/test").unwrap();
        uploads.write(id, 0, Bytes::from_static(b"payload")).await.unwrap();

        let err = uploads.finalize(id, fingerprint(b"other")).await.unwrap_err();
        assert!(matches!(err, EngineError::DigestMismatch { .. }));
        assert!(matches!(
            uploads.write(id, 7, Bytes::from_static(b"more")).await,
            Err(EngineError::SessionNotFound(_))
        ));
        assert!(!uploads.recipes.exists(&fingerprint(b"payload")).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_not_found() {
        let uploads = manager(ChunkPolicy::fixed()).await;
        let id = uploads.start("library/test").unwrap();
        uploads.cancel(id).await.unwrap();
        assert!(matches!(
            uploads.cancel(id).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let uploads = manager(ChunkPolicy::fixed()).await;
        let idle = uploads.start("library/idle").unwrap();

        assert!(uploads.expire_idle(Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(uploads.expire_idle(later).await, vec![idle]);
        assert!(matches!(
            uploads.status(idle).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }
}
