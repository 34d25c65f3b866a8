//! Engine builder and the handle request handlers hold

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::block::BlockStore;
use crate::chunker::ChunkPolicy;
use crate::digest::Digest;
use crate::error::{EngineError, EngineResult};
use crate::reconstruct::Reconstruction;
use crate::recipe::RecipeStore;
use crate::retry::Backoff;
use crate::upload::{DEFAULT_SESSION_TIMEOUT, SessionId, UploadManager, UploadStatus};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "layers";

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Engine builder for configuring and opening a [`Engine`]
#[derive(Debug)]
pub struct EngineBuilder {
    storage: Option<storage::Storage>,
    namespace: Option<String>,
    policy: ChunkPolicy,
    session_timeout: Duration,
    retry: Backoff,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Create a new engine builder
    pub fn new() -> Self {
        Self {
            storage: None,
            namespace: None,
            policy: ChunkPolicy::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            retry: Backoff::default(),
        }
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the namespace within storage
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the chunking policy
    pub fn chunking(mut self, policy: ChunkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set how long an upload session may sit idle before it expires
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the retry policy for transient storage failures
    pub fn retry(mut self, retry: Backoff) -> Self {
        self.retry = retry;
        self
    }

    /// Open the engine, loading or rebuilding the block index.
    #[tracing::instrument(skip(self), fields(namespace = self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)))]
    pub async fn open(self) -> EngineResult<Engine> {
        let storage = self
            .storage
            .ok_or_else(|| EngineError::Config("storage backend must be configured".into()))?;
        self.policy
            .validate()
            .map_err(|err| EngineError::Config(err.to_string()))?;

        let namespace =
            storage.namespace(self.namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()));
        let blocks = BlockStore::open(namespace.clone(), self.retry).await?;
        let recipes = Arc::new(RecipeStore::new(namespace));
        let uploads = UploadManager::new(
            blocks.clone(),
            recipes.clone(),
            self.policy,
            self.session_timeout,
        );

        tracing::info!(
            driver = storage.name(),
            blocks = blocks.len(),
            "opened layer store"
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                blocks,
                recipes,
                uploads,
                policy: self.policy,
            }),
        })
    }
}

#[derive(Debug)]
struct Inner {
    blocks: BlockStore,
    recipes: Arc<RecipeStore>,
    uploads: UploadManager,
    policy: ChunkPolicy,
}

/// The layer store. Cheap to clone; clones share the block index and the
/// upload session table.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

/// Counters describing the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Unique blocks stored
    pub blocks: usize,
    /// Total bytes across unique blocks
    pub block_bytes: u64,
    /// Upload sessions currently open
    pub open_uploads: usize,
}

/// An artifact whose recipe cannot be fully replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamagedArtifact {
    /// The artifact
    pub artifact: Digest,
    /// Referenced blocks which are not in storage
    pub missing: Vec<Digest>,
    /// Referenced blocks whose indexed length disagrees with the recipe
    pub mismatched: Vec<Digest>,
}

/// Result of [`Engine::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Recipes examined
    pub recipes: usize,
    /// Artifacts with missing or mismatched blocks
    pub damaged: Vec<DamagedArtifact>,
    /// Artifacts whose recipe could not be decoded
    pub malformed: Vec<Digest>,
}

impl VerifyReport {
    /// Whether every recipe can be replayed.
    pub fn is_healthy(&self) -> bool {
        self.damaged.is_empty() && self.malformed.is_empty()
    }
}

impl Engine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The chunking policy in use
    pub fn chunking(&self) -> ChunkPolicy {
        self.inner.policy
    }

    /// Begin an upload to `repository`.
    #[tracing::instrument(skip(self))]
    pub fn start_upload(&self, repository: &str) -> EngineResult<SessionId> {
        self.inner.uploads.start(repository)
    }

    /// Append bytes to an upload. `offset` must equal the number of bytes
    /// received so far; the new total is returned.
    #[tracing::instrument(skip(self, data), fields(%id, size = data.len()))]
    pub async fn write_upload(&self, id: SessionId, offset: u64, data: Bytes) -> EngineResult<u64> {
        self.inner.uploads.write(id, offset, data).await
    }

    /// Complete an upload, checking the content against `declared`.
    #[tracing::instrument(skip(self), fields(%id, %declared))]
    pub async fn finalize_upload(&self, id: SessionId, declared: Digest) -> EngineResult<Digest> {
        self.inner.uploads.finalize(id, declared).await
    }

    /// Abandon an upload. Blocks it already stored are left in place.
    #[tracing::instrument(skip(self), fields(%id))]
    pub async fn cancel_upload(&self, id: SessionId) -> EngineResult<()> {
        self.inner.uploads.cancel(id).await
    }

    /// Progress of an open upload
    pub async fn upload_status(&self, id: SessionId) -> EngineResult<UploadStatus> {
        self.inner.uploads.status(id).await
    }

    /// Open a stored artifact for reading.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn fetch_artifact(&self, digest: &Digest) -> EngineResult<Reconstruction> {
        let recipe = self.inner.recipes.load(digest).await?;
        Ok(Reconstruction::new(recipe, self.inner.blocks.clone()))
    }

    /// Check if an artifact is stored
    pub async fn artifact_exists(&self, digest: &Digest) -> EngineResult<bool> {
        self.inner.recipes.exists(digest).await
    }

    /// Length of a stored artifact
    pub async fn artifact_size(&self, digest: &Digest) -> EngineResult<u64> {
        Ok(self.inner.recipes.load(digest).await?.size)
    }

    /// Store a complete artifact in one call.
    #[tracing::instrument(skip(self, data), fields(%declared, size = data.len()))]
    pub async fn put_artifact(
        &self,
        repository: &str,
        declared: Digest,
        data: Bytes,
    ) -> EngineResult<Digest> {
        let id = self.start_upload(repository)?;
        if let Err(error) = self.write_upload(id, 0, data).await {
            self.abandon(id).await;
            return Err(error);
        }
        self.finalize_upload(id, declared).await
    }

    /// Store an artifact read to completion from `reader`.
    #[tracing::instrument(skip(self, reader), fields(%declared))]
    pub async fn push_reader<R>(
        &self,
        repository: &str,
        declared: Digest,
        mut reader: R,
    ) -> EngineResult<Digest>
    where
        R: AsyncRead + Unpin,
    {
        let id = self.start_upload(repository)?;
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut offset = 0;

        loop {
            buffer.reserve(READ_BUFFER_SIZE);
            let read = match reader.read_buf(&mut buffer).await {
                Ok(read) => read,
                Err(err) => {
                    self.abandon(id).await;
                    return Err(EngineError::ReadBody(err));
                }
            };
            if read == 0 {
                break;
            }

            let data = buffer.split().freeze();
            offset = match self.write_upload(id, offset, data).await {
                Ok(offset) => offset,
                Err(error) => {
                    self.abandon(id).await;
                    return Err(error);
                }
            };
        }

        self.finalize_upload(id, declared).await
    }

    async fn abandon(&self, id: SessionId) {
        match self.inner.uploads.cancel(id).await {
            Ok(()) | Err(EngineError::SessionNotFound(_)) => {}
            Err(error) => tracing::warn!(%id, %error, "failed to abandon upload"),
        }
    }

    /// Check every recipe against the stored blocks.
    #[tracing::instrument(skip(self))]
    pub async fn verify(&self) -> EngineResult<VerifyReport> {
        let mut report = VerifyReport::default();

        for artifact in self.inner.recipes.list().await? {
            report.recipes += 1;
            let recipe = match self.inner.recipes.load(&artifact).await {
                Ok(recipe) => recipe,
                Err(EngineError::Corruption(error)) => {
                    tracing::warn!(%artifact, %error, "unreadable recipe");
                    report.malformed.push(artifact);
                    continue;
                }
                Err(error) => return Err(error),
            };

            let mut damage = DamagedArtifact {
                artifact,
                missing: Vec::new(),
                mismatched: Vec::new(),
            };
            for entry in &recipe.chunks {
                if !self.inner.blocks.is_stored(&entry.digest).await? {
                    damage.missing.push(entry.digest);
                } else if self
                    .inner
                    .blocks
                    .size(&entry.digest)
                    .is_some_and(|size| size != entry.length)
                {
                    damage.mismatched.push(entry.digest);
                }
            }

            if !damage.missing.is_empty() || !damage.mismatched.is_empty() {
                tracing::warn!(
                    %artifact,
                    missing = damage.missing.len(),
                    mismatched = damage.mismatched.len(),
                    "artifact cannot be reconstructed"
                );
                report.damaged.push(damage);
            }
        }

        tracing::info!(
            recipes = report.recipes,
            damaged = report.damaged.len(),
            malformed = report.malformed.len(),
            "verified layer store"
        );
        Ok(report)
    }

    /// Store counters
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            blocks: self.inner.blocks.len(),
            block_bytes: self.inner.blocks.total_bytes(),
            open_uploads: self.inner.uploads.len(),
        }
    }

    /// Count blocks in storage, bypassing the index
    pub async fn scan_block_count(&self) -> EngineResult<usize> {
        self.inner.blocks.scan_count().await
    }

    /// Rebuild the block index from storage.
    pub async fn rebuild_index(&self) -> EngineResult<usize> {
        self.inner.blocks.rebuild_index().await
    }

    /// Write the block index so the next open can skip the scan. Call on
    /// clean shutdown.
    pub async fn checkpoint(&self) -> EngineResult<()> {
        self.inner.blocks.checkpoint().await
    }

    /// Expire upload sessions idle since before `now` minus the session
    /// timeout, returning their ids.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        self.inner.uploads.expire_idle(now).await
    }

    /// Spawn a task which expires idle sessions every `interval`. The task
    /// ends once every clone of the engine has been dropped.
    pub fn spawn_session_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    tracing::debug!("engine dropped, stopping session reaper");
                    break;
                };
                let expired = inner.uploads.expire_idle(Utc::now()).await;
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "reaped idle upload sessions");
                }
            }
        })
    }
}
