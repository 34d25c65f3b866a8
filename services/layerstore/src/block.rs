//! Write-once block storage, fronted by the block index.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use camino::Utf8Path;
use storage::{Namespace, StorageError, StorageErrorKind};

use crate::digest::Digest;
use crate::error::{EngineError, EngineResult};
use crate::index::{BlockEntry, BlockIndex, Snapshot};
use crate::retry::Backoff;

const BLOCKS: &str = "blocks";
const SNAPSHOT: &str = "index/blocks.json";

/// The result of storing a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The block was written.
    Stored,
    /// A block with this digest already existed; nothing was written.
    AlreadyPresent,
}

/// Deduplicating block store
#[derive(Debug, Clone)]
pub struct BlockStore {
    storage: Namespace,
    index: Arc<BlockIndex>,
    checkpointed: Arc<AtomicBool>,
    inserts: Arc<AtomicU64>,
    retry: Backoff,
}

impl BlockStore {
    /// Open the block store in a namespace, populating the index from a
    /// checkpoint if one was left by a clean shutdown, or by scanning
    /// otherwise.
    ///
    /// A checkpoint is removed once loaded, so a crash before the next
    /// checkpoint forces a scan on the following open.
    pub async fn open(storage: Namespace, retry: Backoff) -> EngineResult<Self> {
        let store = Self {
            storage,
            index: Arc::new(BlockIndex::new()),
            checkpointed: Arc::new(AtomicBool::new(false)),
            inserts: Arc::new(AtomicU64::new(0)),
            retry,
        };

        if !store.load_checkpoint().await? {
            store.rebuild_index().await?;
        }

        Ok(store)
    }

    async fn load_checkpoint(&self) -> EngineResult<bool> {
        let key = Utf8Path::new(SNAPSHOT);
        let data = match self.storage.get(key).await {
            Ok(data) => data,
            Err(error) if error.is_not_found() => return Ok(false),
            Err(error) => return Err(error.into()),
        };

        // Consume before trusting it.
        self.storage.delete(key).await?;

        match serde_json::from_slice::<Snapshot>(&data) {
            Ok(snapshot) => {
                tracing::debug!(blocks = snapshot.len(), "loaded block index checkpoint");
                self.index.restore(snapshot);
                Ok(true)
            }
            Err(error) => {
                tracing::warn!(%error, "discarding malformed block index checkpoint");
                Ok(false)
            }
        }
    }

    /// Check if a block exists. Answered from the index alone.
    pub fn exists(&self, digest: &Digest) -> bool {
        self.index.contains(digest)
    }

    /// Check storage directly for a block, bypassing the index.
    pub async fn is_stored(&self, digest: &Digest) -> EngineResult<bool> {
        let key = digest.sharded_key(BLOCKS, "");
        Ok(self.retry.retry("block exists", || self.storage.exists(&key)).await?)
    }

    /// What the index records for a block.
    pub fn entry(&self, digest: &Digest) -> Option<BlockEntry> {
        self.index.get(digest)
    }

    /// Length of an indexed block.
    pub fn size(&self, digest: &Digest) -> Option<u64> {
        self.entry(digest).map(|entry| entry.size)
    }

    /// Store a block, unless one with the same digest is already present.
    ///
    /// The caller must have computed `digest` from `data`. The write is
    /// atomic: readers see either no block or the complete block.
    #[tracing::instrument(skip(self, data), fields(%digest, size = data.len()))]
    pub async fn put(&self, digest: Digest, data: Bytes) -> EngineResult<PutOutcome> {
        if self.index.contains(&digest) {
            tracing::trace!("dedup hit");
            self.index.touch(&digest);
            return Ok(PutOutcome::AlreadyPresent);
        }

        let key = digest.sharded_key(BLOCKS, "");
        let size = data.len() as u64;
        self.retry
            .retry("block put", || self.storage.put(&key, data.clone()))
            .await?;

        if self.index.insert(digest, size) {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.invalidate_checkpoint().await?;
            Ok(PutOutcome::Stored)
        } else {
            // A concurrent put of the same digest won the race; both wrote
            // identical bytes.
            Ok(PutOutcome::AlreadyPresent)
        }
    }

    /// A checkpoint only describes the index at the moment it was written.
    async fn invalidate_checkpoint(&self) -> EngineResult<()> {
        if self.checkpointed.swap(false, Ordering::SeqCst) {
            self.remove_checkpoint().await?;
        }
        Ok(())
    }

    async fn remove_checkpoint(&self) -> EngineResult<()> {
        match self.storage.delete(Utf8Path::new(SNAPSHOT)).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Read a block
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn get(&self, digest: &Digest) -> EngineResult<Bytes> {
        let key = digest.sharded_key(BLOCKS, "");
        match self.retry.retry("block get", || self.storage.get(&key)).await {
            Ok(data) => Ok(data),
            Err(error) if error.is_not_found() => Err(EngineError::BlockNotFound(*digest)),
            Err(error) => Err(error.into()),
        }
    }

    /// Rebuild the index by scanning every block in storage.
    ///
    /// The index stays populated while the scan runs. Blocks stored while
    /// the scan is listing are kept even if the listing missed them.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_index(&self) -> EngineResult<usize> {
        let generation = self.index.begin_scan();
        let keys = self.storage.list(Some(Utf8Path::new(BLOCKS))).await?;

        let mut scanned = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(digest) = Digest::from_key(&key, "") else {
                tracing::warn!(%key, "ignoring unexpected object in block directory");
                continue;
            };
            let metadata = self.storage.metadata(&key).await?;
            scanned.insert(digest, metadata.size);
        }
        self.index.merge_scan(generation, scanned);

        let count = self.index.len();
        tracing::debug!(blocks = count, "rebuilt block index");
        Ok(count)
    }

    /// Number of indexed blocks
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no blocks are indexed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes across indexed blocks
    pub fn total_bytes(&self) -> u64 {
        self.index.total_bytes()
    }

    /// Count the blocks actually present in storage, bypassing the index.
    pub async fn scan_count(&self) -> EngineResult<usize> {
        let keys = self.storage.list(Some(Utf8Path::new(BLOCKS))).await?;
        Ok(keys
            .iter()
            .filter(|key| Digest::from_key(key, "").is_some())
            .count())
    }

    /// Write the index to storage so the next open can skip the scan.
    ///
    /// If a block is stored while the checkpoint is being written, the
    /// checkpoint is removed again rather than left describing an older index.
    #[tracing::instrument(skip(self))]
    pub async fn checkpoint(&self) -> EngineResult<()> {
        // Armed first, so puts racing the write below delete what it leaves.
        self.checkpointed.store(true, Ordering::SeqCst);
        let before = self.inserts.load(Ordering::SeqCst);

        let snapshot = self.index.snapshot();
        let data = serde_json::to_vec(&snapshot).map_err(StorageError::with(
            self.storage.driver(),
            StorageErrorKind::Serialization,
        ))?;
        self.storage.put(Utf8Path::new(SNAPSHOT), data.into()).await?;

        if self.inserts.load(Ordering::SeqCst) != before {
            self.checkpointed.store(false, Ordering::SeqCst);
            self.remove_checkpoint().await?;
            tracing::debug!("blocks stored during checkpoint, discarded it");
            return Ok(());
        }

        tracing::debug!(blocks = snapshot.len(), "wrote block index checkpoint");
        Ok(())
    }
}
