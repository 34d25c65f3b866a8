//! In-memory index of stored blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// What the index knows about one stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockEntry {
    /// Length of the block in bytes.
    pub size: u64,

    /// Last time a write referenced this block.
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    entry: BlockEntry,
    generation: u64,
}

/// Concurrent map of digest to [`BlockEntry`].
///
/// Lookups and inserts lock a single shard, so unrelated digests never
/// contend. Every insert is stamped with the current scan generation, so a
/// rescan can tell entries it has not seen apart from entries written while
/// it was listing.
#[derive(Debug, Default)]
pub(crate) struct BlockIndex {
    blocks: DashMap<Digest, Slot>,
    generation: AtomicU64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    digest: Digest,
    #[serde(flatten)]
    entry: BlockEntry,
}

/// Serialized form of the index, written on clean shutdown.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    created: DateTime<Utc>,
    blocks: Vec<SnapshotRecord>,
}

impl Snapshot {
    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }
}

impl BlockIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, digest: &Digest) -> bool {
        self.blocks.contains_key(digest)
    }

    pub(crate) fn get(&self, digest: &Digest) -> Option<BlockEntry> {
        self.blocks.get(digest).map(|slot| slot.entry)
    }

    /// Record a block. Returns `true` if the digest was not indexed before.
    pub(crate) fn insert(&self, digest: Digest, size: u64) -> bool {
        let now = Utc::now();
        let generation = self.generation.load(Ordering::SeqCst);
        let mut fresh = false;
        self.blocks
            .entry(digest)
            .and_modify(|slot| {
                slot.entry.last_seen = now;
                slot.generation = generation;
            })
            .or_insert_with(|| {
                fresh = true;
                Slot {
                    entry: BlockEntry {
                        size,
                        last_seen: now,
                    },
                    generation,
                }
            });
        fresh
    }

    /// Mark an indexed block as referenced now.
    pub(crate) fn touch(&self, digest: &Digest) {
        if let Some(mut slot) = self.blocks.get_mut(digest) {
            slot.entry.last_seen = Utc::now();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.blocks.iter().map(|slot| slot.entry.size).sum()
    }

    /// Start a rescan. Must be called before storage is listed; the returned
    /// generation is handed back to [`BlockIndex::merge_scan`].
    pub(crate) fn begin_scan(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fold the result of a rescan into the live index.
    ///
    /// Scanned blocks are added. Entries absent from the scan are dropped
    /// unless they were inserted after the scan began. The index is never
    /// emptied in between, so lookups stay answerable throughout.
    pub(crate) fn merge_scan(&self, generation: u64, scanned: HashMap<Digest, u64>) {
        for (digest, size) in &scanned {
            self.blocks.entry(*digest).or_insert_with(|| Slot {
                entry: BlockEntry {
                    size: *size,
                    last_seen: Utc::now(),
                },
                generation,
            });
        }

        self.blocks
            .retain(|digest, slot| scanned.contains_key(digest) || slot.generation >= generation);
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let mut blocks: Vec<_> = self
            .blocks
            .iter()
            .map(|item| SnapshotRecord {
                digest: *item.key(),
                entry: item.value().entry,
            })
            .collect();
        blocks.sort_by(|a, b| a.digest.cmp(&b.digest));
        Snapshot {
            created: Utc::now(),
            blocks,
        }
    }

    /// Replace the index contents with a snapshot.
    pub(crate) fn restore(&self, snapshot: Snapshot) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.blocks.clear();
        for record in snapshot.blocks {
            self.blocks.insert(
                record.digest,
                Slot {
                    entry: record.entry,
                    generation,
                },
            );
        }
    }
}
