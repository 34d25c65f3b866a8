//! Splitting byte streams into chunks.
//!
//! Two policies are supported. [`ChunkPolicy::Fixed`] cuts every `size`
//! bytes. [`ChunkPolicy::ContentDefined`] is FastCDC-style: a gear rolling
//! hash is evaluated over each chunk once it reaches `min` bytes, and a
//! boundary is declared where the hash matches a mask. A harder mask applies
//! below `avg` and an easier one above it, which pulls chunk sizes towards
//! `avg`; a cut is forced at `max`. Boundaries depend only on nearby content,
//! so an edit moves the boundaries around it and leaves the rest alone.
//!
//! [`BoundaryDetector`] is the boundary decision on its own. [`Chunker`]
//! wraps it with a carry-over buffer so input can arrive in arbitrary
//! fragments, and [`Chunks`] iterates over a complete buffer.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;

use crate::digest::{self, Digest};

/// Default fixed chunk size.
pub const DEFAULT_FIXED_SIZE: usize = 4 * 1024;
/// Default minimum content-defined chunk size.
pub const DEFAULT_MIN_SIZE: usize = 4 * 1024;
/// Default target average content-defined chunk size.
pub const DEFAULT_AVG_SIZE: usize = 8 * 1024;
/// Default maximum content-defined chunk size.
pub const DEFAULT_MAX_SIZE: usize = 64 * 1024;

/// How to split a stream into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum ChunkPolicy {
    /// Cut every `size` bytes.
    Fixed {
        /// Chunk size in bytes.
        size: usize,
    },

    /// Cut where the rolling hash of the content matches, within
    /// `[min, max]` bytes per chunk.
    ContentDefined {
        /// Minimum chunk size. Only the final chunk of a stream may be shorter.
        min: usize,
        /// Target average chunk size.
        avg: usize,
        /// Maximum chunk size.
        max: usize,
    },
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        ChunkPolicy::ContentDefined {
            min: DEFAULT_MIN_SIZE,
            avg: DEFAULT_AVG_SIZE,
            max: DEFAULT_MAX_SIZE,
        }
    }
}

/// An invalid [`ChunkPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chunk policy: {0}")]
pub struct InvalidPolicy(&'static str);

impl ChunkPolicy {
    /// Fixed-size chunking with the default size.
    pub fn fixed() -> Self {
        ChunkPolicy::Fixed {
            size: DEFAULT_FIXED_SIZE,
        }
    }

    /// Check the policy's sizes are consistent.
    pub fn validate(&self) -> Result<(), InvalidPolicy> {
        match *self {
            ChunkPolicy::Fixed { size } if size == 0 => {
                Err(InvalidPolicy("fixed chunk size must be positive"))
            }
            ChunkPolicy::Fixed { .. } => Ok(()),
            ChunkPolicy::ContentDefined { min, .. } if min == 0 => {
                Err(InvalidPolicy("minimum chunk size must be positive"))
            }
            ChunkPolicy::ContentDefined { min, avg, max } if !(min <= avg && avg <= max) => {
                Err(InvalidPolicy("chunk sizes must satisfy min <= avg <= max"))
            }
            ChunkPolicy::ContentDefined { .. } => Ok(()),
        }
    }

    /// The largest chunk this policy can produce.
    pub fn max_size(&self) -> usize {
        match *self {
            ChunkPolicy::Fixed { size } => size,
            ChunkPolicy::ContentDefined { max, .. } => max,
        }
    }
}

/// SplitMix64, used once at compile time to fill the gear table.
const fn gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state: u64 = 0x6c61_7965_7273_746f;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        table[i] = z ^ (z >> 31);
        i += 1;
    }
    table
}

static GEAR: [u64; 256] = gear_table();

/// A mask of the `bits` most significant bits. The gear hash shifts left
/// once per byte, so its high bits depend on the last 64 bytes.
fn high_mask(bits: u32) -> u64 {
    match bits {
        0 => 0,
        64.. => u64::MAX,
        bits => u64::MAX << (64 - bits),
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Fixed {
        size: usize,
    },
    Gear {
        min: usize,
        avg: usize,
        max: usize,
        mask_small: u64,
        mask_large: u64,
    },
}

/// The chunk boundary decision as an explicit state machine: the number of
/// bytes in the current chunk, the rolling hash, and the masks.
#[derive(Debug, Clone)]
pub struct BoundaryDetector {
    mode: Mode,
    len: usize,
    hash: u64,
}

impl BoundaryDetector {
    /// A detector positioned at the start of a chunk.
    pub fn new(policy: ChunkPolicy) -> Self {
        let mode = match policy {
            ChunkPolicy::Fixed { size } => Mode::Fixed { size: size.max(1) },
            ChunkPolicy::ContentDefined { min, avg, max } => {
                let min = min.max(1);
                let max = max.max(min);
                let avg = avg.clamp(min, max);
                let bits = avg.ilog2();
                Mode::Gear {
                    min,
                    avg,
                    max,
                    mask_small: high_mask(bits + 2),
                    mask_large: high_mask(bits.saturating_sub(2)),
                }
            }
        };

        Self {
            mode,
            len: 0,
            hash: 0,
        }
    }

    /// Bytes seen since the last boundary.
    pub fn position(&self) -> usize {
        self.len
    }

    /// Forget the current chunk and start over.
    pub fn reset(&mut self) {
        self.len = 0;
        self.hash = 0;
    }

    /// Scan `data`, which continues the current chunk. If a boundary falls
    /// inside it, returns the number of leading bytes of `data` that complete
    /// the chunk and resets for the next one. Otherwise consumes all of
    /// `data` into the current chunk and returns `None`.
    pub fn scan(&mut self, data: &[u8]) -> Option<usize> {
        match self.mode {
            Mode::Fixed { size } => {
                let needed = size - self.len;
                if data.len() >= needed {
                    self.reset();
                    Some(needed)
                } else {
                    self.len += data.len();
                    None
                }
            }
            Mode::Gear {
                min,
                avg,
                max,
                mask_small,
                mask_large,
            } => {
                let mut i = 0;

                // Nothing can be cut before `min`, so skip hashing there.
                if self.len < min {
                    let skip = (min - self.len).min(data.len());
                    self.len += skip;
                    i = skip;
                    if skip > 0 && self.len >= max {
                        self.reset();
                        return Some(i);
                    }
                }

                while i < data.len() {
                    self.len += 1;
                    self.hash = (self.hash << 1).wrapping_add(GEAR[data[i] as usize]);
                    i += 1;

                    let mask = if self.len < avg { mask_small } else { mask_large };
                    if self.hash & mask == 0 || self.len >= max {
                        self.reset();
                        return Some(i);
                    }
                }

                None
            }
        }
    }
}

/// A chunk of an input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the first byte of this chunk within the stream.
    pub offset: u64,
    /// The chunk contents.
    pub data: Bytes,
}

impl Chunk {
    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk is empty. Chunkers never produce empty chunks.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The digest of the chunk contents.
    pub fn fingerprint(&self) -> Digest {
        digest::fingerprint(&self.data)
    }
}

/// A streaming chunker. Input is pushed in arbitrary fragments; bytes after
/// the last boundary are carried in a buffer which is reused from chunk to
/// chunk.
#[derive(Debug)]
pub struct Chunker {
    detector: BoundaryDetector,
    buffer: BytesMut,
    capacity: usize,
    offset: u64,
}

impl Chunker {
    /// A chunker at offset zero.
    pub fn new(policy: ChunkPolicy) -> Self {
        let capacity = policy.max_size().max(1);
        Self {
            detector: BoundaryDetector::new(policy),
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            offset: 0,
        }
    }

    /// Stream offset of the first byte not yet emitted as part of a chunk.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes waiting for a boundary.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Consume bytes from the front of `input` up to and including the next
    /// boundary. Returns the completed chunk if there was one, leaving the
    /// rest in `input`; otherwise buffers all of `input` and returns `None`.
    ///
    /// ```
    /// # use layerstore::{Chunker, ChunkPolicy};
    /// let mut chunker = Chunker::new(ChunkPolicy::Fixed { size: 4 });
    /// let mut input: &[u8] = b"abcdefghij";
    /// let mut chunks = Vec::new();
    /// while let Some(chunk) = chunker.next_chunk(&mut input) {
    ///     chunks.push(chunk);
    /// }
    /// chunks.extend(chunker.finish());
    /// assert_eq!(chunks.len(), 3);
    /// assert_eq!(&chunks[2].data[..], b"ij");
    /// ```
    pub fn next_chunk(&mut self, input: &mut &[u8]) -> Option<Chunk> {
        if input.is_empty() {
            return None;
        }

        match self.detector.scan(input) {
            Some(n) => {
                self.buffer.extend_from_slice(&input[..n]);
                *input = &input[n..];
                Some(self.emit())
            }
            None => {
                self.buffer.extend_from_slice(input);
                *input = &[];
                None
            }
        }
    }

    /// Flush the bytes after the last boundary as a final, possibly short,
    /// chunk.
    pub fn finish(&mut self) -> Option<Chunk> {
        self.detector.reset();
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.emit())
        }
    }

    fn emit(&mut self) -> Chunk {
        let data = self.buffer.split().freeze();
        // Reclaims the allocation once the previous chunk has been dropped.
        self.buffer.reserve(self.capacity);
        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += chunk.len() as u64;
        chunk
    }
}

/// Lazily chunks a complete buffer.
///
/// ```
/// # use layerstore::{Chunks, ChunkPolicy};
/// let data = vec![7u8; 10_000];
/// let total: usize = Chunks::new(ChunkPolicy::default(), &data).map(|c| c.len()).sum();
/// assert_eq!(total, data.len());
/// ```
#[derive(Debug)]
pub struct Chunks<'a> {
    detector: BoundaryDetector,
    data: &'a [u8],
    offset: u64,
}

impl<'a> Chunks<'a> {
    /// Chunk `data` according to `policy`.
    pub fn new(policy: ChunkPolicy, data: &'a [u8]) -> Self {
        Self {
            detector: BoundaryDetector::new(policy),
            data,
            offset: 0,
        }
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        let n = self
            .detector
            .scan(self.data)
            .unwrap_or(self.data.len());
        self.detector.reset();

        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        let chunk = Chunk {
            offset: self.offset,
            data: Bytes::copy_from_slice(head),
        };
        self.offset += n as u64;
        Some(chunk)
    }
}
