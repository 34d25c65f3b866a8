//! # Deduplicating layer store
//!
//! This crate stores container image layers as content-defined blocks.
//! Each unique block is written once, and every layer keeps a recipe: the
//! ordered list of blocks which reproduces it byte for byte. Layers which
//! share content share blocks.
//!
//! ## Features
//!
//! - FastCDC-style content-defined chunking, or fixed-size chunking
//! - SHA-256 block and layer digests
//! - Resumable upload sessions with offset checks and digest verification
//! - Lazy, streaming reconstruction of stored layers
//! - Pluggable storage backend via the `storage` crate
//! - Builder pattern and serde configuration
//!
//! ## Example
//!
//! ```
//! use bytes::Bytes;
//! use layerstore::{Engine, fingerprint};
//! use storage::MemoryStorage;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder()
//!     .storage(MemoryStorage::new().into())
//!     .namespace("layers")
//!     .open()
//!     .await?;
//!
//! let layer = Bytes::from_static(b"layer contents");
//! let digest = fingerprint(&layer);
//!
//! let id = engine.start_upload("library/example")?;
//! let offset = engine.write_upload(id, 0, layer.clone()).await?;
//! assert_eq!(offset, layer.len() as u64);
//! engine.finalize_upload(id, digest).await?;
//!
//! let artifact = engine.fetch_artifact(&digest).await?;
//! assert_eq!(artifact.read_to_end().await?, layer);
//! # Ok(())
//! # }
//! ```

mod block;
mod chunker;
mod config;
mod digest;
mod engine;
mod error;
mod index;
mod recipe;
mod reconstruct;
mod retry;
mod upload;

pub use block::{BlockStore, PutOutcome};
pub use chunker::{BoundaryDetector, Chunk, ChunkPolicy, Chunker, Chunks, InvalidPolicy};
pub use config::EngineConfig;
pub use digest::{Digest, DigestParseError, Fingerprinter, fingerprint};
pub use engine::{DamagedArtifact, Engine, EngineBuilder, EngineStats, VerifyReport};
pub use error::{Corruption, EngineError, EngineResult, ErrorKind};
pub use index::BlockEntry;
pub use recipe::{Recipe, RecipeEntry, RecipeStore};
pub use reconstruct::Reconstruction;
pub use retry::Backoff;
pub use upload::{SessionId, UploadStatus, validate_repository};
