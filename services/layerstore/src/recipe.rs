//! Recipes: the ordered block lists which reassemble an artifact.

use bytes::Bytes;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use storage::{Namespace, StorageError, StorageErrorKind};
use tokio::sync::Mutex;

use crate::digest::{Digest, Fingerprinter};
use crate::error::{Corruption, EngineError, EngineResult};

const RECIPES: &str = "recipes";
const SUFFIX: &str = ".json";
const LOCK_STRIPES: usize = 64;

/// One block reference in a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeEntry {
    /// Block digest
    pub digest: Digest,
    /// Block length in bytes
    pub length: u64,
}

/// How to rebuild an artifact from blocks.
///
/// Concatenating the referenced blocks in order reproduces the artifact,
/// and `size` is the sum of the entry lengths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Digest of the whole artifact
    pub digest: Digest,
    /// Artifact length in bytes
    pub size: u64,
    /// Blocks, in order
    pub chunks: Vec<RecipeEntry>,
}

impl Recipe {
    /// Build a recipe, computing the size from the entries.
    pub fn new(digest: Digest, chunks: Vec<RecipeEntry>) -> Self {
        let size = chunks.iter().map(|entry| entry.length).sum();
        Self {
            digest,
            size,
            chunks,
        }
    }

    /// Number of blocks referenced, counting repeats.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the recipe references no blocks (an empty artifact).
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Digest of the concatenated block digests, useful for comparing
    /// recipes without comparing content.
    pub fn entries_digest(&self) -> Digest {
        let mut fp = Fingerprinter::new();
        for entry in &self.chunks {
            fp.update(entry.digest.as_bytes());
            fp.update(&entry.length.to_be_bytes());
        }
        fp.finalize()
    }
}

/// Persistent recipe storage, keyed by artifact digest.
#[derive(Debug)]
pub struct RecipeStore {
    storage: Namespace,
    locks: Vec<Mutex<()>>,
}

impl RecipeStore {
    /// Create a recipe store in a namespace
    pub fn new(storage: Namespace) -> Self {
        Self {
            storage,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock_for(&self, digest: &Digest) -> &Mutex<()> {
        let bytes = digest.as_bytes();
        let stripe = (usize::from(bytes[0]) << 8) | usize::from(bytes[1]);
        &self.locks[stripe % self.locks.len()]
    }

    /// Save a recipe.
    ///
    /// Every block it references must already be durable. Saving the same
    /// recipe twice is a no-op; saving a different recipe for an existing
    /// digest is [`Corruption::RecipeConflict`].
    #[tracing::instrument(skip(self, recipe), fields(digest = %recipe.digest, chunks = recipe.len()))]
    pub async fn save(&self, recipe: &Recipe) -> EngineResult<()> {
        let _guard = self.lock_for(&recipe.digest).lock().await;

        match self.load(&recipe.digest).await {
            Ok(existing) if existing == *recipe => {
                tracing::debug!("recipe already saved");
                return Ok(());
            }
            Ok(_) => return Err(Corruption::RecipeConflict(recipe.digest).into()),
            Err(EngineError::ArtifactNotFound(_)) => {}
            Err(error) => return Err(error),
        }

        let data = serde_json::to_vec(recipe).map_err(StorageError::with(
            self.storage.driver(),
            StorageErrorKind::Serialization,
        ))?;
        self.storage
            .put(&recipe.digest.sharded_key(RECIPES, SUFFIX), Bytes::from(data))
            .await?;
        Ok(())
    }

    /// Load the recipe for an artifact
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn load(&self, digest: &Digest) -> EngineResult<Recipe> {
        let key = digest.sharded_key(RECIPES, SUFFIX);
        let data = match self.storage.get(&key).await {
            Ok(data) => data,
            Err(error) if error.is_not_found() => {
                return Err(EngineError::ArtifactNotFound(*digest));
            }
            Err(error) => return Err(error.into()),
        };

        let recipe: Recipe =
            serde_json::from_slice(&data).map_err(|source| Corruption::MalformedRecipe {
                artifact: *digest,
                source,
            })?;

        if recipe.digest != *digest {
            tracing::warn!(stored = %recipe.digest, "recipe stored under the wrong digest");
            return Err(Corruption::RecipeConflict(*digest).into());
        }

        Ok(recipe)
    }

    /// Check if a recipe exists
    pub async fn exists(&self, digest: &Digest) -> EngineResult<bool> {
        Ok(self
            .storage
            .exists(&digest.sharded_key(RECIPES, SUFFIX))
            .await?)
    }

    /// List the digests of all stored recipes
    pub async fn list(&self) -> EngineResult<Vec<Digest>> {
        let keys = self.storage.list(Some(Utf8Path::new(RECIPES))).await?;
        let mut digests: Vec<_> = keys
            .iter()
            .filter_map(|key| Digest::from_key(key, SUFFIX))
            .collect();
        digests.sort();
        Ok(digests)
    }
}
