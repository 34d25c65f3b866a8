//! Reassembling artifacts from their recipes.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::block::BlockStore;
use crate::digest::Digest;
use crate::error::{Corruption, EngineError, EngineResult};
use crate::recipe::{Recipe, RecipeEntry};

/// A stored artifact, ready to be read back.
///
/// The recipe is loaded up front so a missing artifact is reported before
/// any bytes are produced. Blocks are fetched lazily, in recipe order, as
/// the stream is polled. A reconstruction can be streamed any number of
/// times and always yields the same bytes.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    recipe: Recipe,
    blocks: BlockStore,
}

impl Reconstruction {
    pub(crate) fn new(recipe: Recipe, blocks: BlockStore) -> Self {
        Self { recipe, blocks }
    }

    /// The artifact digest
    pub fn digest(&self) -> Digest {
        self.recipe.digest
    }

    /// The artifact length in bytes
    pub fn size(&self) -> u64 {
        self.recipe.size
    }

    /// The recipe being replayed
    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    /// Stream the artifact's bytes, one block per item.
    ///
    /// A block which is missing, or whose length disagrees with the recipe,
    /// ends the stream with [`Corruption`].
    pub fn stream(&self) -> BoxStream<'static, EngineResult<Bytes>> {
        let artifact = self.recipe.digest;
        let state = (self.blocks.clone(), self.recipe.chunks.clone().into_iter());

        stream::try_unfold(state, move |(blocks, mut entries)| async move {
            let Some(entry) = entries.next() else {
                return Ok(None);
            };
            fetch(&blocks, artifact, entry)
                .await
                .map(|data| Some((data, (blocks, entries))))
        })
        .boxed()
    }

    /// Read the whole artifact into memory.
    pub async fn read_to_end(&self) -> EngineResult<Bytes> {
        let capacity = usize::try_from(self.recipe.size).unwrap_or(0);
        let buffer = self
            .stream()
            .try_fold(BytesMut::with_capacity(capacity), |mut buffer, block| async move {
                buffer.extend_from_slice(&block);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }
}

async fn fetch(blocks: &BlockStore, artifact: Digest, entry: RecipeEntry) -> EngineResult<Bytes> {
    let data = match blocks.get(&entry.digest).await {
        Ok(data) => data,
        Err(EngineError::BlockNotFound(block)) => {
            tracing::warn!(%artifact, %block, "recipe references a missing block");
            return Err(Corruption::MissingBlock { artifact, block }.into());
        }
        Err(error) => return Err(error),
    };

    if data.len() as u64 != entry.length {
        tracing::warn!(%artifact, block = %entry.digest, "block length disagrees with recipe");
        return Err(Corruption::BlockLength {
            artifact,
            block: entry.digest,
            expected: entry.length,
            actual: data.len() as u64,
        }
        .into());
    }

    Ok(data)
}
