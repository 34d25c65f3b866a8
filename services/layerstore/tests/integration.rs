//! Integration tests for the layer store

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use futures::TryStreamExt;
use layerstore::{
    ChunkPolicy, Corruption, Digest, Engine, EngineError, ErrorKind, Recipe, RecipeEntry,
    RecipeStore, fingerprint,
};
use storage::{LocalDriver, MemoryStorage, Storage, TempDriver};

const BLOCK: usize = 4096;

/// Deterministic pseudo-random bytes
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            (state.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 56) as u8
        })
        .collect()
}

fn concat(parts: &[&[u8]]) -> Bytes {
    Bytes::from(parts.concat())
}

fn block_key(digest: &Digest) -> Utf8PathBuf {
    let hex = digest.hex();
    Utf8PathBuf::from(format!("blocks/sha256/{}/{hex}", &hex[..2]))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Helper to create a test engine over in-memory storage
async fn test_engine(storage: &Storage, policy: ChunkPolicy) -> Engine {
    init_tracing();
    Engine::builder()
        .storage(storage.clone())
        .namespace("test-layers")
        .chunking(policy)
        .open()
        .await
        .unwrap()
}

async fn push(engine: &Engine, repository: &str, data: &Bytes) -> Digest {
    let digest = fingerprint(data);
    engine
        .put_artifact(repository, digest, data.clone())
        .await
        .unwrap()
}

async fn pull(engine: &Engine, digest: &Digest) -> Bytes {
    engine
        .fetch_artifact(digest)
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_round_trip_content_defined() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::default()).await;

    let layer = Bytes::from(noise(1, 300_000));
    let digest = push(&engine, "library/ubuntu", &layer).await;

    assert!(engine.artifact_exists(&digest).await.unwrap());
    assert_eq!(engine.artifact_size(&digest).await.unwrap(), 300_000);

    let artifact = engine.fetch_artifact(&digest).await.unwrap();
    assert_eq!(artifact.size(), 300_000);
    assert_eq!(artifact.digest(), digest);
    for entry in &artifact.recipe().chunks {
        assert!(entry.length <= 64 * 1024);
    }

    let blocks: Vec<Bytes> = artifact.stream().try_collect().await.unwrap();
    assert_eq!(blocks.len(), artifact.recipe().len());
    let data = pull(&engine, &digest).await;
    assert_eq!(data, layer);
    assert_eq!(fingerprint(&data), digest);
}

#[tokio::test]
async fn test_shared_blocks_are_stored_once() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let a = noise(10, BLOCK);
    let b = noise(11, BLOCK);
    let c = noise(12, BLOCK);
    let d = noise(13, BLOCK);

    let first = concat(&[&a, &b, &c]);
    let second = concat(&[&a, &b, &d]);
    push(&engine, "library/first", &first).await;
    let digest = push(&engine, "library/second", &second).await;

    assert_eq!(engine.stats().blocks, 4);
    assert_eq!(engine.scan_block_count().await.unwrap(), 4);
    assert_eq!(pull(&engine, &digest).await, second);
}

#[tokio::test]
async fn test_concurrent_uploads_share_blocks() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    const SHARED: usize = 6;
    let shared: Vec<Vec<u8>> = (0..SHARED as u64).map(|i| noise(100 + i, BLOCK)).collect();

    let mut tasks = Vec::new();
    for seed in [200u64, 201] {
        let engine = engine.clone();
        let mut parts = shared.clone();
        parts.push(noise(seed, BLOCK));
        tasks.push(tokio::spawn(async move {
            let id = engine.start_upload("library/concurrent").unwrap();
            let mut fp = layerstore::Fingerprinter::new();
            let mut offset = 0;
            for part in parts {
                fp.update(&part);
                offset = engine
                    .write_upload(id, offset, Bytes::from(part))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
            engine.finalize_upload(id, fp.finalize()).await.unwrap()
        }));
    }

    for task in tasks {
        let digest = task.await.unwrap();
        assert_eq!(engine.artifact_size(&digest).await.unwrap(), ((SHARED + 1) * BLOCK) as u64);
    }
    assert_eq!(engine.stats().blocks, SHARED + 2);
}

#[tokio::test]
async fn test_fragment_sizes_do_not_change_recipe() {
    let layer = Bytes::from(noise(2, 150_000));
    let digest = fingerprint(&layer);

    let whole_storage: Storage = MemoryStorage::new().into();
    let whole = test_engine(&whole_storage, ChunkPolicy::default()).await;
    push(&whole, "library/whole", &layer).await;

    let split_storage: Storage = MemoryStorage::new().into();
    let split = test_engine(&split_storage, ChunkPolicy::default()).await;
    let id = split.start_upload("library/split").unwrap();
    let mut offset = 0;
    for size in [1usize, 7, 4095, 10_000, 3, 65_536].iter().cycle() {
        let start = offset as usize;
        if start >= layer.len() {
            break;
        }
        let end = (start + size).min(layer.len());
        offset = split
            .write_upload(id, offset, layer.slice(start..end))
            .await
            .unwrap();
    }
    split.finalize_upload(id, digest).await.unwrap();

    let expected = whole.fetch_artifact(&digest).await.unwrap();
    let actual = split.fetch_artifact(&digest).await.unwrap();
    assert_eq!(expected.recipe(), actual.recipe());
}

#[tokio::test]
async fn test_digest_mismatch_saves_nothing() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let layer = Bytes::from(noise(3, 3 * BLOCK));
    let wrong = fingerprint(b"something else");

    let id = engine.start_upload("library/mismatch").unwrap();
    engine.write_upload(id, 0, layer.clone()).await.unwrap();
    let err = engine.finalize_upload(id, wrong).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DigestMismatch);
    assert!(matches!(
        err,
        EngineError::DigestMismatch { declared, computed }
            if declared == wrong && computed == fingerprint(&layer)
    ));
    assert!(!engine.artifact_exists(&wrong).await.unwrap());
    assert!(!engine.artifact_exists(&fingerprint(&layer)).await.unwrap());
    assert!(matches!(
        engine.fetch_artifact(&wrong).await,
        Err(EngineError::ArtifactNotFound(_))
    ));
    assert!(matches!(
        engine.upload_status(id).await,
        Err(EngineError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_cancelled_upload_is_not_committed() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let layer = Bytes::from(noise(4, 4 * BLOCK));
    let digest = fingerprint(&layer);

    let id = engine.start_upload("library/cancel").unwrap();
    let offset = engine
        .write_upload(id, 0, layer.slice(..2 * BLOCK))
        .await
        .unwrap();
    engine.cancel_upload(id).await.unwrap();

    assert!(matches!(
        engine.write_upload(id, offset, layer.slice(2 * BLOCK..)).await,
        Err(EngineError::SessionNotFound(_))
    ));
    assert!(matches!(
        engine.finalize_upload(id, digest).await,
        Err(EngineError::SessionNotFound(_))
    ));

    let err = engine.fetch_artifact(&digest).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.error_code(), "BLOB_UNKNOWN");
    assert_eq!(engine.stats().open_uploads, 0);
}

#[tokio::test]
async fn test_offset_conflict() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let id = engine.start_upload("library/offsets").unwrap();
    engine
        .write_upload(id, 0, Bytes::from_static(b"0123456789"))
        .await
        .unwrap();

    let err = engine
        .write_upload(id, 4, Bytes::from_static(b"overlap"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OffsetConflict);
    assert_eq!(err.status_code(), http::StatusCode::RANGE_NOT_SATISFIABLE);

    let status = engine.upload_status(id).await.unwrap();
    assert_eq!(status.offset, 10);
    assert_eq!(status.repository, "library/offsets");
}

#[tokio::test]
async fn test_empty_artifact() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::default()).await;

    let digest = push(&engine, "library/empty", &Bytes::new()).await;
    let artifact = engine.fetch_artifact(&digest).await.unwrap();
    assert!(artifact.recipe().is_empty());
    assert_eq!(artifact.size(), 0);
    assert!(artifact.read_to_end().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_push_is_accepted() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let layer = Bytes::from(noise(5, 5 * BLOCK));
    let digest = push(&engine, "library/first", &layer).await;
    let stats = engine.stats();

    assert_eq!(push(&engine, "library/again", &layer).await, digest);
    assert_eq!(engine.stats(), stats);
    assert_eq!(pull(&engine, &digest).await, layer);
}

#[tokio::test]
async fn test_recipe_conflict_is_corruption() {
    let storage: Storage = MemoryStorage::new().into();
    let recipes = RecipeStore::new(storage.namespace("test-layers"));

    let digest = fingerprint(b"abcd");
    let entry = |data: &[u8]| RecipeEntry {
        digest: fingerprint(data),
        length: data.len() as u64,
    };

    recipes
        .save(&Recipe::new(digest, vec![entry(b"ab"), entry(b"cd")]))
        .await
        .unwrap();
    recipes
        .save(&Recipe::new(digest, vec![entry(b"ab"), entry(b"cd")]))
        .await
        .unwrap();

    let err = recipes
        .save(&Recipe::new(digest, vec![entry(b"abcd")]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
    assert!(matches!(
        err,
        EngineError::Corruption(Corruption::RecipeConflict(d)) if d == digest
    ));
}

#[tokio::test]
async fn test_reopen_local_directory() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

    let a = Bytes::from(noise(6, 40_000));
    let b = Bytes::from(noise(7, 70_000));

    let (digest_a, digest_b, blocks) = {
        let engine = Engine::builder()
            .storage(LocalDriver::new(root.clone()).into())
            .open()
            .await
            .unwrap();
        let digest_a = push(&engine, "library/a", &a).await;
        let digest_b = push(&engine, "library/b", &b).await;
        (digest_a, digest_b, engine.stats().blocks)
    };

    // No checkpoint was written, so the index is rebuilt by scanning.
    let engine = Engine::builder()
        .storage(LocalDriver::new(root.clone()).into())
        .open()
        .await
        .unwrap();
    assert_eq!(engine.stats().blocks, blocks);
    assert_eq!(pull(&engine, &digest_a).await, a);
    assert_eq!(pull(&engine, &digest_b).await, b);

    engine.checkpoint().await.unwrap();
    drop(engine);

    let engine = Engine::builder()
        .storage(LocalDriver::new(root).into())
        .open()
        .await
        .unwrap();
    assert_eq!(engine.stats().blocks, blocks);
    assert_eq!(engine.scan_block_count().await.unwrap(), blocks);
    assert_eq!(pull(&engine, &digest_b).await, b);
}

#[tokio::test]
async fn test_verify_reports_missing_block() {
    let storage: Storage = TempDriver::new().unwrap().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let healthy = Bytes::from(noise(8, 2 * BLOCK));
    let damaged = Bytes::from(noise(9, 3 * BLOCK));
    push(&engine, "library/healthy", &healthy).await;
    let digest = push(&engine, "library/damaged", &damaged).await;

    assert!(engine.verify().await.unwrap().is_healthy());

    let lost = fingerprint(&damaged[BLOCK..2 * BLOCK]);
    storage
        .namespace("test-layers")
        .delete(&block_key(&lost))
        .await
        .unwrap();

    let report = engine.verify().await.unwrap();
    assert_eq!(report.recipes, 2);
    assert!(!report.is_healthy());
    assert_eq!(report.damaged.len(), 1);
    assert_eq!(report.damaged[0].artifact, digest);
    assert_eq!(report.damaged[0].missing, vec![lost]);

    let err = engine
        .fetch_artifact(&digest)
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[tokio::test]
async fn test_idle_sessions_expire() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let idle = engine.start_upload("library/idle").unwrap();
    let busy = engine.start_upload("library/busy").unwrap();
    engine
        .write_upload(busy, 0, Bytes::from_static(b"data"))
        .await
        .unwrap();

    assert!(engine.expire_idle(Utc::now()).await.is_empty());

    let mut expired = engine
        .expire_idle(Utc::now() + chrono::Duration::hours(2))
        .await;
    expired.sort_by_key(|id| id.to_string());
    let mut expected = vec![idle, busy];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(expired, expected);

    let err = engine.upload_status(idle).await.unwrap_err();
    assert_eq!(err.error_code(), "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_repository() {
    let storage: Storage = MemoryStorage::new().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let err = engine.start_upload("Library/UPPER").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(err.error_code(), "NAME_INVALID");
}

#[tokio::test]
async fn test_layout_on_disk() {
    let storage: Storage = TempDriver::new().unwrap().into();
    let engine = test_engine(&storage, ChunkPolicy::fixed()).await;

    let layer = Bytes::from(noise(14, BLOCK + 10));
    let digest = push(&engine, "library/layout", &layer).await;

    let namespace = storage.namespace("test-layers");
    let hex = digest.hex();
    let recipe_key = format!("recipes/sha256/{}/{hex}.json", &hex[..2]);
    let json = namespace.get(Utf8Path::new(&recipe_key)).await.unwrap();
    let recipe: Recipe = serde_json::from_slice(&json).unwrap();
    assert_eq!(recipe.digest, digest);
    assert_eq!(recipe.size, (BLOCK + 10) as u64);
    assert_eq!(recipe.chunks.len(), 2);

    for entry in &recipe.chunks {
        assert!(namespace.exists(&block_key(&entry.digest)).await.unwrap());
    }
}
