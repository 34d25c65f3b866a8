use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

/// Directory (inside each namespace) which holds in-flight writes.
const TMP_DIR: &str = ".tmp";

/// Storage driver backed by a directory on the local filesystem.
///
/// Layout: `<root>/<namespace>/<key>`. Writes land in
/// `<root>/<namespace>/.tmp/` first, are synced, and are then renamed into
/// place, so an interrupted write never leaves a partial object under its
/// final key.
#[derive(Debug, Clone)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created lazily.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// The root directory of this driver.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, namespace: &str, key: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if key.is_absolute()
            || key
                .components()
                .any(|c| !matches!(c, camino::Utf8Component::Normal(_)))
            || key.as_str().starts_with(TMP_DIR)
        {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                format!("invalid object key: {key}"),
            )
            .namespace(namespace)
            .key(key.as_str())
            .build());
        }

        let mut path = self.root.join(namespace);
        path.push(key);
        Ok(path)
    }

    fn tmp_path(&self, namespace: &str) -> Utf8PathBuf {
        let mut path = self.root.join(namespace);
        path.push(TMP_DIR);
        path.push(uuid::Uuid::new_v4().to_string());
        path
    }

    fn error(&self, namespace: &str, key: &Utf8Path, context: &str, err: std::io::Error) -> StorageError {
        StorageError::io(self.name(), err)
            .namespace(namespace)
            .key(key.as_str())
            .context(context)
            .build()
    }

    async fn write_tmp(&self, tmp: &Utf8Path, data: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = tmp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        file.shutdown().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, namespace: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(namespace, key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.error(namespace, key, "metadata", err))?;
        if !metadata.is_file() {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::NotFound,
                format!("not an object: {key}"),
            )
            .namespace(namespace)
            .key(key.as_str())
            .build());
        }

        Ok(Metadata {
            size: metadata.len(),
            modified: metadata
                .modified()
                .map_err(|err| self.error(namespace, key, "modified time", err))?
                .into(),
        })
    }

    async fn get(&self, namespace: &str, key: &Utf8Path) -> Result<Bytes, StorageError> {
        let path = self.path(namespace, key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|err| self.error(namespace, key, "read", err))?;
        tracing::trace!(%path, size = data.len(), "read object");
        Ok(Bytes::from(data))
    }

    async fn put(&self, namespace: &str, key: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        let path = self.path(namespace, key)?;
        let tmp = self.tmp_path(namespace);

        if let Err(err) = self.write_tmp(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.error(namespace, key, "write temporary object", err));
        }

        let created = match path.parent() {
            Some(parent) => match create_dirs(parent).await {
                Ok(created) => created,
                Err(err) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(self.error(namespace, key, "create_dir_all", err));
                }
            },
            None => Vec::new(),
        };

        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.error(namespace, key, "rename into place", err));
        }

        // The rename, and any directories made for it, are only durable once
        // the directories holding them are synced.
        let parents = path
            .parent()
            .into_iter()
            .chain(created.iter().filter_map(|dir| dir.parent()));
        for dir in parents {
            sync_dir(dir)
                .await
                .map_err(|err| self.error(namespace, key, "sync directory", err))?;
        }

        tracing::trace!(%path, size = data.len(), "wrote object");
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(namespace, key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| self.error(namespace, key, "remove_file", err))?;
        Ok(())
    }

    async fn list(
        &self,
        namespace: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let base = self.root.join(namespace);
        let start = match prefix {
            Some(prefix) => self.path(namespace, prefix)?,
            None => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &start))
            .in_current_span()
            .await
            .map_err(|err| {
                StorageError::builder(self.name(), StorageErrorKind::Other, err)
                    .namespace(namespace)
                    .context("list task")
                    .build()
            })?
            .map_err(|err| {
                StorageError::io(self.name(), err)
                    .namespace(namespace)
                    .context("list")
                    .build()
            })?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }
}

/// Create `dir` and any missing ancestors, returning the directories which
/// did not exist before.
async fn create_dirs(dir: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if tokio::fs::try_exists(path).await? {
            break;
        }
        missing.push(path.to_owned());
        cursor = path.parent();
    }

    if !missing.is_empty() {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(missing)
}

#[cfg(unix)]
async fn sync_dir(dir: &Utf8Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Utf8Path) -> std::io::Result<()> {
    Ok(())
}

/// Walk `start`, returning every file below it as a key relative to `base`.
/// A missing `start` directory is an empty listing.
#[tracing::instrument(level = "trace")]
fn collect_list(base: &Utf8Path, start: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    match visit(base, start, &mut files) {
        Ok(()) => Ok(files),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

fn visit(base: &Utf8Path, path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if entry.file_name() == TMP_DIR {
                continue;
            }
            visit(base, entry.path(), files)?;
        } else if let Ok(key) = entry.path().strip_prefix(base) {
            files.push(key.to_owned());
        }
    }

    Ok(())
}
