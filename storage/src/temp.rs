use std::io;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, StorageError};

/// A [`LocalDriver`] rooted in a temporary directory which is removed when
/// the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` in a fresh temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non utf-8 temp dir"))?
            .to_owned();

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }

    /// The temporary directory backing this driver.
    pub fn root(&self) -> &Utf8Path {
        self.driver.root()
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(&self, namespace: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(namespace, key).await
    }

    async fn get(&self, namespace: &str, key: &Utf8Path) -> Result<Bytes, StorageError> {
        self.driver.get(namespace, key).await
    }

    async fn put(&self, namespace: &str, key: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        self.driver.put(namespace, key, data).await
    }

    async fn delete(&self, namespace: &str, key: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(namespace, key).await
    }

    async fn list(
        &self,
        namespace: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.driver.list(namespace, prefix).await
    }
}
