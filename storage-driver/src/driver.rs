use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};

use crate::error::StorageError;

/// Object metadata, provided generically by every driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// When the object was last written.
    pub modified: DateTime<Utc>,
}

/// A storage driver: namespaced, key-addressed object storage.
///
/// Keys are relative `/`-separated paths. Drivers must make [`Driver::put`]
/// atomic with respect to readers: a concurrent or later reader observes
/// either no object or the complete object, never a partial write.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for an object.
    async fn metadata(&self, namespace: &str, key: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Read a whole object.
    async fn get(&self, namespace: &str, key: &Utf8Path) -> Result<Bytes, StorageError>;

    /// Write a whole object, replacing any previous contents.
    async fn put(&self, namespace: &str, key: &Utf8Path, data: Bytes) -> Result<(), StorageError>;

    /// Delete an object.
    async fn delete(&self, namespace: &str, key: &Utf8Path) -> Result<(), StorageError>;

    /// List the keys in a namespace, optionally restricted to a key prefix.
    ///
    /// Listing a prefix which holds no objects returns an empty list.
    async fn list(
        &self,
        namespace: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError>;

    /// Check whether an object exists.
    async fn exists(&self, namespace: &str, key: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(namespace, key).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn metadata(&self, namespace: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(namespace, key).await
    }

    async fn get(&self, namespace: &str, key: &Utf8Path) -> Result<Bytes, StorageError> {
        self.deref().get(namespace, key).await
    }

    async fn put(&self, namespace: &str, key: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        self.deref().put(namespace, key, data).await
    }

    async fn delete(&self, namespace: &str, key: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(namespace, key).await
    }

    async fn list(
        &self,
        namespace: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.deref().list(namespace, prefix).await
    }

    async fn exists(&self, namespace: &str, key: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(namespace, key).await
    }
}
