//! # Storage backends
//!
//! Configuration and unification for the storage drivers which hold blocks
//! and recipes.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

/// Storage backend configuration, as found in a config file.
///
/// ```
/// # use storage::StorageConfig;
/// let config: StorageConfig = serde_json::from_str(r#"{"local": {"path": "/var/lib/layers"}}"#).unwrap();
/// assert!(matches!(config, StorageConfig::Local { .. }));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Volatile in-memory storage.
    Memory,

    /// A directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory.
        path: Utf8PathBuf,
    },

    /// A fresh temporary directory, removed on drop.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured driver.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::io("temp", err).context("create temp dir").build())?
                .into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A view of this storage restricted to a single namespace.
    pub fn namespace<S: Into<String>>(&self, namespace: S) -> Namespace {
        Namespace {
            driver: self.driver.clone(),
            namespace: namespace.into(),
        }
    }
}

/// A storage handle bound to one namespace. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Namespace {
    namespace: String,
    driver: ArcDriver,
}

impl Namespace {
    /// The namespace name.
    pub fn name(&self) -> &str {
        &self.namespace
    }

    /// The name of the underlying driver.
    pub fn driver(&self) -> &'static str {
        self.driver.name()
    }

    /// Get the metadata for an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), namespace=%self.namespace))]
    pub async fn metadata(&self, key: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.namespace, key).await
    }

    /// Whether an object exists.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), namespace=%self.namespace))]
    pub async fn exists(&self, key: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.namespace, key).await
    }

    /// Read a whole object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), namespace=%self.namespace))]
    pub async fn get(&self, key: &Utf8Path) -> Result<Bytes, StorageError> {
        tracing::trace!(%key, "Reading from: {}/{key}", self.namespace);
        self.driver.get(&self.namespace, key).await
    }

    /// Atomically write a whole object.
    #[tracing::instrument(skip(self, data), fields(driver=self.driver.name(), namespace=%self.namespace, size=data.len()))]
    pub async fn put(&self, key: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        tracing::trace!(%key, "Writing to: {}/{key}", self.namespace);
        self.driver.put(&self.namespace, key, data).await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), namespace=%self.namespace))]
    pub async fn delete(&self, key: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.namespace, key).await
    }

    /// List keys, optionally under a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), namespace=%self.namespace))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.driver.list(&self.namespace, prefix).await
    }
}
