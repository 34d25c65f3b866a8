use std::collections::HashMap;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

#[derive(Debug, Clone)]
struct MemoryObject {
    modified: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryObject {
    fn from(data: Bytes) -> Self {
        Self {
            modified: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            modified: value.modified,
            size: value.data.len() as u64,
        }
    }
}

type Objects = HashMap<Utf8PathBuf, MemoryObject>;

/// Storage driver that keeps objects in memory. Writes replace the whole
/// object under the lock, so they are trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    namespaces: RwLock<HashMap<String, Objects>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` with no namespaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` with the given (empty) namespaces.
    pub fn with_namespaces(namespaces: &[&str]) -> Self {
        let map = namespaces
            .iter()
            .map(|ns| (ns.to_string(), HashMap::new()))
            .collect();

        Self {
            namespaces: RwLock::new(map),
        }
    }

    fn not_found(&self, namespace: &str, key: Option<&Utf8Path>) -> StorageError {
        let message = match key {
            Some(key) => format!("object not found: {key}"),
            None => format!("namespace not found: {namespace}"),
        };
        let builder = StorageError::builder(self.name(), StorageErrorKind::NotFound, message)
            .namespace(namespace);
        match key {
            Some(key) => builder.key(key.as_str()).build(),
            None => builder.build(),
        }
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, namespace: &str, key: &Utf8Path) -> Result<Metadata, StorageError> {
        let namespaces = self.namespaces.read().await;
        let objects = namespaces
            .get(namespace)
            .ok_or_else(|| self.not_found(namespace, None))?;
        objects
            .get(key)
            .map(Metadata::from)
            .ok_or_else(|| self.not_found(namespace, Some(key)))
    }

    async fn get(&self, namespace: &str, key: &Utf8Path) -> Result<Bytes, StorageError> {
        let namespaces = self.namespaces.read().await;
        let objects = namespaces
            .get(namespace)
            .ok_or_else(|| self.not_found(namespace, None))?;
        objects
            .get(key)
            .map(|object| object.data.clone())
            .ok_or_else(|| self.not_found(namespace, Some(key)))
    }

    async fn put(&self, namespace: &str, key: &Utf8Path, data: Bytes) -> Result<(), StorageError> {
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_owned(), data.into());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &Utf8Path) -> Result<(), StorageError> {
        let mut namespaces = self.namespaces.write().await;
        let objects = namespaces
            .get_mut(namespace)
            .ok_or_else(|| self.not_found(namespace, None))?;
        objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| self.not_found(namespace, Some(key)))
    }

    async fn list(
        &self,
        namespace: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>, StorageError> {
        tracing::trace!(%namespace, ?prefix, "list memory namespace");

        let namespaces = self.namespaces.read().await;
        let Some(objects) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        Ok(objects
            .keys()
            .filter(|key| prefix.map_or(true, |prefix| key.starts_with(prefix)))
            .cloned()
            .collect())
    }
}
