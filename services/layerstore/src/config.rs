//! Engine configuration, as found in a config file.

use std::time::Duration;

use serde::Deserialize;
use storage::StorageConfig;

use crate::chunker::ChunkPolicy;
use crate::engine::{DEFAULT_NAMESPACE, Engine, EngineBuilder};
use crate::error::EngineResult;
use crate::retry::Backoff;
use crate::upload::DEFAULT_SESSION_TIMEOUT;

/// Configuration for an [`Engine`].
///
/// ```
/// # use layerstore::EngineConfig;
/// let config: EngineConfig = serde_json::from_str(r#"{
///     "storage": "memory",
///     "chunking": {"policy": "fixed", "size": 4096},
///     "session-timeout": 600
/// }"#).unwrap();
/// assert_eq!(config.namespace, "layers");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Storage backend
    pub storage: StorageConfig,

    /// Namespace within the storage backend
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Chunking policy
    #[serde(default)]
    pub chunking: ChunkPolicy,

    /// Seconds an upload session may sit idle before it expires
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,

    /// Retry policy for transient storage failures
    #[serde(default)]
    pub retry: Backoff,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_session_timeout() -> u64 {
    DEFAULT_SESSION_TIMEOUT.as_secs()
}

impl EngineConfig {
    /// A builder populated from this configuration.
    pub fn builder(self) -> EngineResult<EngineBuilder> {
        let storage = self.storage.build()?;
        Ok(EngineBuilder::new()
            .storage(storage)
            .namespace(self.namespace)
            .chunking(self.chunking)
            .session_timeout(Duration::from_secs(self.session_timeout))
            .retry(self.retry))
    }
}

impl Engine {
    /// Build the storage backend and open an engine from configuration.
    pub async fn from_config(config: EngineConfig) -> EngineResult<Engine> {
        config.builder()?.open().await
    }
}
