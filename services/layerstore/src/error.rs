//! Error types for the storage engine

use http::StatusCode;

use crate::digest::{Digest, DigestParseError};
use crate::upload::SessionId;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// The broad class of an [`EngineError`], for callers deciding how to
/// respond without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A block, recipe or upload session does not exist.
    NotFound,
    /// An upload write did not start at the session's current offset.
    OffsetConflict,
    /// The declared digest does not match the uploaded content.
    DigestMismatch,
    /// The request was malformed.
    InvalidRequest,
    /// The underlying storage failed.
    StorageIo,
    /// Stored data is inconsistent.
    Corruption,
}

/// Ways in which stored data can be inconsistent
#[derive(Debug, thiserror::Error)]
pub enum Corruption {
    /// A recipe references a block which is not in the block store
    #[error("artifact {artifact} references missing block {block}")]
    MissingBlock {
        /// The artifact whose recipe is affected
        artifact: Digest,
        /// The missing block
        block: Digest,
    },

    /// A stored block does not have the length its recipe records
    #[error("block {block} has length {actual}, recipe for {artifact} expects {expected}")]
    BlockLength {
        /// The artifact whose recipe is affected
        artifact: Digest,
        /// The block
        block: Digest,
        /// Length recorded in the recipe
        expected: u64,
        /// Length found in storage
        actual: u64,
    },

    /// A recipe was saved again with different contents
    #[error("recipe for {0} already exists with different contents")]
    RecipeConflict(Digest),

    /// A stored recipe could not be decoded
    #[error("malformed recipe for {artifact}: {source}")]
    MalformedRecipe {
        /// The artifact
        artifact: Digest,
        /// The decode failure
        #[source]
        source: serde_json::Error,
    },
}

/// Error types for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Block not found
    #[error("block not found: {0}")]
    BlockNotFound(Digest),

    /// No recipe exists for the artifact
    #[error("artifact not found: {0}")]
    ArtifactNotFound(Digest),

    /// Upload session not found (never started, finished, cancelled or expired)
    #[error("upload session not found: {0}")]
    SessionNotFound(SessionId),

    /// Non-contiguous upload write
    #[error("upload offset conflict: expected {expected}, got {actual}")]
    OffsetConflict {
        /// The session's current offset
        expected: u64,
        /// The offset the client wrote at
        actual: u64,
    },

    /// Digest mismatch at finalize
    #[error("digest mismatch: declared {declared}, computed {computed}")]
    DigestMismatch {
        /// Digest the client declared
        declared: Digest,
        /// Digest of the uploaded content
        computed: Digest,
    },

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] DigestParseError),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// The upload body could not be read from the client
    #[error("failed to read upload body: {0}")]
    ReadBody(#[source] std::io::Error),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Stored data is inconsistent
    #[error("storage corruption: {0}")]
    Corruption(#[from] Corruption),

    /// The upload was cancelled while the operation was in progress
    #[error("upload session {0} was cancelled")]
    Cancelled(SessionId),

    /// Invalid engine configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// The broad class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::BlockNotFound(_)
            | EngineError::ArtifactNotFound(_)
            | EngineError::SessionNotFound(_)
            | EngineError::Cancelled(_) => ErrorKind::NotFound,
            EngineError::OffsetConflict { .. } => ErrorKind::OffsetConflict,
            EngineError::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            EngineError::InvalidDigest(_)
            | EngineError::InvalidRepository(_)
            | EngineError::ReadBody(_)
            | EngineError::Config(_) => ErrorKind::InvalidRequest,
            EngineError::Storage(err) if err.is_not_found() => ErrorKind::NotFound,
            EngineError::Storage(_) => ErrorKind::StorageIo,
            EngineError::Corruption(_) => ErrorKind::Corruption,
        }
    }

    /// Whether this error means the thing asked for does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::BlockNotFound(_)
            | EngineError::ArtifactNotFound(_)
            | EngineError::SessionNotFound(_)
            | EngineError::Cancelled(_) => StatusCode::NOT_FOUND,
            EngineError::OffsetConflict { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            EngineError::InvalidDigest(_)
            | EngineError::InvalidRepository(_)
            | EngineError::ReadBody(_)
            | EngineError::DigestMismatch { .. } => StatusCode::BAD_REQUEST,
            EngineError::Storage(_) | EngineError::Corruption(_) | EngineError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for registry error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::BlockNotFound(_) | EngineError::ArtifactNotFound(_) => "BLOB_UNKNOWN",
            EngineError::SessionNotFound(_) | EngineError::Cancelled(_) => "BLOB_UPLOAD_UNKNOWN",
            EngineError::OffsetConflict { .. } | EngineError::ReadBody(_) => "BLOB_UPLOAD_INVALID",
            EngineError::InvalidDigest(_) | EngineError::DigestMismatch { .. } => "DIGEST_INVALID",
            EngineError::InvalidRepository(_) => "NAME_INVALID",
            EngineError::Storage(_) | EngineError::Corruption(_) | EngineError::Config(_) => {
                "UNKNOWN"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::fingerprint;

    #[test]
    fn protocol_errors_map_to_client_statuses() {
        let err = EngineError::OffsetConflict {
            expected: 10,
            actual: 4,
        };
        assert_eq!(err.kind(), ErrorKind::OffsetConflict);
        assert_eq!(err.status_code(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(err.error_code(), "BLOB_UPLOAD_INVALID");

        let err = EngineError::DigestMismatch {
            declared: fingerprint(b"a"),
            computed: fingerprint(b"b"),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "DIGEST_INVALID");
    }

    #[test]
    fn unreadable_body_is_not_a_storage_failure() {
        let err = EngineError::ReadBody(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "BLOB_UPLOAD_INVALID");
    }

    #[test]
    fn corruption_is_a_server_error() {
        let err: EngineError = Corruption::RecipeConflict(fingerprint(b"x")).into();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("different contents"));
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let err = EngineError::ArtifactNotFound(fingerprint(b"x"));
        assert!(err.is_not_found());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "BLOB_UNKNOWN");
    }
}
