use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes storage errors by what the caller can do about them,
/// independent of the driver which produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The requested object or namespace does not exist.
    ///
    /// **Retryable:** No.
    NotFound,

    /// The process lacks permission to read or write the object.
    ///
    /// **Retryable:** No, unless the permissions are fixed out of band.
    PermissionDenied,

    /// A read or write failed at the I/O layer (disk full, interrupted
    /// write, flaky network mount).
    ///
    /// **Retryable:** Yes, a bounded number of times.
    Io,

    /// The request itself was malformed (bad key, escaping path).
    ///
    /// **Retryable:** No.
    InvalidRequest,

    /// Stored data could not be encoded or decoded.
    ///
    /// **Retryable:** No.
    Serialization,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    /// Returns whether an operation failing with this kind may succeed
    /// if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Io)
    }

    /// Returns whether this kind indicates the caller asked for
    /// something which does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageErrorKind::NotFound)
    }

    /// Classify a standard I/O error.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            std::io::ErrorKind::InvalidData => StorageErrorKind::Serialization,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Serialization => write!(f, "serialization error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    backtrace: Backtrace,

    /// Span context where the error was created, i.e. the logical async
    /// call stack.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// An error from a storage driver.
///
/// Carries the [`StorageErrorKind`], the driver name, the namespace and key
/// involved (when known), the underlying error, and both a backtrace and a
/// tracing span trace for diagnosis.
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "local",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
/// )
/// .namespace("layers")
/// .key("blocks/sha256/ab/abcdef")
/// .build();
///
/// assert!(error.kind().is_not_found());
/// assert_eq!(error.key(), Some("blocks/sha256/ab/abcdef"));
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    namespace: Option<String>,
    key: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with no location context.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// Create a storage error from an I/O error, classifying it by
    /// [`StorageErrorKind::from_io`].
    pub fn io(engine: &'static str, error: std::io::Error) -> StorageErrorBuilder {
        let kind = StorageErrorKind::from_io(&error);
        Self::builder(engine, kind, error)
    }

    /// Start building a storage error with optional location context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            namespace: None,
            key: None,
            context: None,
        }
    }

    /// Returns a closure which wraps a downstream error, for use with
    /// `.map_err()`.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     std::fs::File::open("/definitely/not/here")
    ///         .map_err(StorageError::with("local", StorageErrorKind::Io))?;
    ///     Ok(())
    /// }
    /// assert!(operation().is_err());
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> impl FnOnce(E) -> StorageError + Send + Sync
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// The error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// The name of the driver which produced this error.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// The namespace involved, if known.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The object key involved, if known.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Extra context, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Whether the failed operation may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind.is_not_found()
    }

    /// The captured backtrace. Capture is controlled by `RUST_BACKTRACE`.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// The captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(namespace) = &self.namespace {
            write!(f, " (namespace: {})", namespace)?;
        }

        if let Some(key) = &self.key {
            write!(f, " (key: {})", key)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for [`StorageError`] which adds optional location context.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    namespace: Option<String>,
    key: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the object key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the error, capturing traces at this point.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            namespace: self.namespace,
            key: self.key,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let err = StorageError::io(
            "test",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        )
        .build();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = StorageError::io(
            "test",
            std::io::Error::new(std::io::ErrorKind::Interrupted, "signal"),
        )
        .build();
        assert_eq!(err.kind(), StorageErrorKind::Io);
        assert!(err.is_retryable());
    }

    #[test]
    fn display_includes_location() {
        let err = StorageError::builder("memory", StorageErrorKind::Other, "boom")
            .namespace("ns")
            .key("a/b")
            .context("put")
            .build();
        assert_eq!(
            err.to_string(),
            "storage error [other error] from memory (namespace: ns) (key: a/b) (put): boom"
        );
    }
}
