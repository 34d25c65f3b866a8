//! The storage driver interface: namespaced object storage with atomic
//! writes, and the error type every driver reports through.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
