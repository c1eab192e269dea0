//! The byte-storage driver interface used by the registry.

mod driver;
mod error;

pub use driver::slice_range;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
