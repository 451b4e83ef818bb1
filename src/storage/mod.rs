//! Durable key-value persistence used to mirror in-memory state.
//!
//! Backends store opaque string values under string keys. The store only
//! ever writes whole payloads (last write wins), so backends need no
//! versioning or partial updates.

mod file;
mod memory;

pub use file::{FileStorage, FileStorageConfig};
pub use memory::MemoryStorage;

use crate::error::Result;

/// A durable string key-value store.
///
/// Implementations must be callable from the persistence worker thread,
/// hence `Send + Sync`.
pub trait KeyValueStorage: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

impl<S: KeyValueStorage + ?Sized> KeyValueStorage for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }
}
