pub mod config;
pub mod naive;
pub mod pooled;

use crate::error::PoolResult;

/// Common interface of the storage managers handed to operator code.
pub trait StorageManager: Send + Sync {
    type Handle;

    /// Obtain a block of at least `raw_size` bytes.
    ///
    /// # Errors
    /// Fails when the device cannot provide the memory.
    fn alloc(&self, raw_size: u64) -> PoolResult<Self::Handle>;

    /// Give a block back to the manager. Never fails.
    fn free(&self, handle: Self::Handle, raw_size: u64);

    /// Give a block back to the device itself.
    fn direct_free(&self, handle: Self::Handle, raw_size: u64);

    /// Return any cached blocks to the device. Managers without a cache do nothing.
    fn release_all(&self) {}
}

pub use config::{ExhaustionPolicy, PoolConfig};
pub use naive::NaiveStorageManager;
pub use pooled::{PoolStats, PooledStorageManager};
