use super::StorageManager;
use crate::error::{PoolError, PoolResult};
use crate::runtime::DeviceRuntime;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Storage manager without a pool: every `alloc` and `free` goes straight to the runtime.
///
/// Requests are passed through at their exact size, with no overhead added.
#[derive(Debug)]
pub struct NaiveStorageManager<R: DeviceRuntime> {
    runtime: R,
    used_memory: AtomicU64,
}

impl<R: DeviceRuntime> NaiveStorageManager<R> {
    pub const fn new(runtime: R) -> Self {
        Self {
            runtime,
            used_memory: AtomicU64::new(0),
        }
    }

    pub const fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn used_memory(&self) -> u64 {
        self.used_memory.load(Ordering::Relaxed)
    }
}

impl<R: DeviceRuntime> StorageManager for NaiveStorageManager<R> {
    type Handle = R::Handle;

    fn alloc(&self, raw_size: u64) -> PoolResult<Self::Handle> {
        let handle = self
            .runtime
            .allocate(raw_size)
            .map_err(|e| PoolError::ResourceExhausted {
                requested: raw_size,
                source: Box::new(e),
            })?;
        self.used_memory.fetch_add(raw_size, Ordering::Relaxed);
        Ok(handle)
    }

    fn free(&self, handle: Self::Handle, raw_size: u64) {
        self.direct_free(handle, raw_size);
    }

    fn direct_free(&self, handle: Self::Handle, raw_size: u64) {
        if let Err(e) = self.runtime.free(handle) {
            warn!(?handle, error = %e, "ignoring native free failure");
        }
        // Saturating, a mismatched size must not wrap the counter
        let _ = self
            .used_memory
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(raw_size))
            });
    }
}
