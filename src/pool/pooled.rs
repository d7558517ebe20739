use super::StorageManager;
use super::config::{ExhaustionPolicy, PoolConfig};
use crate::error::{PoolError, PoolResult};
use crate::runtime::DeviceRuntime;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, error, trace, warn};

/// Snapshot of a pool's accounting and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes obtained from the runtime and not yet returned, pooled blocks included.
    pub used_bytes: u64,
    /// Bytes sitting idle in free lists.
    pub pooled_bytes: u64,
    pub pooled_blocks: usize,
    pub native_allocations: u64,
    pub reuse_hits: u64,
    pub flushes: u64,
    pub native_free_failures: u64,
}

#[derive(Debug)]
struct PoolState<H> {
    used_memory: u64,
    // Bucket key -> free handles, most recently freed last
    buckets: HashMap<u64, Vec<H>>,
    native_allocations: u64,
    reuse_hits: u64,
    flushes: u64,
    native_free_failures: u64,
}

impl<H> Default for PoolState<H> {
    fn default() -> Self {
        Self {
            used_memory: 0,
            buckets: HashMap::new(),
            native_allocations: 0,
            reuse_hits: 0,
            flushes: 0,
            native_free_failures: 0,
        }
    }
}

/// A caching allocator for the memory of one device.
///
/// Freed blocks are parked in per-size free lists and handed back out, most recent first,
/// to later requests of exactly the same size. A native allocation is only issued after
/// checking the device's free capacity against the configured reserve; if the request
/// would eat into the reserve, every idle block is returned to the device first.
///
/// All state sits behind one mutex held for the whole of each operation, including the
/// query-decide-allocate sequence of a pool miss.
#[derive(Debug)]
pub struct PooledStorageManager<R: DeviceRuntime> {
    runtime: R,
    config: PoolConfig,
    state: Mutex<PoolState<R::Handle>>,
}

impl<R: DeviceRuntime> PooledStorageManager<R> {
    /// Create an empty pool. No device memory is touched until the first `alloc`.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` if `config` fails validation.
    pub fn new(runtime: R, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        Ok(Self {
            runtime,
            config,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Create a pool configured from the `HSA_POOL_*` environment variables.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` if the environment holds invalid values.
    pub fn from_env(runtime: R) -> PoolResult<Self> {
        Self::new(runtime, PoolConfig::from_env()?)
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub const fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Serve `raw_size` bytes, reusing a pooled block of the same size when one is available.
    ///
    /// # Errors
    /// - `SizeOverflow` if `raw_size` plus the block overhead does not fit in a u64.
    /// - `ResourceExhausted` if the runtime refuses the allocation after the pool was flushed.
    /// - Any error from the runtime's memory query.
    pub fn alloc(&self, raw_size: u64) -> PoolResult<R::Handle> {
        let size = self
            .config
            .bucket_key(raw_size)
            .ok_or(PoolError::SizeOverflow { raw_size })?;

        let mut state = self.state.lock();

        if let Some(handle) = state.buckets.get_mut(&size).and_then(Vec::pop) {
            state.reuse_hits += 1;
            trace!(size, ?handle, "reused pooled block");
            return Ok(handle);
        }

        let info = self.runtime.query_memory()?;
        let reserved = info.reserved_bytes(self.config.reserve_percent);
        if info.free_bytes <= reserved || size > info.free_bytes - reserved {
            debug!(
                size,
                free = info.free_bytes,
                total = info.total_bytes,
                reserved,
                "allocation would breach the reserve, flushing pool"
            );
            self.release_all_locked(&mut state);
        }

        match self.runtime.allocate(size) {
            Ok(handle) => {
                state.used_memory += size;
                state.native_allocations += 1;
                debug!(size, used = state.used_memory, ?handle, "native allocation");
                Ok(handle)
            }
            Err(e) => {
                error!(size, used = state.used_memory, error = %e, "device allocation failed");
                if self.config.exhaustion == ExhaustionPolicy::Abort {
                    std::process::abort();
                }
                Err(PoolError::ResourceExhausted {
                    requested: size,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Park `handle` for reuse by a later request of the same `raw_size`.
    pub fn free(&self, handle: R::Handle, raw_size: u64) {
        let size = raw_size.saturating_add(self.config.block_overhead);
        self.state
            .lock()
            .buckets
            .entry(size)
            .or_default()
            .push(handle);
    }

    /// Return `handle` straight to the runtime, bypassing the pool.
    ///
    /// A failing native free is logged and otherwise ignored.
    pub fn direct_free(&self, handle: R::Handle, raw_size: u64) {
        let size = raw_size.saturating_add(self.config.block_overhead);
        let mut state = self.state.lock();
        self.direct_free_locked(&mut state, handle, size);
    }

    /// Return every pooled block to the runtime.
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        self.release_all_locked(&mut state);
    }

    pub fn used_memory(&self) -> u64 {
        self.state.lock().used_memory
    }

    pub fn pooled_bytes(&self) -> u64 {
        Self::pooled_bytes_of(&self.state.lock())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            used_bytes: state.used_memory,
            pooled_bytes: Self::pooled_bytes_of(&state),
            pooled_blocks: state.buckets.values().map(Vec::len).sum(),
            native_allocations: state.native_allocations,
            reuse_hits: state.reuse_hits,
            flushes: state.flushes,
            native_free_failures: state.native_free_failures,
        }
    }

    fn pooled_bytes_of(state: &PoolState<R::Handle>) -> u64 {
        state
            .buckets
            .iter()
            .map(|(&size, list)| size.saturating_mul(list.len() as u64))
            .fold(0, u64::saturating_add)
    }

    fn direct_free_locked(&self, state: &mut PoolState<R::Handle>, handle: R::Handle, size: u64) {
        if let Err(e) = self.runtime.free(handle) {
            state.native_free_failures += 1;
            let err = PoolError::NativeFreeFailed {
                bytes: size,
                source: Box::new(e),
            };
            warn!(?handle, error = ?err, "ignoring native free failure");
        }
        state.used_memory = state.used_memory.saturating_sub(size);
    }

    fn release_all_locked(&self, state: &mut PoolState<R::Handle>) {
        let buckets = std::mem::take(&mut state.buckets);
        if buckets.values().all(Vec::is_empty) {
            return;
        }

        state.flushes += 1;
        let mut released = 0u64;
        for (size, handles) in buckets {
            for handle in handles {
                self.direct_free_locked(state, handle, size);
                released = released.saturating_add(size);
            }
        }
        debug!(released, used = state.used_memory, "released pooled blocks");
    }
}

impl<R: DeviceRuntime> Drop for PooledStorageManager<R> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<R: DeviceRuntime> StorageManager for PooledStorageManager<R> {
    type Handle = R::Handle;

    fn alloc(&self, raw_size: u64) -> PoolResult<Self::Handle> {
        Self::alloc(self, raw_size)
    }

    fn free(&self, handle: Self::Handle, raw_size: u64) {
        Self::free(self, handle, raw_size);
    }

    fn direct_free(&self, handle: Self::Handle, raw_size: u64) {
        Self::direct_free(self, handle, raw_size);
    }

    fn release_all(&self) {
        Self::release_all(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SimulatedDevice;

    fn pool(total: u64, reserve: u32) -> PooledStorageManager<SimulatedDevice> {
        let config = PoolConfig::new().with_reserve_percent(reserve);
        PooledStorageManager::new(SimulatedDevice::new(total), config).unwrap()
    }

    #[test]
    fn construction_is_lazy() {
        let pool = pool(1 << 20, 5);
        assert_eq!(pool.runtime().counters().query_calls, 0);
        assert_eq!(pool.runtime().counters().allocate_calls, 0);
        assert_eq!(pool.used_memory(), 0);
    }

    #[test]
    fn rejects_invalid_reserve() {
        let config = PoolConfig::new().with_reserve_percent(101);
        let err = PooledStorageManager::new(SimulatedDevice::new(1000), config).unwrap_err();
        assert!(matches!(err, PoolError::ConfigurationInvalid(_)));
    }

    #[test]
    fn empty_flush_is_not_counted() {
        let pool = pool(1 << 20, 5);
        pool.release_all();
        assert_eq!(pool.stats().flushes, 0);
    }

    #[test]
    fn overflowing_request_never_reaches_runtime() {
        let pool = pool(1 << 20, 5);
        let err = pool.alloc(u64::MAX).unwrap_err();
        assert!(matches!(err, PoolError::SizeOverflow { raw_size: u64::MAX }));
        assert_eq!(pool.runtime().counters().allocate_calls, 0);
    }

    #[test]
    fn stats_track_pooled_blocks() {
        let pool = pool(1 << 20, 5);
        let a = pool.alloc(64).unwrap();
        let b = pool.alloc(64).unwrap();
        let c = pool.alloc(128).unwrap();
        pool.free(a, 64);
        pool.free(b, 64);
        pool.free(c, 128);

        let stats = pool.stats();
        assert_eq!(stats.pooled_blocks, 3);
        assert_eq!(stats.pooled_bytes, 2 * 96 + 160);
        assert_eq!(stats.used_bytes, stats.pooled_bytes);
        assert_eq!(stats.native_allocations, 3);
    }

    #[test]
    fn pooled_byte_totals_saturate_on_huge_sizes() {
        let pool = pool(1 << 20, 5);
        let a = pool.alloc(64).unwrap();
        let b = pool.alloc(64).unwrap();
        let c = pool.alloc(64).unwrap();
        pool.free(a, u64::MAX - 1);
        pool.free(b, u64::MAX - 2);
        pool.free(c, u64::MAX - 2);

        let stats = pool.stats();
        assert_eq!(stats.pooled_blocks, 3);
        assert_eq!(stats.pooled_bytes, u64::MAX);
        assert_eq!(pool.pooled_bytes(), u64::MAX);

        pool.release_all();
        assert_eq!(pool.used_memory(), 0);
        assert_eq!(pool.runtime().live_handles(), 0);
        assert_eq!(pool.stats().flushes, 1);
    }
}
