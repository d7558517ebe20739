pub mod aperture;
pub mod kfd;
pub mod simulated;

use crate::error::PoolResult;
use std::fmt::Debug;
use std::sync::Arc;

/// Free and total device capacity, as reported at the moment of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryInfo {
    /// Bytes that must stay free for other consumers of the device.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn reserved_bytes(&self, reserve_percent: u32) -> u64 {
        // 128-bit so that `total * pct` cannot overflow; the quotient always fits back in u64
        // while `reserve_percent` is at most 100.
        (self.total_bytes as u128 * reserve_percent as u128 / 100) as u64
    }
}

/// The native allocation primitives of one device.
///
/// Implementations are shared across threads by the storage managers, so every
/// method takes `&self` and any internal state needs its own synchronisation.
pub trait DeviceRuntime: Send + Sync {
    /// Opaque reference to a contiguous region of device memory.
    type Handle: Copy + Eq + Debug + Send;

    /// Current free and total capacity. Never cached by callers.
    fn query_memory(&self) -> PoolResult<MemoryInfo>;

    /// Allocate exactly `bytes` bytes.
    fn allocate(&self, bytes: u64) -> PoolResult<Self::Handle>;

    /// Return a region to the device.
    fn free(&self, handle: Self::Handle) -> PoolResult<()>;
}

impl<R: DeviceRuntime + ?Sized> DeviceRuntime for Arc<R> {
    type Handle = R::Handle;

    fn query_memory(&self) -> PoolResult<MemoryInfo> {
        (**self).query_memory()
    }

    fn allocate(&self, bytes: u64) -> PoolResult<Self::Handle> {
        (**self).allocate(bytes)
    }

    fn free(&self, handle: Self::Handle) -> PoolResult<()> {
        (**self).free(handle)
    }
}

pub use kfd::{KfdBlock, KfdRuntime};
pub use simulated::{SimHandle, SimulatedDevice};
