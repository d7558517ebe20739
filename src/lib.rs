//! Pooled device-memory allocation for AMD GPUs.
//!
//! [`PooledStorageManager`] caches freed device blocks by size and reuses them, keeping a
//! configurable share of device memory free for other consumers. The device itself is
//! abstracted by [`DeviceRuntime`]; [`KfdRuntime`] drives the amdkfd driver directly and
//! [`SimulatedDevice`] stands in for it in tests.

pub mod error;
pub mod kfd;
pub mod pool;
pub mod runtime;

pub use error::{PoolError, PoolResult};
pub use pool::{
    ExhaustionPolicy, NaiveStorageManager, PoolConfig, PoolStats, PooledStorageManager,
    StorageManager,
};
pub use runtime::{DeviceRuntime, KfdRuntime, MemoryInfo, SimulatedDevice};
