//! An in-process stand-in for a device runtime.
//!
//! `SimulatedDevice` keeps real capacity accounting so the pool's reserve policy can be
//! exercised without hardware: memory held by other consumers of the device, injected
//! allocation and free failures, and counters for every native call.

use super::{DeviceRuntime, MemoryInfo};
use crate::error::{PoolError, PoolResult};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimHandle(pub u64);

/// Call counters, snapshot via [`SimulatedDevice::counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub allocate_calls: u64,
    pub free_calls: u64,
    pub query_calls: u64,
    pub failed_frees: u64,
}

#[derive(Debug, Default)]
struct SimState {
    total: u64,
    external_used: u64,
    live: HashMap<SimHandle, u64>,
    next_id: u64,
    fail_next_allocs: u32,
    fail_frees: bool,
    counters: SimCounters,
}

impl SimState {
    fn live_bytes(&self) -> u64 {
        self.live.values().sum()
    }

    fn free_bytes(&self) -> u64 {
        self.total
            .saturating_sub(self.external_used)
            .saturating_sub(self.live_bytes())
    }
}

#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    #[must_use]
    pub fn new(total_bytes: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                total: total_bytes,
                next_id: 1,
                ..SimState::default()
            }),
        }
    }

    /// Pretend another process holds `bytes` of this device.
    pub fn set_external_usage(&self, bytes: u64) {
        self.state.lock().external_used = bytes;
    }

    /// Make the next `count` allocations fail regardless of capacity.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().fail_next_allocs = count;
    }

    /// Make every subsequent free report an error (the region is still released).
    pub fn set_fail_frees(&self, fail: bool) {
        self.state.lock().fail_frees = fail;
    }

    #[must_use]
    pub fn counters(&self) -> SimCounters {
        self.state.lock().counters
    }

    /// Bytes currently allocated through this runtime.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.state.lock().live_bytes()
    }

    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.state.lock().live.len()
    }

    #[must_use]
    pub fn is_live(&self, handle: SimHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }
}

impl DeviceRuntime for SimulatedDevice {
    type Handle = SimHandle;

    fn query_memory(&self) -> PoolResult<MemoryInfo> {
        let mut state = self.state.lock();
        state.counters.query_calls += 1;
        Ok(MemoryInfo {
            free_bytes: state.free_bytes(),
            total_bytes: state.total,
        })
    }

    fn allocate(&self, bytes: u64) -> PoolResult<SimHandle> {
        let mut state = self.state.lock();
        state.counters.allocate_calls += 1;

        if state.fail_next_allocs > 0 {
            state.fail_next_allocs -= 1;
            return Err(PoolError::OutOfMemory { requested: bytes });
        }
        if bytes > state.free_bytes() {
            return Err(PoolError::OutOfMemory { requested: bytes });
        }

        let handle = SimHandle(state.next_id);
        state.next_id += 1;
        state.live.insert(handle, bytes);
        Ok(handle)
    }

    fn free(&self, handle: SimHandle) -> PoolResult<()> {
        let mut state = self.state.lock();
        state.counters.free_calls += 1;

        let known = state.live.remove(&handle).is_some();
        if !known {
            state.counters.failed_frees += 1;
            return Err(PoolError::Driver(format!("free of unknown handle {handle:?}")));
        }
        if state.fail_frees {
            state.counters.failed_frees += 1;
            return Err(PoolError::Driver("simulated free failure".into()));
        }
        Ok(())
    }
}
