#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use super::aperture::Aperture;
use super::{DeviceRuntime, MemoryInfo};
use crate::error::{PoolError, PoolResult};
use crate::kfd::device::KfdDevice;
use crate::kfd::ioctl::{
    AllocMemoryOfGpuArgs, KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE, KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
    KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE, KFD_IOCTL_MAJOR_VERSION,
};
use crate::kfd::sysfs::{self, GpuNode};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

// Constants from fmm.c
const SVM_RESERVATION_LIMIT: u64 = (1 << 47) - 1; // 47-bit VA limit
const SVM_MIN_BASE: u64 = 0x1000_0000; // Start at 256MB
const SVM_ALT_SIZE: u64 = 4 * 1024 * 1024 * 1024; // Fine grain window below the default aperture
const SVM_DEFAULT_ALIGN: u64 = 4096;
const SVM_GUARD_PAGES: u64 = 1;

/// A VRAM region handed out by [`KfdRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KfdBlock {
    /// KFD allocation handle.
    pub handle: u64,
    /// GPU virtual address of the first byte.
    pub gpu_va: u64,
    pub size: u64,
}

/// Device runtime backed by the amdkfd driver for a single GPU node.
#[derive(Debug)]
pub struct KfdRuntime {
    device: KfdDevice,
    node: GpuNode,
    // Kept open for the lifetime of the acquired VM
    _drm: File,
    aperture: Mutex<Aperture>,
}

impl KfdRuntime {
    /// Open the first GPU node in the KFD topology.
    ///
    /// # Errors
    /// Fails if the driver is missing, its ioctl major version differs, no GPU node exists,
    /// or the render node cannot be bound to this process.
    pub fn open() -> PoolResult<Self> {
        Self::open_node(None)
    }

    /// Open a specific GPU node (by topology node id), or the first one when `None`.
    ///
    /// # Errors
    /// See [`KfdRuntime::open`].
    pub fn open_node(node_id: Option<u32>) -> PoolResult<Self> {
        let device = KfdDevice::open()?;

        let version = device.get_version()?;
        if version.major_version != KFD_IOCTL_MAJOR_VERSION {
            return Err(PoolError::Driver(format!(
                "unsupported KFD ioctl version {}.{}",
                version.major_version, version.minor_version
            )));
        }

        let nodes = sysfs::gpu_nodes()?;
        let node_count = nodes.len();
        let node = nodes
            .into_iter()
            .find(|n| node_id.is_none_or(|id| n.node_id == id))
            .ok_or_else(|| PoolError::Driver(format!("no GPU node matching {node_id:?}")))?;

        let drm = OpenOptions::new()
            .read(true)
            .write(true)
            .open(node.render_node_path())?;
        device.acquire_vm(node.gpu_id, drm.as_raw_fd() as u32)?;

        let gpuvm_limit = device
            .process_apertures(node_count.max(1))?
            .iter()
            .find(|a| a.gpu_id == node.gpu_id)
            .map_or(0, |a| a.gpuvm_limit);

        // Coarse grain SVM aperture, as laid out by `init_svm_apertures` in fmm.c
        let svm_limit = if gpuvm_limit > 0 {
            gpuvm_limit.min(SVM_RESERVATION_LIMIT)
        } else {
            SVM_RESERVATION_LIMIT
        };
        let aperture = Aperture::new(
            SVM_MIN_BASE + SVM_ALT_SIZE,
            svm_limit,
            SVM_DEFAULT_ALIGN,
            SVM_GUARD_PAGES,
        );

        debug!(
            node_id = node.node_id,
            gpu_id = node.gpu_id,
            total_bytes = node.total_memory(),
            "opened KFD runtime"
        );

        Ok(Self {
            device,
            node,
            _drm: drm,
            aperture: Mutex::new(aperture),
        })
    }

    #[must_use]
    pub const fn node(&self) -> &GpuNode {
        &self.node
    }
}

impl DeviceRuntime for KfdRuntime {
    type Handle = KfdBlock;

    fn query_memory(&self) -> PoolResult<MemoryInfo> {
        let total_bytes = self.node.total_memory();
        let free_bytes = self.device.available_memory(self.node.gpu_id)?.min(total_bytes);
        Ok(MemoryInfo {
            free_bytes,
            total_bytes,
        })
    }

    fn allocate(&self, bytes: u64) -> PoolResult<KfdBlock> {
        let mut aperture = self.aperture.lock();
        let gpu_va = aperture
            .allocate_va(bytes)
            .ok_or(PoolError::OutOfMemory { requested: bytes })?;

        let mut args = AllocMemoryOfGpuArgs {
            va_addr: gpu_va,
            size: bytes,
            handle: 0,
            mmap_offset: 0,
            gpu_id: self.node.gpu_id,
            flags: KFD_IOC_ALLOC_MEM_FLAGS_VRAM
                | KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE
                | KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE,
        };

        if let Err(e) = self.device.alloc_memory_of_gpu(&mut args) {
            aperture.free_va(gpu_va);
            return Err(if e.raw_os_error() == Some(libc::ENOMEM) {
                PoolError::OutOfMemory { requested: bytes }
            } else {
                e.into()
            });
        }

        if let Err(e) = self.device.map_memory_to_gpu(args.handle, self.node.gpu_id) {
            self.device.free_memory_of_gpu(args.handle).ok();
            aperture.free_va(gpu_va);
            return Err(e.into());
        }

        Ok(KfdBlock {
            handle: args.handle,
            gpu_va,
            size: bytes,
        })
    }

    fn free(&self, block: KfdBlock) -> PoolResult<()> {
        if let Err(e) = self.device.unmap_memory_from_gpu(block.handle, self.node.gpu_id) {
            warn!(handle = block.handle, error = %e, "unmap before free failed");
        }
        let freed = self.device.free_memory_of_gpu(block.handle);
        retire_va(&mut self.aperture.lock(), &block, freed.is_ok());
        freed.map_err(PoolError::from)
    }
}

/// Give the VA of `block` back to the aperture once the driver has released the BO.
///
/// If the native free failed the kernel may still map the range, so it stays reserved
/// and is leaked for the lifetime of the runtime.
fn retire_va(aperture: &mut Aperture, block: &KfdBlock, native_freed: bool) {
    if !native_freed {
        warn!(
            gpu_va = block.gpu_va,
            size = block.size,
            "native free failed, leaking VA range"
        );
        return;
    }
    if !aperture.free_va(block.gpu_va) {
        warn!(gpu_va = block.gpu_va, "freed VA was not tracked by the aperture");
    }
}
