#![allow(clippy::cast_possible_truncation)]

//! The subset of the KFD ioctl ABI the pool needs: versioning, VM acquisition,
//! process apertures and the VRAM allocate/map/free family.

// ===============================================================================================
// Request Encoding (asm-generic/ioctl.h)
// ===============================================================================================

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn request<T>(dir: u32, nr: u32) -> u32 {
    (dir << IOC_DIRSHIFT)
        | (KFD_IOCTL_BASE << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((std::mem::size_of::<T>() as u32) << IOC_SIZESHIFT)
}

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const KFD_IOCTL_BASE: u32 = 0x4B; // 'K'
pub const KFD_IOCTL_MAJOR_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetVersionArgs {
    pub major_version: u32,
    pub minor_version: u32,
}

// ===============================================================================================
// Process Apertures
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ProcessDeviceApertures {
    pub lds_base: u64,
    pub lds_limit: u64,
    pub scratch_base: u64,
    pub scratch_limit: u64,
    pub gpuvm_base: u64,
    pub gpuvm_limit: u64,
    pub gpu_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetProcessAperturesNewArgs {
    pub kfd_process_device_apertures_ptr: u64,
    pub num_of_nodes: u32,
    pub pad: u32,
}

// ===============================================================================================
// Memory Management
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AcquireVmArgs {
    pub drm_fd: u32,
    pub gpu_id: u32,
}

pub const KFD_IOC_ALLOC_MEM_FLAGS_VRAM: u32 = 1 << 0;
pub const KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE: u32 = 1 << 31;
pub const KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE: u32 = 1 << 28;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AllocMemoryOfGpuArgs {
    pub va_addr: u64,
    pub size: u64,
    pub handle: u64,
    pub mmap_offset: u64,
    pub gpu_id: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FreeMemoryOfGpuArgs {
    pub handle: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetAvailableMemoryArgs {
    pub available: u64,
    pub gpu_id: u32,
    pub pad: u32,
}

/// Shared layout of the map and unmap requests.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MemoryToGpuArgs {
    pub handle: u64,
    pub device_ids_array_ptr: u64,
    pub n_devices: u32,
    pub n_success: u32,
}

// ===============================================================================================
// IOCTL Request Codes
// ===============================================================================================

pub const AMDKFD_IOC_GET_VERSION: u32 = request::<GetVersionArgs>(IOC_READ, 0x01);
pub const AMDKFD_IOC_GET_PROCESS_APERTURES_NEW: u32 =
    request::<GetProcessAperturesNewArgs>(IOC_READ | IOC_WRITE, 0x14);
pub const AMDKFD_IOC_ACQUIRE_VM: u32 = request::<AcquireVmArgs>(IOC_WRITE, 0x15);
pub const AMDKFD_IOC_ALLOC_MEMORY_OF_GPU: u32 =
    request::<AllocMemoryOfGpuArgs>(IOC_READ | IOC_WRITE, 0x16);
pub const AMDKFD_IOC_FREE_MEMORY_OF_GPU: u32 = request::<FreeMemoryOfGpuArgs>(IOC_WRITE, 0x17);
pub const AMDKFD_IOC_MAP_MEMORY_TO_GPU: u32 =
    request::<MemoryToGpuArgs>(IOC_READ | IOC_WRITE, 0x18);
pub const AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU: u32 =
    request::<MemoryToGpuArgs>(IOC_READ | IOC_WRITE, 0x19);
pub const AMDKFD_IOC_AVAILABLE_MEMORY: u32 =
    request::<GetAvailableMemoryArgs>(IOC_READ | IOC_WRITE, 0x23);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_match_kernel_header() {
        // Values from linux/kfd_ioctl.h as compiled for x86_64.
        assert_eq!(AMDKFD_IOC_GET_VERSION, 0x8008_4B01);
        assert_eq!(AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, 0xC028_4B16);
        assert_eq!(AMDKFD_IOC_FREE_MEMORY_OF_GPU, 0x4008_4B17);
        assert_eq!(AMDKFD_IOC_AVAILABLE_MEMORY, 0xC010_4B23);
    }
}
