use crate::kfd::ioctl::{
    AMDKFD_IOC_ACQUIRE_VM, AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, AMDKFD_IOC_AVAILABLE_MEMORY,
    AMDKFD_IOC_FREE_MEMORY_OF_GPU, AMDKFD_IOC_GET_PROCESS_APERTURES_NEW, AMDKFD_IOC_GET_VERSION,
    AMDKFD_IOC_MAP_MEMORY_TO_GPU, AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU, AcquireVmArgs,
    AllocMemoryOfGpuArgs, FreeMemoryOfGpuArgs, GetAvailableMemoryArgs, GetProcessAperturesNewArgs,
    GetVersionArgs, MemoryToGpuArgs, ProcessDeviceApertures,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// A handle to the KFD driver character device (`/dev/kfd`).
///
/// Only the memory-management ioctls are exposed. The file is wrapped in an `Arc`
/// so the device can be shared by the runtime and anything it hands blocks to.
#[derive(Clone, Debug)]
pub struct KfdDevice {
    pub file: Arc<File>,
}

impl KfdDevice {
    /// Opens the KFD driver device.
    ///
    /// # Errors
    /// Returns an error if `/dev/kfd` cannot be opened (e.g., driver not loaded, permissions).
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open("/dev/kfd")?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// # Safety
    /// The caller must ensure that `arg` is the argument struct matching `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Get the KFD driver version.
    pub fn get_version(&self) -> io::Result<GetVersionArgs> {
        let mut args = GetVersionArgs::default();
        unsafe {
            self.ioctl(AMDKFD_IOC_GET_VERSION, &mut args)?;
        }
        Ok(args)
    }

    /// Link the KFD process context with the DRM render node of `gpu_id`.
    pub fn acquire_vm(&self, gpu_id: u32, drm_fd: u32) -> io::Result<()> {
        let mut args = AcquireVmArgs { drm_fd, gpu_id };
        unsafe { self.ioctl(AMDKFD_IOC_ACQUIRE_VM, &mut args) }
    }

    /// Fetch the per-GPU aperture layout for this process.
    ///
    /// `capacity` bounds how many entries the driver may fill in.
    #[allow(clippy::cast_possible_truncation)]
    pub fn process_apertures(&self, capacity: usize) -> io::Result<Vec<ProcessDeviceApertures>> {
        let mut apertures = vec![ProcessDeviceApertures::default(); capacity];
        let mut args = GetProcessAperturesNewArgs {
            kfd_process_device_apertures_ptr: apertures.as_mut_ptr() as u64,
            num_of_nodes: capacity as u32,
            pad: 0,
        };
        unsafe {
            self.ioctl(AMDKFD_IOC_GET_PROCESS_APERTURES_NEW, &mut args)?;
        }
        apertures.truncate(args.num_of_nodes as usize);
        Ok(apertures)
    }

    /// Allocate memory on a specific GPU.
    ///
    /// On success, `args.handle` will contain the handle to the allocated memory.
    pub fn alloc_memory_of_gpu(&self, args: &mut AllocMemoryOfGpuArgs) -> io::Result<()> {
        unsafe { self.ioctl(AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, args) }
    }

    /// Free memory previously allocated via `alloc_memory_of_gpu`.
    pub fn free_memory_of_gpu(&self, handle: u64) -> io::Result<()> {
        let mut args = FreeMemoryOfGpuArgs { handle };
        unsafe { self.ioctl(AMDKFD_IOC_FREE_MEMORY_OF_GPU, &mut args) }
    }

    pub fn map_memory_to_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()> {
        let mut args = MemoryToGpuArgs {
            handle,
            device_ids_array_ptr: &raw const gpu_id as u64,
            n_devices: 1,
            n_success: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_MAP_MEMORY_TO_GPU, &mut args) }
    }

    pub fn unmap_memory_from_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()> {
        let mut args = MemoryToGpuArgs {
            handle,
            device_ids_array_ptr: &raw const gpu_id as u64,
            n_devices: 1,
            n_success: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU, &mut args) }
    }

    /// Bytes of VRAM the driver will still hand to this process on `gpu_id`.
    pub fn available_memory(&self, gpu_id: u32) -> io::Result<u64> {
        let mut args = GetAvailableMemoryArgs {
            available: 0,
            gpu_id,
            pad: 0,
        };
        unsafe {
            self.ioctl(AMDKFD_IOC_AVAILABLE_MEMORY, &mut args)?;
        }
        Ok(args.available)
    }
}
