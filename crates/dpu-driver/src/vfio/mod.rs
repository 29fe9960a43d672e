//! VFIO device access with IOMMU-pinned DMA buffers.
//!
//! # Requirements
//!
//! 1. IOMMU enabled in firmware and kernel (`intel_iommu=on` or `amd_iommu=on`)
//! 2. Device bound to `vfio-pci`
//! 3. Access to `/dev/vfio/<group>` (group ownership or root)
//!
//! ```bash
//! echo "0000:01:00.0" > /sys/bus/pci/devices/0000:01:00.0/driver/unbind
//! echo "0000:01:00.0" > /sys/bus/pci/drivers/vfio-pci/bind
//! sudo chown $USER /dev/vfio/$IOMMU_GROUP
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ DeviceBuffer│────▶│  DmaBuffer  │────▶│   IOMMU     │
//! │             │     │  (pinned)   │     │  iova map   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  MmioQueue  │────▶│ BAR0 (mmap) │────▶│  DPU CUs    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! VFIO ioctls go through `libc`; mmap/mlock use `rustix`.

// ioctl argument structs carry u32 argsz fields.
#![allow(clippy::cast_possible_truncation)]

use crate::backends::HostPages;
use crate::error::{DpuError, Result};
use rustix::mm::{mlock, munlock};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// VFIO ioctl numbers: `_IO(';', 100 + n)`
mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    const VFIO_TYPE: u8 = b';';
    const VFIO_BASE: u8 = 100;

    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);
    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// Open VFIO container, group and device for one PCIe function
#[derive(Debug)]
pub struct VfioDevice {
    pcie_address: String,
    container: Arc<File>,
    // Closing the group detaches it from the container.
    _group: File,
    device: File,
    num_regions: u32,
}

impl VfioDevice {
    /// Open the device at `pcie_address` with a Type1v2 IOMMU container.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the device has no IOMMU group and
    /// `HardwareError` if any step of the VFIO handshake fails.
    pub fn open(pcie_address: &str) -> Result<Self> {
        info!("Opening VFIO device {pcie_address}");
        let group_id = iommu_group(pcie_address)?;
        debug!("IOMMU group: {group_id}");

        let container = open_rw("/dev/vfio/vfio")?;

        // SAFETY: container is /dev/vfio/vfio; _IO ioctl without argument.
        let api_version = unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if api_version != ioctls::VFIO_API_VERSION {
            return Err(DpuError::hardware_error(format!("Unsupported VFIO API version: {api_version}")));
        }

        // SAFETY: container open; third argument is the extension id by value.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(DpuError::hardware_error("VFIO Type1v2 IOMMU not supported"));
        }

        let group = open_rw(&format!("/dev/vfio/{group_id}"))?;
        let mut status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        // SAFETY: group fd open; status is laid out as the kernel struct.
        let ret = unsafe { libc::ioctl(group.as_raw_fd(), ioctls::VFIO_GROUP_GET_STATUS as _, &raw mut status) };
        if ret < 0 || status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(DpuError::hardware_error(
                "VFIO group not viable (all devices in the group must be bound to vfio-pci)",
            ));
        }

        let container_fd = container.as_raw_fd();
        // SAFETY: group viable; the kernel reads the container fd through the pointer.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container_fd),
            )
        };
        check_ret(ret, "set container")?;

        // SAFETY: container has a group attached; argument is the IOMMU type.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        check_ret(ret, "set IOMMU")?;

        let name = std::ffi::CString::new(pcie_address)
            .map_err(|e| DpuError::invalid_config(format!("Invalid PCIe address: {e}")))?;
        // SAFETY: name is NUL-terminated; the kernel returns a new fd or -1.
        let device_fd = unsafe { libc::ioctl(group.as_raw_fd(), ioctls::VFIO_GROUP_GET_DEVICE_FD as _, name.as_ptr()) };
        check_ret(device_fd, "get device fd")?;
        // SAFETY: device_fd >= 0 is a fresh fd owned by nobody else.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let mut dev_info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };
        // SAFETY: device fd from GET_DEVICE_FD; dev_info matches the kernel layout.
        let ret = unsafe { libc::ioctl(device.as_raw_fd(), ioctls::VFIO_DEVICE_GET_INFO as _, &raw mut dev_info) };
        check_ret(ret, "get device info")?;
        info!(
            "VFIO device {pcie_address}: {} regions, {} IRQs",
            dev_info.num_regions, dev_info.num_irqs
        );

        Ok(Self {
            pcie_address: pcie_address.to_string(),
            container: Arc::new(container),
            _group: group,
            device,
            num_regions: dev_info.num_regions,
        })
    }

    /// PCIe address
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// Device fd, for BAR mapping
    pub const fn device(&self) -> &File {
        &self.device
    }

    /// Container fd shared with every DMA buffer
    pub fn container(&self) -> Arc<File> {
        Arc::clone(&self.container)
    }

    /// Number of regions reported by the device
    pub const fn num_regions(&self) -> u32 {
        self.num_regions
    }
}

fn open_rw(path: &str) -> Result<File> {
    OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DpuError::device_not_found(path)
        } else {
            DpuError::hardware_error(format!("Cannot open {path}: {e}"))
        }
    })
}

fn check_ret(ret: i32, what: &str) -> Result<()> {
    if ret < 0 {
        return Err(DpuError::hardware_error(format!(
            "VFIO {what} failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// IOMMU group number of a PCIe device, from its sysfs `iommu_group` link.
///
/// # Errors
///
/// Returns `DeviceNotFound` if the link is missing (no IOMMU, or no device).
pub fn iommu_group(pcie_address: &str) -> Result<u32> {
    let link = format!("/sys/bus/pci/devices/{pcie_address}/iommu_group");
    let target = std::fs::read_link(&link).map_err(|_| DpuError::device_not_found(&link))?;
    target
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| DpuError::hardware_error(format!("Cannot parse IOMMU group from {}", target.display())))
}

/// Pinned host memory mapped into the device's IOVA space
#[derive(Debug)]
pub struct DmaBuffer {
    pages: HostPages,
    iova: u64,
    container: Arc<File>,
}

impl DmaBuffer {
    /// Allocate, lock and map at least `len` bytes at `iova`.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the memory cannot be allocated, locked
    /// or mapped. Nothing stays locked or mapped on failure.
    pub fn map(container: Arc<File>, len: usize, iova: u64) -> Result<Self> {
        let mut pages = HostPages::new(len)?;
        let size = pages.capacity();

        // SAFETY: [ptr, ptr + size) is exactly the HostPages allocation.
        unsafe { mlock(pages.as_mut_slice().as_mut_ptr().cast(), size) }
            .map_err(|e| DpuError::allocation_failure(format!("Failed to lock {size} bytes of DMA memory: {e}")))?;

        let dma_map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: pages.as_ptr() as u64,
            iova,
            size: size as u64,
        };
        debug!("DMA map: vaddr={:#x}, iova={iova:#x}, size={size:#x}", dma_map.vaddr);

        // SAFETY: container has a Type1v2 IOMMU set; dma_map describes locked
        // memory we own and matches the kernel layout.
        let ret = unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_IOMMU_MAP_DMA as _, &raw const dma_map) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            warn!("DMA map failed: {err}");
            // SAFETY: the range was locked above.
            let _ = unsafe { munlock(pages.as_mut_slice().as_mut_ptr().cast(), size) };
            return Err(DpuError::allocation_failure(format!("Failed to map DMA at {iova:#x}: {err}")));
        }

        Ok(Self { pages, iova, container })
    }

    /// Device-visible address
    pub const fn iova(&self) -> u64 {
        self.iova
    }

    /// Mapped size in bytes
    pub const fn size(&self) -> usize {
        self.pages.capacity()
    }

    /// Host view
    pub const fn as_slice(&self) -> &[u8] {
        self.pages.as_slice()
    }

    /// Mutable host view
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.pages.as_mut_slice()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let size = self.pages.capacity();
        let unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova: self.iova,
            size: size as u64,
        };
        // SAFETY: unmaps exactly the range mapped in map() before the pages
        // are unlocked and freed.
        let ret = unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const unmap,
            )
        };
        if ret < 0 {
            warn!("DMA unmap at {:#x} failed: {}", self.iova, std::io::Error::last_os_error());
        }
        // SAFETY: the range was locked in map().
        let _ = unsafe { munlock(self.pages.as_mut_slice().as_mut_ptr().cast(), size) };
        debug!("Freed DMA buffer at iova={:#x}", self.iova);
    }
}
