//! Memory-mapped device regions and the register-level command queue.
//!
//! A [`MappedRegion`] is one PCIe BAR mapped into the process, either through
//! a VFIO device fd or through the sysfs `resource<N>` file. Every access is
//! bounds-checked and returns `TransferFailed` instead of panicking.
//!
//! [`MmioQueue`] drives one compute unit through BAR0: it replays the
//! packet's register writes into the unit's control block, sets
//! `AP_CONTROL.START` and polls `AP_CONTROL.DONE`.

// Volatile MMIO through raw pointers; BAR registers are 4-byte aligned.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{DpuError, Result};
use crate::exec::{CommandQueue, CommandState, ExecPacket};
use dpu_chip::regs;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// BAR holding the compute unit control blocks
pub const CONTROL_BAR: u32 = 0;
/// BAR exposing device memory for the staged window
pub const WINDOW_BAR: u32 = 2;

/// `VFIO_DEVICE_GET_REGION_INFO` = `_IO(';', 100 + 8)`
const VFIO_DEVICE_GET_REGION_INFO: libc::c_ulong = ((b';' as libc::c_ulong) << 8) | 108;

/// VFIO region info structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

/// Mapped BAR region
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    bar: u32,
    // Keeps the sysfs resource file open for the lifetime of the mapping.
    _file: Option<File>,
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("size", &format_args!("{:#x}", self.size))
            .field("bar", &self.bar)
            .finish()
    }
}

// SAFETY: the region owns its mapping; mmap'd memory is process-wide and
// stays valid when the owner moves between threads.
unsafe impl Send for MappedRegion {}

// SAFETY: every access is bounds-checked and volatile. Concurrent register
// accesses are serialized by the device, not by host memory ordering.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map BAR `bar` of a VFIO device.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError` if the region query or the mapping fails.
    pub fn map_vfio(device: &File, bar: u32) -> Result<Self> {
        let mut info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index: bar,
            ..Default::default()
        };

        // SAFETY: device is an open VFIO device fd; info is a correctly laid
        // out VfioRegionInfo with argsz and index set, which the kernel fills.
        let ret = unsafe { libc::ioctl(device.as_raw_fd(), VFIO_DEVICE_GET_REGION_INFO as _, &raw mut info) };
        if ret < 0 {
            return Err(DpuError::hardware_error(format!(
                "Failed to get BAR{bar} info: {}",
                std::io::Error::last_os_error()
            )));
        }
        debug!("BAR{bar}: size={:#x}, offset={:#x}, flags={:#x}", info.size, info.offset, info.flags);

        let size = usize::try_from(info.size)
            .map_err(|_| DpuError::hardware_error(format!("BAR{bar} size {:#x} exceeds address space", info.size)))?;
        let ptr = map_shared(device, size, info.offset, bar)?;
        info!("Mapped BAR{bar} at {ptr:p}, size={size:#x}");
        Ok(Self {
            ptr,
            size,
            bar,
            _file: None,
        })
    }

    /// Map BAR `bar` through `/sys/bus/pci/devices/<addr>/resource<bar>`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the resource file is missing and
    /// `HardwareError` if it cannot be mapped.
    pub fn map_sysfs(pcie_address: &str, bar: u32) -> Result<Self> {
        let path = format!("/sys/bus/pci/devices/{pcie_address}/resource{bar}");
        debug!("Mapping PCIe BAR: {path}");

        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DpuError::device_not_found(&path)
            } else {
                DpuError::hardware_error(format!("Cannot open {path}: {e}. Is the device enabled?"))
            }
        })?;
        let size = usize::try_from(file.metadata()?.len())
            .map_err(|_| DpuError::hardware_error(format!("{path} larger than the address space")))?;
        if size == 0 {
            return Err(DpuError::hardware_error(format!("{path} has size 0 (device not enabled?)")));
        }

        let ptr = map_shared(&file, size, 0, bar)?;
        info!("Mapped BAR{bar} for {pcie_address} ({} KB at {ptr:p})", size / 1024);
        Ok(Self {
            ptr,
            size,
            bar,
            _file: Some(file),
        })
    }

    fn check(&self, offset: usize, len: usize, op: &str) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DpuError::transfer_failed(format!(
                "Out of bounds {op} on BAR{}: offset={offset:#x}, size={len}, limit={:#x}",
                self.bar, self.size
            ))),
        }
    }

    /// Read a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if `offset + 4` exceeds the region.
    pub fn read32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4, "read")?;
        // SAFETY: offset + 4 <= size (checked); ptr is valid for size bytes
        // from mmap; register offsets are 4-byte aligned.
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        trace!("BAR{} read32 @ {offset:#x} = {value:#x}", self.bar);
        Ok(value)
    }

    /// Write a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if `offset + 4` exceeds the region.
    pub fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, 4, "write")?;
        trace!("BAR{} write32 @ {offset:#x} = {value:#x}", self.bar);
        // SAFETY: as in read32.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value) };
        Ok(())
    }

    /// Copy `buffer.len()` bytes out of the region.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if the range exceeds the region.
    pub fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        self.check(offset, buffer.len(), "read")?;
        // SAFETY: the source range lies inside the mapping (checked) and the
        // destination is a distinct host slice; u8 has alignment 1.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buffer.as_mut_ptr(), buffer.len()) };
        Ok(())
    }

    /// Copy `data` into the region.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if the range exceeds the region.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len(), "write")?;
        // SAFETY: as in read_bytes with source and destination swapped.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len()) };
        Ok(())
    }

    /// Region size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// BAR index
    pub const fn bar(&self) -> u32 {
        self.bar
    }
}

fn map_shared(fd: &impl AsFd, size: usize, offset: u64, bar: u32) -> Result<NonNull<u8>> {
    // SAFETY: fd is open for read/write and size is the kernel-reported
    // length of the region at offset. The mapping is released in Drop.
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            offset,
        )
    }
    .map_err(|e| DpuError::hardware_error(format!("Failed to mmap BAR{bar}: {e}")))?;
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| DpuError::hardware_error(format!("mmap of BAR{bar} returned null")))
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size are exactly those passed to mmap; Drop runs once.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::error!("munmap of BAR{} failed: {e}", self.bar);
        }
        debug!("Unmapped BAR{}", self.bar);
    }
}

/// Parameters for polling a status register
#[derive(Debug, Clone, Copy)]
struct PollConfig {
    reg: usize,
    done_mask: u32,
    deadline: Duration,
    yield_interval: u32,
}

/// Command queue that programs one compute unit directly through BAR0
#[derive(Debug)]
pub struct MmioQueue {
    control: Arc<MappedRegion>,
    cu: u32,
    base: usize,
    in_flight: bool,
}

impl MmioQueue {
    /// Queue for compute unit `cu`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the unit's control block lies outside BAR0.
    pub fn new(control: Arc<MappedRegion>, cu: u32) -> Result<Self> {
        let base = usize::try_from(cu)
            .ok()
            .and_then(|cu| cu.checked_mul(regs::CU_STRIDE))
            .filter(|&base| base + regs::CU_REGISTER_SPAN <= control.size())
            .ok_or_else(|| {
                DpuError::invalid_config(format!(
                    "compute unit {cu} outside BAR{} ({:#x} bytes)",
                    control.bar(),
                    control.size()
                ))
            })?;
        Ok(Self {
            control,
            cu,
            base,
            in_flight: false,
        })
    }

    /// Poll until `done_mask` is set or the deadline passes. Returns whether
    /// the bit was seen.
    fn poll_register(&self, cfg: PollConfig) -> Result<bool> {
        let PollConfig {
            reg,
            done_mask,
            deadline,
            yield_interval,
        } = cfg;
        let start = Instant::now();
        let mut polls = 0u32;
        loop {
            if self.control.read32(self.base + reg)? & done_mask != 0 {
                trace!("CU {}: done after {polls} polls", self.cu);
                return Ok(true);
            }
            if start.elapsed() >= deadline {
                return Ok(false);
            }
            polls = polls.wrapping_add(1);
            if polls % yield_interval == 0 {
                std::thread::yield_now();
            }
        }
    }
}

impl CommandQueue for MmioQueue {
    fn compute_unit(&self) -> u32 {
        self.cu
    }

    fn execute(&mut self, packet: &ExecPacket) -> Result<()> {
        if packet.cu_mask() & (1 << (self.cu % 32)) == 0 {
            return Err(DpuError::hardware_error(format!(
                "packet mask {:#x} does not select CU {}",
                packet.cu_mask(),
                self.cu
            )));
        }
        for (offset, value) in packet.pairs() {
            self.control.write32(self.base + offset as usize, value)?;
        }
        self.control.write32(self.base + regs::AP_CONTROL, regs::ap::START)?;
        self.in_flight = true;
        debug!("CU {}: started with {} register writes", self.cu, packet.pairs().count());
        Ok(())
    }

    fn wait(&mut self, interval: Duration) -> Result<CommandState> {
        if !self.in_flight {
            return Err(DpuError::invalid_state(format!("CU {} has nothing to wait for", self.cu)));
        }
        let done = self.poll_register(PollConfig {
            reg: regs::AP_CONTROL,
            done_mask: regs::ap::DONE,
            deadline: interval,
            yield_interval: 1_000,
        })?;
        if done {
            self.in_flight = false;
            Ok(CommandState::Completed)
        } else {
            Ok(CommandState::Running)
        }
    }

    fn read_register(&self, offset: usize) -> Result<u32> {
        if offset + 4 > regs::CU_REGISTER_SPAN {
            return Err(DpuError::transfer_failed(format!(
                "register {offset:#x} outside the CU {} control block",
                self.cu
            )));
        }
        self.control.read32(self.base + offset)
    }
}
