//! Mapped-window platform
//!
//! Device memory is exposed through a BAR mapped from sysfs. Buffers are
//! carved out of that window by a first-fit allocator; the host works on a
//! page-aligned staging copy and migrates it explicitly, so `upload` and
//! `download` are blocking copies. The physical address of a buffer is its
//! offset inside the window. The first device page is never handed out so
//! that address 0 keeps meaning "no buffer".

use super::host::HostPages;
use crate::buffer::BufferBackend;
use crate::error::{DpuError, Result};
use crate::exec::CommandQueue;
use crate::mmio::{MappedRegion, MmioQueue, CONTROL_BAR, WINDOW_BAR};
use crate::platform::{BackendType, Platform};
use dpu_chip::geometry::DEVICE_PAGE;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// First-fit allocator over `[DEVICE_PAGE, size)` of the window
#[derive(Debug)]
pub struct WindowAllocator {
    size: usize,
    // offset -> length, page-rounded
    live: BTreeMap<usize, usize>,
}

impl WindowAllocator {
    /// Allocator for a window of `size` bytes
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            live: BTreeMap::new(),
        }
    }

    /// Reserve `len` bytes on a page boundary; returns the offset.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if no gap is large enough.
    pub fn reserve(&mut self, len: usize) -> Result<usize> {
        let span = len.max(1).div_ceil(DEVICE_PAGE) * DEVICE_PAGE;
        let mut cursor = DEVICE_PAGE;
        for (&offset, &used) in &self.live {
            if offset - cursor >= span {
                break;
            }
            cursor = offset + used;
        }
        if cursor + span > self.size {
            return Err(DpuError::allocation_failure(format!(
                "device window exhausted: need {span} bytes, window {} bytes, {} live buffers",
                self.size,
                self.live.len()
            )));
        }
        self.live.insert(cursor, span);
        Ok(cursor)
    }

    /// Return the block at `offset`
    pub fn release(&mut self, offset: usize) {
        if self.live.remove(&offset).is_none() {
            warn!("release of unknown window offset {offset:#x}");
        }
    }

    /// Bytes currently reserved
    pub fn used(&self) -> usize {
        self.live.values().sum()
    }
}

#[derive(Debug)]
struct Window {
    region: MappedRegion,
    allocator: Mutex<WindowAllocator>,
}

/// Platform over sysfs-mapped BARs
#[derive(Debug)]
pub struct MappedPlatform {
    pcie_address: String,
    control: Arc<MappedRegion>,
    window: Arc<Window>,
}

impl MappedPlatform {
    /// Map the control BAR and the memory window of `pcie_address`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the sysfs resources are missing.
    pub fn open(pcie_address: &str) -> Result<Self> {
        let control = Arc::new(MappedRegion::map_sysfs(pcie_address, CONTROL_BAR)?);
        let region = MappedRegion::map_sysfs(pcie_address, WINDOW_BAR)?;
        info!(
            "Mapped platform ready for {pcie_address}: window {} MB",
            region.size() / (1024 * 1024)
        );
        let allocator = Mutex::new(WindowAllocator::new(region.size()));
        Ok(Self {
            pcie_address: pcie_address.to_string(),
            control,
            window: Arc::new(Window { region, allocator }),
        })
    }

    /// PCIe address of the device
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }
}

impl Platform for MappedPlatform {
    fn allocate(&self, len: usize) -> Result<Box<dyn BufferBackend>> {
        let staging = HostPages::new(len)?;
        let offset = self
            .window
            .allocator
            .lock()
            .map_err(|_| DpuError::hardware_error("window allocator lock poisoned"))?
            .reserve(len)?;
        debug!("Window buffer: {len} bytes at {offset:#x}");
        Ok(Box::new(StagedBuffer {
            staging,
            len,
            offset,
            window: Arc::clone(&self.window),
        }))
    }

    fn open_queue(&self, worker: usize) -> Result<Box<dyn CommandQueue>> {
        let cu = u32::try_from(worker)
            .map_err(|_| DpuError::invalid_config(format!("worker index {worker} out of range")))?;
        Ok(Box::new(MmioQueue::new(Arc::clone(&self.control), cu)?))
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Mapped
    }
}

/// Host staging memory paired with a block of the device window
#[derive(Debug)]
pub struct StagedBuffer {
    staging: HostPages,
    len: usize,
    offset: usize,
    window: Arc<Window>,
}

impl BufferBackend for StagedBuffer {
    fn physical_address(&self) -> u64 {
        self.offset as u64
    }

    fn byte_size(&self) -> usize {
        self.len
    }

    fn host_slice(&self) -> &[u8] {
        &self.staging.as_slice()[..self.len]
    }

    fn host_slice_mut(&mut self) -> &mut [u8] {
        &mut self.staging.as_mut_slice()[..self.len]
    }

    fn upload(&mut self) -> Result<()> {
        trace!("Upload {} bytes to window {:#x}", self.len, self.offset);
        self.window
            .region
            .write_bytes(self.offset, &self.staging.as_slice()[..self.len])
    }

    fn download(&mut self) -> Result<()> {
        trace!("Download {} bytes from window {:#x}", self.len, self.offset);
        let len = self.len;
        self.window
            .region
            .read_bytes(self.offset, &mut self.staging.as_mut_slice()[..len])
    }

    fn kind(&self) -> BackendType {
        BackendType::Mapped
    }
}

impl Drop for StagedBuffer {
    fn drop(&mut self) {
        if let Ok(mut allocator) = self.window.allocator.lock() {
            allocator.release(self.offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_page_is_never_allocated() {
        let mut alloc = WindowAllocator::new(16 * DEVICE_PAGE);
        assert_eq!(alloc.reserve(1).unwrap(), DEVICE_PAGE);
    }

    #[test]
    fn freed_gaps_are_reused_first_fit() {
        let mut alloc = WindowAllocator::new(16 * DEVICE_PAGE);
        let a = alloc.reserve(DEVICE_PAGE).unwrap();
        let b = alloc.reserve(2 * DEVICE_PAGE).unwrap();
        let c = alloc.reserve(DEVICE_PAGE).unwrap();
        assert_eq!((a, b, c), (DEVICE_PAGE, 2 * DEVICE_PAGE, 4 * DEVICE_PAGE));

        alloc.release(b);
        assert_eq!(alloc.reserve(DEVICE_PAGE).unwrap(), b);
        // 3 pages no longer fit in the remaining 1-page gap
        assert_eq!(alloc.reserve(3 * DEVICE_PAGE).unwrap(), 5 * DEVICE_PAGE);
        assert_eq!(alloc.used(), 6 * DEVICE_PAGE);
    }

    #[test]
    fn exhaustion_is_allocation_failure() {
        let mut alloc = WindowAllocator::new(4 * DEVICE_PAGE);
        alloc.reserve(3 * DEVICE_PAGE).unwrap();
        assert!(matches!(alloc.reserve(1), Err(DpuError::AllocationFailure { .. })));
    }

    #[test]
    #[ignore] // Requires hardware
    fn staged_buffer_round_trips() {
        let addr = std::env::var("DPU_PCIE_ADDRESS").unwrap_or_else(|_| "0000:01:00.0".into());
        let platform = MappedPlatform::open(&addr).unwrap();
        let mut buf = platform.allocate(64).unwrap();
        buf.host_slice_mut().fill(0xA5);
        buf.upload().unwrap();
        buf.host_slice_mut().fill(0);
        buf.download().unwrap();
        assert!(buf.host_slice().iter().all(|&b| b == 0xA5));
    }
}
