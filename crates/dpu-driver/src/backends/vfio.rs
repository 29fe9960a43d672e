//! VFIO platform: pinned DMA buffers and direct BAR0 command queues.

use crate::buffer::BufferBackend;
use crate::error::{DpuError, Result};
use crate::exec::CommandQueue;
use crate::mmio::{MappedRegion, MmioQueue, CONTROL_BAR};
use crate::platform::{BackendType, Platform};
use crate::vfio::{DmaBuffer, VfioDevice};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// First IOVA handed out (256 MiB)
const IOVA_BASE: u64 = 0x1000_0000;

/// Platform over a `vfio-pci` bound device
#[derive(Debug)]
pub struct VfioPlatform {
    device: VfioDevice,
    control: Arc<MappedRegion>,
    next_iova: AtomicU64,
}

impl VfioPlatform {
    /// Open the device and map its control BAR.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` or `HardwareError` from the VFIO handshake
    /// or the BAR mapping.
    pub fn open(pcie_address: &str) -> Result<Self> {
        let device = VfioDevice::open(pcie_address)?;
        let control = Arc::new(MappedRegion::map_vfio(device.device(), CONTROL_BAR)?);
        info!(
            "VFIO platform ready for {pcie_address}: BAR{CONTROL_BAR} {} KB",
            control.size() / 1024
        );
        Ok(Self {
            device,
            control,
            next_iova: AtomicU64::new(IOVA_BASE),
        })
    }

    /// PCIe address of the device
    pub fn pcie_address(&self) -> &str {
        self.device.pcie_address()
    }
}

impl Platform for VfioPlatform {
    fn allocate(&self, len: usize) -> Result<Box<dyn BufferBackend>> {
        let page = rustix::param::page_size() as u64;
        let span = (len.max(1) as u64).div_ceil(page) * page;
        let iova = self.next_iova.fetch_add(span, Ordering::Relaxed);
        let dma = DmaBuffer::map(self.device.container(), len, iova)?;
        debug!("Pinned {len} bytes at iova {iova:#x}");
        Ok(Box::new(PinnedBuffer { dma, len }))
    }

    fn open_queue(&self, worker: usize) -> Result<Box<dyn CommandQueue>> {
        let cu = u32::try_from(worker)
            .map_err(|_| DpuError::invalid_config(format!("worker index {worker} out of range")))?;
        Ok(Box::new(MmioQueue::new(Arc::clone(&self.control), cu)?))
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Vfio
    }
}

/// Coherent IOMMU-mapped buffer
#[derive(Debug)]
pub struct PinnedBuffer {
    dma: DmaBuffer,
    len: usize,
}

impl BufferBackend for PinnedBuffer {
    fn physical_address(&self) -> u64 {
        self.dma.iova()
    }

    fn byte_size(&self) -> usize {
        self.len
    }

    fn host_slice(&self) -> &[u8] {
        &self.dma.as_slice()[..self.len]
    }

    fn host_slice_mut(&mut self) -> &mut [u8] {
        &mut self.dma.as_mut_slice()[..self.len]
    }

    fn upload(&mut self) -> Result<()> {
        Ok(())
    }

    fn download(&mut self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> BackendType {
        BackendType::Vfio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires hardware
    fn pinned_buffers_get_distinct_iovas() {
        let addr = std::env::var("DPU_PCIE_ADDRESS").unwrap_or_else(|_| "0000:01:00.0".into());
        let platform = VfioPlatform::open(&addr).unwrap();
        let a = platform.allocate(100).unwrap();
        let b = platform.allocate(100).unwrap();
        assert_eq!(a.physical_address(), IOVA_BASE);
        assert!(b.physical_address() > a.physical_address());
        assert_eq!(a.kind(), BackendType::Vfio);
    }
}
