//! Device buffers
//!
//! A [`DeviceBuffer`] is page-aligned host memory bound to one physical
//! address on the device. The binding is provided by a [`BufferBackend`]:
//!
//! | Backend | Physical address | upload / download |
//! |---------|------------------|-------------------|
//! | pinned DMA (VFIO) | IOMMU mapping | no-op, coherent |
//! | mapped window | offset into the device BAR | blocking copy |
//! | simulated | simulator address space | copy into simulator memory |

use crate::error::{DpuError, Result};
use crate::platform::{BackendType, Platform};
use crate::shape::TensorShape;
use std::fmt;
use tracing::trace;

/// Role a buffer plays in one inference pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferRole {
    /// Compiled instruction stream
    Instruction,
    /// Weights and biases (absent in single-pool mode)
    Params,
    /// Intermediate activations
    Swap,
    /// DRU input, host-packed standard data
    DruSrc,
    /// DRU output, hardware layout
    DruDst,
    /// Source address register
    Src,
    /// Destination address register
    Dst,
    /// Hardware-layout result
    Result,
}

impl BufferRole {
    /// Every role, in address-table order
    pub const ALL: [Self; 8] = [
        Self::Instruction,
        Self::Params,
        Self::Swap,
        Self::DruSrc,
        Self::DruDst,
        Self::Src,
        Self::Dst,
        Self::Result,
    ];

    /// Short lower-case name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::Params => "params",
            Self::Swap => "swap",
            Self::DruSrc => "dru-src",
            Self::DruDst => "dru-dst",
            Self::Src => "src",
            Self::Dst => "dst",
            Self::Result => "result",
        }
    }
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability interface every buffer backend implements
pub trait BufferBackend: fmt::Debug + Send {
    /// Device-visible address of the first byte
    fn physical_address(&self) -> u64;

    /// Usable size in bytes
    fn byte_size(&self) -> usize;

    /// Host view of the buffer
    fn host_slice(&self) -> &[u8];

    /// Mutable host view of the buffer
    fn host_slice_mut(&mut self) -> &mut [u8];

    /// Make host writes visible to the device.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if the copy to the device fails.
    fn upload(&mut self) -> Result<()>;

    /// Make device writes visible to the host.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if the copy from the device fails.
    fn download(&mut self) -> Result<()>;

    /// Which backend produced the buffer
    fn kind(&self) -> BackendType;
}

/// Host-visible buffer bound to a device address
#[derive(Debug)]
pub struct DeviceBuffer {
    role: BufferRole,
    len: usize,
    backend: Box<dyn BufferBackend>,
}

impl DeviceBuffer {
    /// Allocate a buffer sized for `shape`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDataKind` if the element kind has no size entry
    /// and `AllocationFailure` if the platform cannot provide the memory.
    pub fn allocate(platform: &dyn Platform, shape: &TensorShape, role: BufferRole) -> Result<Self> {
        let len = shape.byte_len()?;
        Self::allocate_bytes(platform, len, role)
    }

    /// Allocate a raw buffer of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the platform cannot provide the memory.
    pub fn allocate_bytes(platform: &dyn Platform, len: usize, role: BufferRole) -> Result<Self> {
        let backend = platform.allocate(len)?;
        if backend.byte_size() < len {
            return Err(DpuError::allocation_failure(format!(
                "{role} buffer: backend returned {} bytes, need {len}",
                backend.byte_size()
            )));
        }
        trace!(
            "Allocated {role} buffer: {len} bytes at {:#x} ({})",
            backend.physical_address(),
            backend.kind()
        );
        Ok(Self { role, len, backend })
    }

    /// Role of the buffer
    pub const fn role(&self) -> BufferRole {
        self.role
    }

    /// Requested length in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is zero-length
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device-visible address
    pub fn physical_address(&self) -> u64 {
        self.backend.physical_address()
    }

    /// Backend that holds the memory
    pub fn kind(&self) -> BackendType {
        self.backend.kind()
    }

    /// Host view, limited to the requested length
    pub fn as_slice(&self) -> &[u8] {
        &self.backend.host_slice()[..self.len]
    }

    /// Mutable host view, limited to the requested length
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.backend.host_slice_mut()[..len]
    }

    /// Copy `data` to the start of the buffer and upload it.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `data` is longer than the buffer, or the
    /// backend's upload error.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(DpuError::shape_mismatch(
                format!("{} buffer write", self.role),
                self.len,
                data.len(),
            ));
        }
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
        self.backend.upload()
    }

    /// Upload the whole host view.
    ///
    /// # Errors
    ///
    /// Returns the backend's upload error.
    pub fn upload(&mut self) -> Result<()> {
        self.backend.upload()
    }

    /// Download and return the host view.
    ///
    /// # Errors
    ///
    /// Returns the backend's download error.
    pub fn read(&mut self) -> Result<&[u8]> {
        self.backend.download()?;
        Ok(self.as_slice())
    }
}
