//! Platform abstraction: where buffers live and how commands reach the
//! compute units.
//!
//! A [`Platform`] is chosen once by configuration and shared by the
//! controller. It hands out [`BufferBackend`]s and one [`CommandQueue`] per
//! worker; queues are never shared between workers.

use crate::buffer::BufferBackend;
use crate::error::{DpuError, Result};
use crate::exec::CommandQueue;
use std::fmt::{self, Debug};
use std::str::FromStr;
use std::sync::Arc;

/// Device platform: buffer allocation plus per-worker command queues
pub trait Platform: Debug + Send + Sync {
    /// Allocate a page-aligned device-visible buffer of at least `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if host or device memory is exhausted.
    fn allocate(&self, len: usize) -> Result<Box<dyn BufferBackend>>;

    /// Open the execution context for worker `worker`.
    ///
    /// Called once per worker at controller construction.
    ///
    /// # Errors
    ///
    /// Returns an error if the compute unit for `worker` cannot be reached.
    fn open_queue(&self, worker: usize) -> Result<Box<dyn CommandQueue>>;

    /// Backend type for logging
    fn backend_type(&self) -> BackendType;
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// VFIO with IOMMU-pinned DMA buffers
    Vfio,
    /// sysfs BAR mapping with a staged device window
    Mapped,
    /// In-process simulator, no hardware required
    Simulated,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vfio => write!(f, "VFIO"),
            Self::Mapped => write!(f, "Mapped"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// VFIO first, then the mapped window
    #[default]
    Auto,
    /// Force VFIO (pinned DMA)
    Vfio,
    /// Force the mapped window
    Mapped,
    /// Force the simulator, for CI and host-only development
    Simulated,
}

impl FromStr for BackendSelection {
    type Err = DpuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "vfio" => Ok(Self::Vfio),
            "mapped" => Ok(Self::Mapped),
            "sim" | "simulated" => Ok(Self::Simulated),
            other => Err(DpuError::invalid_config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Open the platform named by `selection` for the device at `pcie_address`.
///
/// # Errors
///
/// Returns an error if no suitable platform can be opened.
pub fn select_platform(selection: BackendSelection, pcie_address: &str) -> Result<Arc<dyn Platform>> {
    use crate::backends::{MappedPlatform, SimulatedPlatform, VfioPlatform};

    match selection {
        BackendSelection::Auto => {
            match VfioPlatform::open(pcie_address) {
                Ok(platform) => {
                    tracing::info!("Using VFIO platform for {pcie_address}");
                    return Ok(Arc::new(platform));
                }
                Err(e) => tracing::debug!("VFIO unavailable for {pcie_address}: {e}"),
            }
            tracing::info!("VFIO unavailable, using mapped window for {pcie_address}");
            MappedPlatform::open(pcie_address).map(|p| Arc::new(p) as Arc<dyn Platform>)
        }
        BackendSelection::Vfio => VfioPlatform::open(pcie_address).map(|p| Arc::new(p) as Arc<dyn Platform>),
        BackendSelection::Mapped => {
            MappedPlatform::open(pcie_address).map(|p| Arc::new(p) as Arc<dyn Platform>)
        }
        BackendSelection::Simulated => Ok(Arc::new(SimulatedPlatform::loopback())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_selection_needs_no_hardware() {
        let platform = select_platform(BackendSelection::Simulated, "").unwrap();
        assert_eq!(platform.backend_type(), BackendType::Simulated);
    }

    #[test]
    fn selection_parses() {
        assert_eq!("sim".parse::<BackendSelection>().unwrap(), BackendSelection::Simulated);
        assert_eq!("VFIO".parse::<BackendSelection>().unwrap(), BackendSelection::Vfio);
        assert!("kernel".parse::<BackendSelection>().is_err());
    }
}
