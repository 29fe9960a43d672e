//! Platform implementations
//!
//! Three platforms available:
//! - **VFIO**: IOMMU-pinned DMA buffers, coherent, BAR0 command queues
//! - **Mapped**: sysfs-mapped device window, staged copies, BAR0 command queues
//! - **Simulated**: in-process address space and scheduler, no hardware

pub mod host;
pub mod mapped;
pub mod simulated;
pub mod vfio;

pub use host::HostPages;
pub use mapped::MappedPlatform;
pub use simulated::{Completion, SimLog, SimMemory, SimulatedPlatform};
pub use vfio::VfioPlatform;
