//! Host runtime for the DPU inference accelerator.
//!
//! Converts standard NHWC int8 tensors into the accelerator's
//! channel-parallel layout, places buffers in device-visible memory,
//! programs the compute unit's registers and runs each pass to completion.
//!
//! # Platform hierarchy
//!
//! ```text
//! Primary (no kernel module required):
//!   VfioPlatform      : VFIO/IOMMU, pinned DMA buffers
//!
//! Fallback:
//!   MappedPlatform    : sysfs BAR mapping, buffers staged through a device window
//!
//! Development / CI:
//!   SimulatedPlatform : in-process device memory and scheduler
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use dpu_driver::{Controller, ControllerConfig, ProgramImage, TensorShape};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControllerConfig::new(TensorShape::int8(4, 8, 8, 16), 8 * 8 * 16)
//!     .with_golden("golden.bin")
//!     .with_env_overrides();
//! let program = ProgramImage::new(std::fs::read("instr.bin")?, std::fs::read("params.bin")?);
//! let controller = Controller::open(config, &program)?;
//!
//! let input = std::fs::read("input.bin")?;
//! let out = controller.run(&input)?;
//! if let Some(report) = &out.report {
//!     println!("{report}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Module map
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`layout`] | augment, interleave, DRU pack, output reorg, dmem encode |
//! | [`program`] | address table and register write list |
//! | [`exec`] | exec-write packet, submit/wait engine |
//! | [`backends`] | VFIO, mapped and simulated platforms |
//! | [`controller`] | per-call inference flow |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod buffer;
mod config;
pub mod controller;
pub mod dump;
mod error;
pub mod exec;
pub mod golden;
pub mod layout;
pub mod mmio;
mod platform;
mod pool;
pub mod program;
pub mod quant;
mod registry;
mod shape;
pub mod vfio;

/// Silicon constants (re-exported from dpu-chip).
pub mod chip {
    pub use dpu_chip::{ert, geometry, regs};
}

pub use buffer::{BufferBackend, BufferRole, DeviceBuffer};
pub use config::{ControllerConfig, ENV_ENABLE_DUMP, ENV_FINGERPRINT_CHECK, ENV_IP_LATENCY};
pub use controller::{Controller, ProgramImage, RunOutput};
pub use dump::DebugDump;
pub use error::{DpuError, Result};
pub use exec::{CommandQueue, CommandState, EngineState, ExecPacket, ExecReport, ExecutionEngine, StageCounters, WaitPolicy};
pub use golden::{ComparisonReport, GoldenReference, Mismatch};
pub use platform::{select_platform, BackendSelection, BackendType, Platform};
pub use pool::WorkerPool;
pub use program::{build_write_list, AddressTable, ProgramMode, RegisterWrite, RegisterWriteList, TaskParameters};
pub use registry::{BufferHandle, BufferId, BufferRegistry};
pub use shape::{validate_size_table, DataKind, TensorShape};

/// Commonly used types.
pub mod prelude {
    pub use crate::layout::{AugmentParams, InterleaveConfig, InterleaveMode, PaddingPolicy};
    pub use crate::{
        BackendSelection, ComparisonReport, Controller, ControllerConfig, DpuError, GoldenReference, ProgramImage,
        ProgramMode, Result, RunOutput, TaskParameters, TensorShape,
    };
}
