//! Controller configuration
//!
//! Plain typed values handed over by the collaborator that parses the model
//! description. Builders follow the `with_*` pattern; three environment
//! variables can override debugging switches at start-up:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `DPU_ENABLE_DUMP` | directory for debug dumps (`0` or empty disables) |
//! | `DPU_IP_LATENCY` | non-zero reports the hardware cycle counter |
//! | `DPU_FINGERPRINT_CHECK` | `0` disables the hardware fingerprint check |

use crate::error::{DpuError, Result};
use crate::exec::WaitPolicy;
use crate::layout::{AugmentParams, InterleaveConfig, InterleaveMode, PaddingPolicy};
use crate::platform::BackendSelection;
use crate::program::{ProgramMode, TaskParameters};
use crate::shape::TensorShape;
use dpu_chip::geometry::DEFAULT_BATCH;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Dump directory override
pub const ENV_ENABLE_DUMP: &str = "DPU_ENABLE_DUMP";
/// Cycle counter reporting override
pub const ENV_IP_LATENCY: &str = "DPU_IP_LATENCY";
/// Fingerprint check override
pub const ENV_FINGERPRINT_CHECK: &str = "DPU_FINGERPRINT_CHECK";

/// Everything a [`Controller`](crate::Controller) needs besides the program image
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Platform to open
    pub backend: BackendSelection,
    /// PCIe address of the device (`DDDD:BB:DD.F`)
    pub pcie_address: String,
    /// Worker threads, one compute unit each
    pub workers: usize,
    /// Input tensor, batch dimension included
    pub input_shape: TensorShape,
    /// Output bytes per batch item in standard layout
    pub output_size: usize,
    /// Batch interleave settings
    pub interleave: InterleaveConfig,
    /// Channel augmentation of the first layer, when enabled
    pub augment: Option<AugmentParams>,
    /// Single-pool and DRU flags
    pub mode: ProgramMode,
    /// Static task parameters
    pub task: TaskParameters,
    /// Completion polling budget
    pub wait: WaitPolicy,
    /// Swap buffer size in bytes
    pub swap_size: usize,
    /// Debug dump directory
    pub dump_dir: Option<PathBuf>,
    /// Golden reference file
    pub golden_path: Option<PathBuf>,
    /// Version code the program was compiled for; `None` skips the check
    pub fingerprint: Option<u64>,
    /// Read the cycle counter after each pass
    pub report_cycles: bool,
    /// Fix point of the input tensor
    pub input_fix_point: i32,
    /// Fix point of the output tensor
    pub output_fix_point: i32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backend: BackendSelection::default(),
            pcie_address: String::new(),
            workers: 1,
            input_shape: TensorShape::int8(DEFAULT_BATCH, 1, 1, 16),
            output_size: 16,
            interleave: InterleaveConfig::default(),
            augment: None,
            mode: ProgramMode::default(),
            task: TaskParameters::default(),
            wait: WaitPolicy::default(),
            swap_size: 0,
            dump_dir: None,
            golden_path: None,
            fingerprint: None,
            report_cycles: false,
            input_fix_point: 0,
            output_fix_point: 0,
        }
    }
}

impl ControllerConfig {
    /// Configuration for an input shape and per-item output size
    pub fn new(input_shape: TensorShape, output_size: usize) -> Self {
        Self {
            input_shape,
            output_size,
            ..Self::default()
        }
    }

    /// Batch size
    pub const fn batch(&self) -> usize {
        self.input_shape.batch
    }

    /// Output bytes for the whole batch
    pub const fn output_len(&self) -> usize {
        self.output_size * self.input_shape.batch
    }

    /// Shape the interleaver sees: the augmented shape when augmentation is on
    pub fn interleave_shape(&self) -> TensorShape {
        self.augment
            .map_or(self.input_shape, |a| a.output_shape(&self.input_shape))
    }

    /// Select the platform
    #[must_use]
    pub fn with_backend(mut self, backend: BackendSelection, pcie_address: impl Into<String>) -> Self {
        self.backend = backend;
        self.pcie_address = pcie_address.into();
        self
    }

    /// Set the number of workers
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the batch size
    #[must_use]
    pub const fn with_batch(mut self, batch: usize) -> Self {
        self.input_shape = self.input_shape.with_batch(batch);
        self
    }

    /// Set the interleave mode
    #[must_use]
    pub const fn with_interleave_mode(mut self, mode: InterleaveMode) -> Self {
        self.interleave = self.interleave.with_mode(mode);
        self
    }

    /// Set the padding policy
    #[must_use]
    pub const fn with_padding(mut self, padding: PaddingPolicy) -> Self {
        self.interleave = self.interleave.with_padding(padding);
        self
    }

    /// Enable channel augmentation
    #[must_use]
    pub const fn with_augment(mut self, augment: AugmentParams) -> Self {
        self.augment = Some(augment);
        self
    }

    /// Set mode flags
    #[must_use]
    pub const fn with_mode(mut self, mode: ProgramMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set task parameters
    #[must_use]
    pub const fn with_task(mut self, task: TaskParameters) -> Self {
        self.task = task;
        self
    }

    /// Set the wait budget and interval
    #[must_use]
    pub const fn with_wait(mut self, budget: u32, interval: Duration) -> Self {
        self.wait = WaitPolicy { budget, interval };
        self
    }

    /// Set the swap buffer size
    #[must_use]
    pub const fn with_swap_size(mut self, swap_size: usize) -> Self {
        self.swap_size = swap_size;
        self
    }

    /// Write debug dumps into `dir`
    #[must_use]
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    /// Verify every pass against the golden file at `path`
    #[must_use]
    pub fn with_golden(mut self, path: impl Into<PathBuf>) -> Self {
        self.golden_path = Some(path.into());
        self
    }

    /// Check the hardware version code against `fingerprint`
    #[must_use]
    pub const fn with_fingerprint(mut self, fingerprint: u64) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Report the cycle counter after each pass
    #[must_use]
    pub const fn with_cycle_report(mut self, enabled: bool) -> Self {
        self.report_cycles = enabled;
        self
    }

    /// Set input and output fix points
    #[must_use]
    pub const fn with_fix_points(mut self, input: i32, output: i32) -> Self {
        self.input_fix_point = input;
        self.output_fix_point = output;
        self
    }

    /// Apply `DPU_ENABLE_DUMP`, `DPU_IP_LATENCY` and `DPU_FINGERPRINT_CHECK`
    /// from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_ENABLE_DUMP) {
            let dir = dir.trim();
            self.dump_dir = if dir.is_empty() || dir == "0" {
                None
            } else if dir == "1" {
                Some(PathBuf::from("dpu_dump"))
            } else {
                Some(PathBuf::from(dir))
            };
            debug!("{ENV_ENABLE_DUMP} -> {:?}", self.dump_dir);
        }
        if let Some(flag) = lookup(ENV_IP_LATENCY) {
            self.report_cycles = is_enabled(&flag);
        }
        if let Some(flag) = lookup(ENV_FINGERPRINT_CHECK) {
            if !is_enabled(&flag) {
                debug!("{ENV_FINGERPRINT_CHECK}=0, fingerprint check disabled");
                self.fingerprint = None;
            }
        }
        self
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero workers, batch sizes outside 1..=4
    /// in DRU mode, a zero output size or a zero augmentation kernel/stride.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DpuError::invalid_config("at least one worker required"));
        }
        if self.batch() == 0 || self.output_size == 0 {
            return Err(DpuError::invalid_config(format!(
                "batch ({}) and output size ({}) must be non-zero",
                self.batch(),
                self.output_size
            )));
        }
        if self.mode.dru && self.batch() > DEFAULT_BATCH {
            return Err(DpuError::invalid_config(format!(
                "DRU input pack supports at most {DEFAULT_BATCH} batch items, got {}",
                self.batch()
            )));
        }
        if let Some(a) = self.augment {
            if a.kernel_width == 0 || a.stride_width == 0 {
                return Err(DpuError::invalid_config("augmentation kernel and stride must be non-zero"));
            }
        }
        if self.wait.budget == 0 {
            return Err(DpuError::invalid_config("wait budget must be non-zero"));
        }
        Ok(())
    }
}

fn is_enabled(flag: &str) -> bool {
    !matches!(flag.trim(), "" | "0" | "false" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_hardware_conventions() {
        let config = ControllerConfig::default();
        assert_eq!(config.batch(), 4);
        assert_eq!(config.wait.budget, 15);
        assert_eq!(config.wait.interval, Duration::from_millis(1000));
        assert_eq!(config.interleave.parallelism, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let config = ControllerConfig::default()
            .with_fingerprint(0xABCD)
            .with_overrides_from(env(&[
                (ENV_ENABLE_DUMP, "/tmp/dpu"),
                (ENV_IP_LATENCY, "1"),
                (ENV_FINGERPRINT_CHECK, "0"),
            ]));
        assert_eq!(config.dump_dir, Some(PathBuf::from("/tmp/dpu")));
        assert!(config.report_cycles);
        assert_eq!(config.fingerprint, None);
    }

    #[test]
    fn absent_env_leaves_config_alone() {
        let config = ControllerConfig::default()
            .with_fingerprint(7)
            .with_dump_dir("out")
            .with_overrides_from(env(&[]));
        assert_eq!(config.fingerprint, Some(7));
        assert_eq!(config.dump_dir, Some(PathBuf::from("out")));

        let disabled = config.with_overrides_from(env(&[(ENV_ENABLE_DUMP, "0")]));
        assert_eq!(disabled.dump_dir, None);
    }

    #[test]
    fn augmented_shape_feeds_interleave() {
        let config = ControllerConfig::new(TensorShape::int8(4, 2, 8, 3), 64).with_augment(AugmentParams::new(3, 2, 1));
        let shape = config.interleave_shape();
        assert_eq!((shape.width, shape.channels), (4, 9));
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(ControllerConfig::default().with_workers(0).validate().is_err());
        assert!(ControllerConfig::default().with_batch(0).validate().is_err());
        let dru = ControllerConfig::default().with_batch(8).with_mode(ProgramMode {
            single_pool: false,
            dru: true,
        });
        assert!(matches!(dru.validate(), Err(DpuError::InvalidConfig { .. })));
        let aug = ControllerConfig::default().with_augment(AugmentParams::new(3, 0, 0));
        assert!(aug.validate().is_err());
    }
}
