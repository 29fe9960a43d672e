//! Controller: the full per-call inference flow.
//!
//! ```text
//! standard input ─▶ [augment] ─▶ interleave ─▶ upload
//! standard input ─▶ DRU pack ─▶ upload            (DRU mode)
//!     ─▶ address table ─▶ write list ─▶ worker: submit/wait
//!     ─▶ download result ─▶ output reorg ─▶ [golden compare]
//! ```
//!
//! The program image (instructions and optional parameters) is uploaded once
//! at construction. Every call allocates its own swap, DRU and result
//! buffers, registers them under a per-call name and releases them when the
//! call returns, on success or failure.

use crate::buffer::{BufferRole, DeviceBuffer};
use crate::config::ControllerConfig;
use crate::dump::DebugDump;
use crate::error::{DpuError, Result};
use crate::exec::ExecReport;
use crate::golden::{ComparisonReport, GoldenReference};
use crate::layout::{batch_interleave, channel_augment, dru_pack, output_reorg};
use crate::platform::{select_platform, Platform};
use crate::pool::WorkerPool;
use crate::program::{build_write_list, AddressTable};
use crate::quant::{fix_to_float, float_to_fix};
use crate::registry::{BufferHandle, BufferRegistry};
use crate::shape::validate_size_table;
use bytes::Bytes;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Compiled program: instruction stream plus optional parameter image
#[derive(Debug, Clone, Default)]
pub struct ProgramImage {
    /// Instruction stream
    pub instructions: Bytes,
    /// Weights and biases; `None` in single-pool mode
    pub params: Option<Bytes>,
}

impl ProgramImage {
    /// Image with instructions and parameters
    pub fn new(instructions: impl Into<Bytes>, params: impl Into<Bytes>) -> Self {
        Self {
            instructions: instructions.into(),
            params: Some(params.into()),
        }
    }

    /// Single-pool image: parameters live in the instruction stream
    pub fn single_pool(instructions: impl Into<Bytes>) -> Self {
        Self {
            instructions: instructions.into(),
            params: None,
        }
    }
}

/// Result of one pass
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Output in standard NHWC layout
    pub output: Bytes,
    /// Raw hardware-layout result
    pub board: Bytes,
    /// Golden comparison, when a reference is configured
    pub report: Option<ComparisonReport>,
    /// Execution details
    pub exec: ExecReport,
}

fn lock(handle: &BufferHandle) -> Result<MutexGuard<'_, DeviceBuffer>> {
    handle
        .lock()
        .map_err(|_| DpuError::invalid_state("device buffer lock poisoned"))
}

/// Per-call buffers; released from the registry on drop
struct RunBuffers<'a> {
    registry: &'a BufferRegistry,
    prefix: String,
    names: Vec<String>,
}

impl<'a> RunBuffers<'a> {
    fn new(registry: &'a BufferRegistry, run: u64) -> Self {
        Self {
            registry,
            prefix: format!("run{run}"),
            names: Vec::new(),
        }
    }

    fn allocate(&mut self, platform: &dyn Platform, len: usize, role: BufferRole) -> Result<BufferHandle> {
        let buffer = DeviceBuffer::allocate_bytes(platform, len, role)?;
        let name = format!("{}/{role}", self.prefix);
        let (_, handle) = self.registry.register(name.clone(), buffer)?;
        self.names.push(name);
        Ok(handle)
    }
}

impl Drop for RunBuffers<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            if let Err(e) = self.registry.release(name) {
                warn!("Failed to release {name}: {e}");
            }
        }
    }
}

/// DPU controller
#[derive(Debug)]
pub struct Controller {
    config: ControllerConfig,
    platform: Arc<dyn Platform>,
    pool: WorkerPool,
    registry: BufferRegistry,
    instructions: BufferHandle,
    params: Option<BufferHandle>,
    golden: Option<GoldenReference>,
    dump: Option<DebugDump>,
    hardware_fingerprint: Option<u64>,
    next_run: AtomicU64,
}

impl Controller {
    /// Open the platform named by `config.backend` and build a controller.
    ///
    /// # Errors
    ///
    /// Returns any error of [`select_platform`] or [`Controller::new`].
    pub fn open(config: ControllerConfig, program: &ProgramImage) -> Result<Self> {
        let platform = select_platform(config.backend, &config.pcie_address)?;
        Self::new(platform, config, program)
    }

    /// Build a controller on `platform`.
    ///
    /// Starts the workers, checks the hardware fingerprint, uploads the
    /// program image and loads the golden reference.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an inconsistent configuration or a
    /// missing parameter image outside single-pool mode,
    /// `FingerprintMismatch` if the hardware version differs, and any
    /// allocation, transfer or I/O error.
    pub fn new(platform: Arc<dyn Platform>, config: ControllerConfig, program: &ProgramImage) -> Result<Self> {
        validate_size_table()?;
        config.validate()?;
        info!(
            "Creating controller: {} worker(s), input {}, output {} bytes/item, {} platform",
            config.workers,
            config.input_shape,
            config.output_size,
            platform.backend_type()
        );

        let pool = WorkerPool::new(platform.as_ref(), config.workers)?;

        let hardware_fingerprint = match config.fingerprint {
            Some(expected) => {
                let actual = pool.execute(|engine| engine.read_fingerprint())?;
                if actual != expected {
                    error!("Fingerprint mismatch: expected {expected:#018x}, hardware {actual:#018x}");
                    return Err(DpuError::FingerprintMismatch { expected, actual });
                }
                debug!("Fingerprint {actual:#018x} verified");
                Some(actual)
            }
            None => None,
        };

        let dump = config.dump_dir.as_ref().map(DebugDump::create).transpose()?;

        let registry = BufferRegistry::new();
        let instructions = upload_image(
            &registry,
            platform.as_ref(),
            "program/instructions",
            BufferRole::Instruction,
            &program.instructions,
        )?;
        let params = if config.mode.single_pool {
            None
        } else {
            let data = program.params.as_ref().ok_or_else(|| {
                DpuError::invalid_config("parameter image required outside single-pool mode")
            })?;
            if let Some(dump) = &dump {
                dump.params(data)?;
            }
            Some(upload_image(
                &registry,
                platform.as_ref(),
                "program/params",
                BufferRole::Params,
                data,
            )?)
        };

        let golden = config.golden_path.as_ref().map(GoldenReference::load).transpose()?;
        if let (Some(dump), Some(golden)) = (&dump, &golden) {
            dump.golden(golden)?;
        }

        Ok(Self {
            config,
            platform,
            pool,
            registry,
            instructions,
            params,
            golden,
            dump,
            hardware_fingerprint,
            next_run: AtomicU64::new(0),
        })
    }

    /// Active configuration
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Version code read at construction, when checked
    pub const fn hardware_fingerprint(&self) -> Option<u64> {
        self.hardware_fingerprint
    }

    /// Buffers currently owned by the registry
    pub fn live_buffers(&self) -> usize {
        self.registry.len()
    }

    /// Replace the golden reference used by later passes
    pub fn set_golden(&mut self, golden: Option<GoldenReference>) {
        self.golden = golden;
    }

    /// Run one pass on a standard-layout int8 input.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `input` does not match the configured
    /// shape, `ExecutionTimeout` if the device does not complete,
    /// `GoldenSizeMismatch` if the output and reference differ in length,
    /// and any allocation or transfer error.
    pub fn run(&self, input: &[u8]) -> Result<RunOutput> {
        let start = Instant::now();
        let config = &self.config;
        let shape = config.input_shape;
        shape.validate_buffer("controller input", input.len())?;
        let batch = config.batch();
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        debug!("Run {run_id}: {} input bytes", input.len());

        if let Some(dump) = &self.dump {
            dump.input(input)?;
        }

        let mut buffers = RunBuffers::new(&self.registry, run_id);
        let platform = self.platform.as_ref();
        let mut table = AddressTable::new();
        table.set(BufferRole::Instruction, lock(&self.instructions)?.physical_address());
        if let Some(params) = &self.params {
            table.set(BufferRole::Params, lock(params)?.physical_address());
        }

        let hw_len = config.interleave.output_len(&config.interleave_shape());
        let dru_dst = buffers.allocate(platform, hw_len, BufferRole::DruDst)?;
        if config.mode.dru {
            // the DRU applies the kernel/stride window itself through KW/SW
            if let Some(dump) = &self.dump {
                dump.input_std(input, false)?;
            }
            let packed = dru_pack(input, batch)?;
            let dru_src = buffers.allocate(platform, packed.len(), BufferRole::DruSrc)?;
            let mut src = lock(&dru_src)?;
            src.write(&packed)?;
            table.set(BufferRole::DruSrc, src.physical_address());
        } else {
            let (staged, staged_shape) = match config.augment {
                Some(params) => {
                    let (data, augmented) = channel_augment(input, &shape, &params)?;
                    (Cow::Owned(data), augmented)
                }
                None => (Cow::Borrowed(input), shape),
            };
            if let Some(dump) = &self.dump {
                dump.input_std(&staged, config.augment.is_some())?;
            }
            let hw = batch_interleave(&staged, &staged_shape, &config.interleave)?;
            if let Some(dump) = &self.dump {
                dump.interleaved(&hw)?;
            }
            lock(&dru_dst)?.write(&hw)?;
        }
        table.set(BufferRole::DruDst, lock(&dru_dst)?.physical_address());

        let swap = buffers.allocate(platform, config.swap_size, BufferRole::Swap)?;
        table.set(BufferRole::Swap, lock(&swap)?.physical_address());
        let result = buffers.allocate(platform, config.output_len(), BufferRole::Result)?;
        table.set(BufferRole::Result, lock(&result)?.physical_address());
        table.fill_transfer_roles(config.mode.dru)?;

        let writes = build_write_list(&table, &config.task, config.mode)?;
        if let Some(dump) = &self.dump {
            dump.registers(&writes)?;
        }

        let policy = config.wait;
        let report_cycles = config.report_cycles;
        let exec = self
            .pool
            .execute(move |engine| engine.run(&writes, policy, report_cycles))?;

        let board = lock(&result)?.read()?.to_vec();
        let output = output_reorg(&board, config.output_size, batch)?;
        if let Some(dump) = &self.dump {
            dump.outputs(&board, &output)?;
        }

        let report = match &self.golden {
            Some(golden) => {
                let report = golden.compare(&output)?;
                if let Some(dump) = &self.dump {
                    dump.comparison(&report)?;
                }
                info!("Run {run_id}: {}", report.summary());
                Some(report)
            }
            None => None,
        };

        drop(buffers);
        debug!(
            "Run {run_id} done in {:?} on CU {} ({} attempt(s))",
            start.elapsed(),
            exec.compute_unit,
            exec.attempts
        );
        Ok(RunOutput {
            output: Bytes::from(output),
            board: Bytes::from(board),
            report,
            exec,
        })
    }

    /// Run one pass on float input, converting through the configured fix
    /// points.
    ///
    /// # Errors
    ///
    /// Returns any error of [`run`](Self::run).
    pub fn run_f32(&self, input: &[f32]) -> Result<(Vec<f32>, RunOutput)> {
        let fixed = float_to_fix(input, self.config.input_fix_point);
        let out = self.run(&fixed)?;
        let values = fix_to_float(&out.output, self.config.output_fix_point);
        Ok((values, out))
    }
}

fn upload_image(
    registry: &BufferRegistry,
    platform: &dyn Platform,
    name: &str,
    role: BufferRole,
    data: &[u8],
) -> Result<BufferHandle> {
    let mut buffer = DeviceBuffer::allocate_bytes(platform, data.len(), role)?;
    buffer.write(data)?;
    info!(
        "Uploaded {role} image: {} bytes at {:#x}",
        data.len(),
        buffer.physical_address()
    );
    let (_, handle) = registry.register(name, buffer)?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Completion, SimulatedPlatform};
    use crate::shape::TensorShape;
    use std::time::Duration;

    fn loopback_config(h: usize, w: usize) -> ControllerConfig {
        ControllerConfig::new(TensorShape::int8(4, h, w, 16), h * w * 16).with_wait(15, Duration::from_millis(1))
    }

    fn program() -> ProgramImage {
        ProgramImage::new(vec![0xAAu8; 128], vec![0x55u8; 256])
    }

    fn input(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 256) as u8).collect()
    }

    #[test]
    fn loopback_round_trip_restores_input() {
        let platform = Arc::new(SimulatedPlatform::loopback());
        let controller = Controller::new(platform.clone(), loopback_config(2, 3), &program()).unwrap();
        let data = input(4 * 2 * 3 * 16);
        let out = controller.run(&data).unwrap();
        assert_eq!(out.output.as_ref(), data.as_slice());
        assert_eq!(out.exec.attempts, 1);
        assert_eq!(platform.log().packets.len(), 1);
    }

    #[test]
    fn per_call_buffers_are_released() {
        let platform = Arc::new(SimulatedPlatform::loopback());
        let controller = Controller::new(platform.clone(), loopback_config(1, 1), &program()).unwrap();
        assert_eq!(controller.live_buffers(), 2);
        controller.run(&input(64)).unwrap();
        assert_eq!(controller.live_buffers(), 2);
        assert_eq!(platform.memory().region_count(), 2);
    }

    #[test]
    fn buffers_released_after_timeout() {
        let platform = Arc::new(SimulatedPlatform::loopback().with_completion(Completion::Never));
        let config = loopback_config(1, 1).with_wait(3, Duration::from_millis(1));
        let controller = Controller::new(platform.clone(), config, &program()).unwrap();
        let err = controller.run(&input(64)).unwrap_err();
        assert!(matches!(err, DpuError::ExecutionTimeout { attempts: 3, .. }));
        assert_eq!(controller.live_buffers(), 2);
    }

    #[test]
    fn wrong_input_length_is_shape_mismatch() {
        let controller = Controller::new(Arc::new(SimulatedPlatform::loopback()), loopback_config(1, 1), &program()).unwrap();
        assert!(matches!(controller.run(&[0; 10]), Err(DpuError::ShapeMismatch { .. })));
    }

    #[test]
    fn fingerprint_mismatch_is_fatal() {
        let platform = Arc::new(SimulatedPlatform::loopback().with_version(0x11));
        let err = Controller::new(platform, loopback_config(1, 1).with_fingerprint(0x22), &program()).unwrap_err();
        assert!(matches!(
            err,
            DpuError::FingerprintMismatch {
                expected: 0x22,
                actual: 0x11
            }
        ));
    }

    #[test]
    fn fingerprint_match_is_recorded() {
        let platform = Arc::new(SimulatedPlatform::loopback().with_version(0x11));
        let controller = Controller::new(platform, loopback_config(1, 1).with_fingerprint(0x11), &program()).unwrap();
        assert_eq!(controller.hardware_fingerprint(), Some(0x11));
    }

    #[test]
    fn params_required_outside_single_pool() {
        let err = Controller::new(
            Arc::new(SimulatedPlatform::loopback()),
            loopback_config(1, 1),
            &ProgramImage::single_pool(vec![0u8; 16]),
        )
        .unwrap_err();
        assert!(matches!(err, DpuError::InvalidConfig { .. }));
    }

    #[test]
    fn golden_reference_is_checked() {
        let platform = Arc::new(SimulatedPlatform::loopback());
        let mut controller = Controller::new(platform, loopback_config(1, 1), &program()).unwrap();
        let data = input(64);

        controller.set_golden(Some(GoldenReference::from_bytes(data.clone())));
        let report = controller.run(&data).unwrap().report.unwrap();
        assert!(report.passed());

        let mut wrong = data.clone();
        wrong[5] ^= 1;
        controller.set_golden(Some(GoldenReference::from_bytes(wrong)));
        let report = controller.run(&data).unwrap().report.unwrap();
        assert_eq!(report.mismatch_count(), 1);

        controller.set_golden(Some(GoldenReference::from_bytes(vec![0u8; 3])));
        assert!(matches!(controller.run(&data), Err(DpuError::GoldenSizeMismatch { .. })));
    }

    #[test]
    fn f32_path_uses_fix_points() {
        let platform = Arc::new(SimulatedPlatform::loopback());
        let config = loopback_config(1, 1).with_fix_points(2, 2);
        let controller = Controller::new(platform, config, &program()).unwrap();
        let floats: Vec<f32> = (0..64).map(|i| (i % 8) as f32 * 0.25).collect();
        let (values, _) = controller.run_f32(&floats).unwrap();
        assert_eq!(values, floats);
    }
}
