//! Execution engine
//!
//! One engine per worker. It owns that worker's [`CommandQueue`] and drives a
//! single command at a time:
//!
//! ```text
//! Idle ──submit──▶ Submitted ──wait──▶ Completed
//!                            └─budget exhausted─▶ TimedOut ──reset──▶ Idle
//! ```
//!
//! On timeout every stage counter is read exactly once and returned inside
//! [`DpuError::ExecutionTimeout`]. The engine never re-submits, and a
//! timed-out engine refuses new commands until it is reset.

use crate::error::{DpuError, Result};
use crate::program::RegisterWriteList;
use dpu_chip::{ert, regs};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Command lifecycle as reported by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Built, not yet seen
    New,
    /// Queued
    Queued,
    /// Running on a compute unit
    Running,
    /// Finished
    Completed,
    /// Scheduler error
    Error,
    /// Aborted
    Abort,
}

impl CommandState {
    /// Decode the packet header state field
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            ert::state::NEW => Some(Self::New),
            ert::state::QUEUED => Some(Self::Queued),
            ert::state::RUNNING => Some(Self::Running),
            ert::state::COMPLETED => Some(Self::Completed),
            ert::state::ERROR => Some(Self::Error),
            ert::state::ABORT => Some(Self::Abort),
            _ => None,
        }
    }

    /// Header encoding
    pub const fn raw(self) -> u32 {
        match self {
            Self::New => ert::state::NEW,
            Self::Queued => ert::state::QUEUED,
            Self::Running => ert::state::RUNNING,
            Self::Completed => ert::state::COMPLETED,
            Self::Error => ert::state::ERROR,
            Self::Abort => ert::state::ABORT,
        }
    }
}

/// Exec-write command packet
///
/// Header, compute unit mask, six reserved words, then `(offset, value)`
/// pairs for every register write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPacket {
    words: Vec<u32>,
}

impl ExecPacket {
    const PAIRS_START: usize = 2 + ert::RESERVED_WORDS;

    /// Encode `writes` for the compute units in `cu_mask`, state `New`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the payload overflows the header count
    /// field.
    pub fn exec_write(cu_mask: u32, writes: &RegisterWriteList) -> Result<Self> {
        let payload = 1 + ert::RESERVED_WORDS + 2 * writes.len();
        let count = u32::try_from(payload)
            .ok()
            .filter(|&c| c <= ert::MAX_COUNT)
            .ok_or_else(|| {
                DpuError::invalid_config(format!(
                    "{} register writes exceed the command packet ({} words max)",
                    writes.len(),
                    ert::MAX_COUNT
                ))
            })?;

        let mut words = Vec::with_capacity(1 + payload);
        words.push(ert::pack_header(
            ert::state::NEW,
            false,
            count,
            ert::OPCODE_EXEC_WRITE,
            ert::TYPE_CTRL,
        ));
        words.push(cu_mask);
        words.extend([0u32; ert::RESERVED_WORDS]);
        for (offset, value) in writes.pairs() {
            words.push(offset);
            words.push(value);
        }
        Ok(Self { words })
    }

    /// Raw packet words
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// State field of the header
    pub fn state(&self) -> Option<CommandState> {
        CommandState::from_raw(ert::header_state(self.words[0]))
    }

    /// Words following the header
    pub fn count(&self) -> u32 {
        ert::header_count(self.words[0])
    }

    /// Opcode field of the header
    pub fn opcode(&self) -> u32 {
        (self.words[0] >> ert::header::OPCODE_SHIFT) & 0x1F
    }

    /// Compute unit mask
    pub fn cu_mask(&self) -> u32 {
        self.words[1]
    }

    /// Register writes carried by the packet
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.words[Self::PAIRS_START..]
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
    }

    /// Value last written at `offset`
    pub fn value_at(&self, offset: usize) -> Option<u32> {
        self.pairs()
            .filter(|&(o, _)| o as usize == offset)
            .last()
            .map(|(_, v)| v)
    }

    /// 64-bit address carried for the block at `block`
    pub fn address_at(&self, block: usize) -> Option<u64> {
        let lo = self.value_at(block)?;
        let hi = self.value_at(block + regs::BLOCK_HI_OFFSET)?;
        Some((u64::from(hi) << 32) | u64::from(lo))
    }
}

/// Stage counters read after a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageCounters {
    /// Load stage start
    pub load_start: u32,
    /// Load stage end
    pub load_end: u32,
    /// Save stage start
    pub save_start: u32,
    /// Save stage end
    pub save_end: u32,
    /// Convolution stage start
    pub conv_start: u32,
    /// Convolution stage end
    pub conv_end: u32,
    /// Misc stage start
    pub misc_start: u32,
    /// Misc stage end
    pub misc_end: u32,
}

impl StageCounters {
    /// Counter registers in capture order
    pub const REGISTERS: [(&'static str, usize); 8] = [
        ("LOAD_START", regs::LOAD_START),
        ("LOAD_END", regs::LOAD_END),
        ("SAVE_START", regs::SAVE_START),
        ("SAVE_END", regs::SAVE_END),
        ("CONV_START", regs::CONV_START),
        ("CONV_END", regs::CONV_END),
        ("MISC_START", regs::MISC_START),
        ("MISC_END", regs::MISC_END),
    ];

    /// Read every counter exactly once, logging each at error level.
    ///
    /// A counter that cannot be read is logged and left at zero, so the
    /// timeout itself is still reported.
    pub fn capture(queue: &dyn CommandQueue) -> Self {
        let cu = queue.compute_unit();
        let mut values = [0u32; 8];
        for (slot, (name, offset)) in values.iter_mut().zip(Self::REGISTERS) {
            match queue.read_register(offset) {
                Ok(value) => {
                    *slot = value;
                    error!("CU {cu} {name} = {value:#x}");
                }
                Err(e) => warn!("CU {cu} {name} unreadable: {e}"),
            }
        }
        let [load_start, load_end, save_start, save_end, conv_start, conv_end, misc_start, misc_end] =
            values;
        Self {
            load_start,
            load_end,
            save_start,
            save_end,
            conv_start,
            conv_end,
            misc_start,
            misc_end,
        }
    }
}

impl fmt::Display for StageCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "load {}/{}, save {}/{}, conv {}/{}, misc {}/{}",
            self.load_start,
            self.load_end,
            self.save_start,
            self.save_end,
            self.conv_start,
            self.conv_end,
            self.misc_start,
            self.misc_end
        )
    }
}

/// One worker's execution context on a compute unit
///
/// Contexts are owned by exactly one worker and never shared.
pub trait CommandQueue: fmt::Debug + Send {
    /// Compute unit this context drives
    fn compute_unit(&self) -> u32;

    /// Program the registers in `packet` and start the unit. Does not block.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError` if the packet cannot be issued.
    fn execute(&mut self, packet: &ExecPacket) -> Result<()>;

    /// Block for at most `interval` waiting for the issued command.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError` if the device cannot be polled.
    fn wait(&mut self, interval: Duration) -> Result<CommandState>;

    /// Read a control register of this compute unit.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` for an unreachable offset.
    fn read_register(&self, offset: usize) -> Result<u32>;
}

/// Completion polling budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Number of wait attempts
    pub budget: u32,
    /// Upper bound on each attempt
    pub interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            budget: 15,
            interval: Duration::from_millis(1000),
        }
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No command in flight
    Idle,
    /// Command issued, not yet observed complete
    Submitted,
    /// Last command completed
    Completed,
    /// Last command exhausted its wait budget; the unit is not driven again
    /// until [`ExecutionEngine::reset`]
    TimedOut,
}

/// Outcome of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecReport {
    /// Compute unit that ran the command
    pub compute_unit: u32,
    /// Wait attempts until completion
    pub attempts: u32,
    /// Submit to completion
    pub elapsed: Duration,
    /// Hardware cycle counter, when requested
    pub cycles: Option<u32>,
}

/// Submit/wait driver over one [`CommandQueue`]
#[derive(Debug)]
pub struct ExecutionEngine {
    queue: Box<dyn CommandQueue>,
    state: EngineState,
    submitted_at: Option<Instant>,
}

impl ExecutionEngine {
    /// Wrap a worker's queue
    pub fn new(queue: Box<dyn CommandQueue>) -> Self {
        Self {
            queue,
            state: EngineState::Idle,
            submitted_at: None,
        }
    }

    /// Current state
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Compute unit of the underlying queue
    pub fn compute_unit(&self) -> u32 {
        self.queue.compute_unit()
    }

    /// Issue one exec-write command carrying `writes`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a command is already in flight or the unit
    /// timed out, or the queue's error.
    pub fn submit(&mut self, writes: &RegisterWriteList) -> Result<()> {
        match self.state {
            EngineState::Submitted => {
                return Err(DpuError::invalid_state(format!(
                    "CU {} already has a command in flight",
                    self.compute_unit()
                )));
            }
            EngineState::TimedOut => {
                return Err(DpuError::invalid_state(format!(
                    "CU {} timed out earlier; pipeline state unknown",
                    self.compute_unit()
                )));
            }
            EngineState::Idle | EngineState::Completed => {}
        }
        let cu = self.compute_unit();
        let packet = ExecPacket::exec_write(1u32 << (cu % 32), writes)?;
        debug!(
            "CU {cu}: submitting exec-write, {} writes, count={}",
            writes.len(),
            packet.count()
        );
        self.queue.execute(&packet)?;
        self.state = EngineState::Submitted;
        self.submitted_at = Some(Instant::now());
        Ok(())
    }

    /// Poll for completion, at most `policy.budget` attempts.
    ///
    /// Returns the number of attempts used.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionTimeout` with the stage counters when the budget
    /// runs out, `HardwareError` when the scheduler reports an error, and
    /// `InvalidState` when nothing was submitted.
    pub fn wait(&mut self, policy: WaitPolicy) -> Result<u32> {
        if self.state != EngineState::Submitted {
            return Err(DpuError::invalid_state(format!(
                "wait on CU {} with no command in flight ({:?})",
                self.compute_unit(),
                self.state
            )));
        }
        let cu = self.compute_unit();
        for attempt in 1..=policy.budget {
            match self.queue.wait(policy.interval)? {
                CommandState::Completed => {
                    self.state = EngineState::Completed;
                    debug!("CU {cu}: completed after {attempt} attempt(s)");
                    return Ok(attempt);
                }
                CommandState::Error | CommandState::Abort => {
                    self.state = EngineState::Idle;
                    return Err(DpuError::hardware_error(format!(
                        "CU {cu}: scheduler reported failure"
                    )));
                }
                state => debug!("CU {cu}: attempt {attempt}/{} still {state:?}", policy.budget),
            }
        }

        self.state = EngineState::TimedOut;
        error!("CU timeout {cu} after {} attempts", policy.budget);
        let counters = StageCounters::capture(self.queue.as_ref());
        Err(DpuError::ExecutionTimeout {
            cu_index: cu,
            attempts: policy.budget,
            counters,
        })
    }

    /// Mark a timed-out unit usable again.
    ///
    /// Only call this once the unit itself has been reset or reloaded.
    pub fn reset(&mut self) {
        if self.state == EngineState::TimedOut {
            warn!("CU {}: clearing timed-out state", self.compute_unit());
        }
        self.state = EngineState::Idle;
        self.submitted_at = None;
    }

    /// Submit, wait and optionally read the cycle counter.
    ///
    /// # Errors
    ///
    /// Returns any error of [`submit`](Self::submit) or [`wait`](Self::wait).
    pub fn run(&mut self, writes: &RegisterWriteList, policy: WaitPolicy, read_cycles: bool) -> Result<ExecReport> {
        self.submit(writes)?;
        let attempts = self.wait(policy)?;
        let elapsed = self.submitted_at.map_or(Duration::ZERO, |t| t.elapsed());
        let cycles = if read_cycles {
            let cycles = self.read_cycle_counter()?;
            info!("CU {}: DPU IP latency {cycles} cycles", self.compute_unit());
            Some(cycles)
        } else {
            None
        };
        Ok(ExecReport {
            compute_unit: self.compute_unit(),
            attempts,
            elapsed,
            cycles,
        })
    }

    /// Cycle counter of the last command
    ///
    /// # Errors
    ///
    /// Returns the queue's register read error.
    pub fn read_cycle_counter(&self) -> Result<u32> {
        self.queue.read_register(regs::CYCLE_COUNTER)
    }

    /// 64-bit hardware version code
    ///
    /// # Errors
    ///
    /// Returns the queue's register read error.
    pub fn read_fingerprint(&self) -> Result<u64> {
        let lo = self.queue.read_register(regs::VERSION_CODE_L)?;
        let hi = self.queue.read_register(regs::VERSION_CODE_H)?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Completion, SimulatedPlatform};
    use crate::buffer::BufferRole;
    use crate::platform::Platform;
    use crate::program::{build_write_list, AddressTable, ProgramMode, TaskParameters};

    fn writes() -> RegisterWriteList {
        let table = AddressTable::new()
            .with(BufferRole::Instruction, 0x1000)
            .with(BufferRole::Params, 0x2000)
            .with(BufferRole::Swap, 0x3000)
            .with(BufferRole::Result, 0x4000)
            .with(BufferRole::Src, 0)
            .with(BufferRole::Dst, 0x6000);
        build_write_list(&table, &TaskParameters::default(), ProgramMode::default()).unwrap()
    }

    fn fast() -> WaitPolicy {
        WaitPolicy {
            budget: 15,
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn packet_layout() {
        let list = writes();
        let packet = ExecPacket::exec_write(0b10, &list).unwrap();
        assert_eq!(packet.state(), Some(CommandState::New));
        assert_eq!(packet.opcode(), ert::OPCODE_EXEC_WRITE);
        assert_eq!(packet.count() as usize, 1 + 6 + 2 * list.len());
        assert_eq!(packet.words().len(), 1 + packet.count() as usize);
        assert_eq!(packet.cu_mask(), 0b10);
        assert!(packet.words()[2..8].iter().all(|&w| w == 0));
        assert_eq!(packet.pairs().collect::<Vec<_>>(), list.pairs().collect::<Vec<_>>());
    }

    #[test]
    fn completes_on_first_attempt() {
        let platform = SimulatedPlatform::new();
        let mut engine = ExecutionEngine::new(platform.open_queue(0).unwrap());
        let report = engine.run(&writes(), fast(), false).unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(engine.state(), EngineState::Completed);
        assert_eq!(platform.log().packets.len(), 1);
    }

    #[test]
    fn completes_after_several_attempts() {
        let platform = SimulatedPlatform::new().with_completion(Completion::AfterWaits(4));
        let mut engine = ExecutionEngine::new(platform.open_queue(0).unwrap());
        engine.submit(&writes()).unwrap();
        assert_eq!(engine.wait(fast()).unwrap(), 4);
    }

    #[test]
    fn timeout_reads_each_counter_once() {
        let platform = SimulatedPlatform::new().with_completion(Completion::Never);
        let mut engine = ExecutionEngine::new(platform.open_queue(2).unwrap());
        engine.submit(&writes()).unwrap();
        let err = engine.wait(fast()).unwrap_err();
        match err {
            DpuError::ExecutionTimeout { cu_index, attempts, .. } => {
                assert_eq!(cu_index, 2);
                assert_eq!(attempts, 15);
            }
            other => panic!("expected ExecutionTimeout, got {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::TimedOut);

        let log = platform.log();
        assert_eq!(log.waits, 15);
        for (_, offset) in StageCounters::REGISTERS {
            let reads = log.register_reads.iter().filter(|&&o| o == offset).count();
            assert_eq!(reads, 1, "counter at {offset:#x}");
        }
        assert_eq!(log.packets.len(), 1, "no re-submission");
    }

    #[test]
    fn wait_without_submit_is_rejected() {
        let platform = SimulatedPlatform::new();
        let mut engine = ExecutionEngine::new(platform.open_queue(0).unwrap());
        assert!(matches!(engine.wait(fast()), Err(DpuError::InvalidState { .. })));
    }

    #[test]
    fn double_submit_is_rejected() {
        let platform = SimulatedPlatform::new().with_completion(Completion::Never);
        let mut engine = ExecutionEngine::new(platform.open_queue(0).unwrap());
        engine.submit(&writes()).unwrap();
        assert!(matches!(engine.submit(&writes()), Err(DpuError::InvalidState { .. })));
    }

    #[test]
    fn timed_out_unit_is_not_driven_again() {
        let platform = SimulatedPlatform::new().with_completion(Completion::Never);
        let mut engine = ExecutionEngine::new(platform.open_queue(0).unwrap());
        let policy = WaitPolicy {
            budget: 2,
            interval: Duration::from_millis(1),
        };
        assert!(matches!(
            engine.run(&writes(), policy, false),
            Err(DpuError::ExecutionTimeout { attempts: 2, .. })
        ));
        assert_eq!(engine.state(), EngineState::TimedOut);

        assert!(matches!(engine.submit(&writes()), Err(DpuError::InvalidState { .. })));
        assert!(matches!(engine.run(&writes(), policy, false), Err(DpuError::InvalidState { .. })));
        assert_eq!(platform.log().packets.len(), 1);

        engine.reset();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.submit(&writes()).unwrap();
        assert_eq!(platform.log().packets.len(), 2);
    }

    /// Never completes; one counter register is unreachable
    #[derive(Debug)]
    struct StalledQueue {
        broken: usize,
    }

    impl CommandQueue for StalledQueue {
        fn compute_unit(&self) -> u32 {
            5
        }

        fn execute(&mut self, _packet: &ExecPacket) -> Result<()> {
            Ok(())
        }

        fn wait(&mut self, _interval: Duration) -> Result<CommandState> {
            Ok(CommandState::Running)
        }

        fn read_register(&self, offset: usize) -> Result<u32> {
            if offset == self.broken {
                return Err(DpuError::transfer_failed(format!("register {offset:#x} unreachable")));
            }
            Ok(u32::try_from(offset).unwrap())
        }
    }

    #[test]
    fn timeout_survives_unreadable_counter() {
        let mut engine = ExecutionEngine::new(Box::new(StalledQueue { broken: regs::SAVE_END }));
        engine.submit(&writes()).unwrap();
        match engine.wait(fast()).unwrap_err() {
            DpuError::ExecutionTimeout {
                cu_index,
                attempts,
                counters,
            } => {
                assert_eq!(cu_index, 5);
                assert_eq!(attempts, 15);
                assert_eq!(counters.save_end, 0);
                assert_eq!(counters.load_end, u32::try_from(regs::LOAD_END).unwrap());
                assert_eq!(counters.misc_end, u32::try_from(regs::MISC_END).unwrap());
            }
            other => panic!("expected ExecutionTimeout, got {other:?}"),
        }
    }

    #[test]
    fn fingerprint_combines_halves() {
        let platform = SimulatedPlatform::new().with_version(0x0123_4567_89AB_CDEF);
        let engine = ExecutionEngine::new(platform.open_queue(0).unwrap());
        assert_eq!(engine.read_fingerprint().unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn counters_display() {
        let c = StageCounters {
            load_start: 1,
            load_end: 2,
            ..StageCounters::default()
        };
        assert_eq!(c.to_string(), "load 1/2, save 0/0, conv 0/0, misc 0/0");
    }
}
