//! In-process simulated platform
//!
//! Buffers live in a [`SimMemory`] address space and move there on
//! upload/download, exercising the same migration path as the mapped window.
//! Queues record every packet, wait and register read in a [`SimLog`] so
//! tests can assert on the exact device traffic. An optional kernel runs on
//! `execute` and may read and write simulator memory.

use super::host::HostPages;
use crate::buffer::BufferBackend;
use crate::error::{DpuError, Result};
use crate::exec::{CommandQueue, CommandState, ExecPacket};
use crate::platform::{BackendType, Platform};
use dpu_chip::{ert, regs};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// First simulated device address
const SIM_BASE: u64 = 0x8000_0000;
/// Alignment of simulated allocations
const SIM_ALIGN: u64 = 0x1000;

fn poisoned(what: &str) -> DpuError {
    DpuError::hardware_error(format!("simulator {what} lock poisoned"))
}

/// Simulated device address space
#[derive(Debug)]
pub struct SimMemory {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    next: AtomicU64,
}

impl Default for SimMemory {
    fn default() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(SIM_BASE),
        }
    }
}

impl SimMemory {
    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<u64, Vec<u8>>>> {
        self.regions.lock().map_err(|_| poisoned("memory"))
    }

    fn reserve(&self, len: usize) -> Result<u64> {
        let span = (len.max(1) as u64).div_ceil(SIM_ALIGN) * SIM_ALIGN;
        let address = self.next.fetch_add(span, Ordering::Relaxed);
        self.lock()?.insert(address, vec![0; len]);
        Ok(address)
    }

    fn release(&self, address: u64) {
        if let Ok(mut regions) = self.regions.lock() {
            regions.remove(&address);
        }
    }

    /// Run `f` on the region containing `[address, address + len)`.
    fn with_region<T>(&self, address: u64, len: usize, f: impl FnOnce(&mut [u8]) -> T) -> Result<T> {
        let mut regions = self.lock()?;
        let (&base, region) = regions
            .range_mut(..=address)
            .next_back()
            .ok_or_else(|| DpuError::transfer_failed(format!("no simulated region at {address:#x}")))?;
        let start = usize::try_from(address - base)
            .map_err(|_| DpuError::transfer_failed(format!("address {address:#x} out of range")))?;
        let end = start + len;
        if end > region.len() {
            return Err(DpuError::transfer_failed(format!(
                "simulated access {address:#x}+{len} past region {base:#x} ({} bytes)",
                region.len()
            )));
        }
        Ok(f(&mut region[start..end]))
    }

    /// Read `len` bytes at `address`.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if the range is not inside one region.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.with_region(address, len, |bytes| bytes.to_vec())
    }

    /// Write `data` at `address`.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if the range is not inside one region.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        self.with_region(address, data.len(), |bytes| bytes.copy_from_slice(data))
    }

    /// Length of the region starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns `TransferFailed` if no region starts there.
    pub fn region_len(&self, address: u64) -> Result<usize> {
        self.lock()?
            .get(&address)
            .map(Vec::len)
            .ok_or_else(|| DpuError::transfer_failed(format!("no simulated region at {address:#x}")))
    }

    /// Number of live regions
    pub fn region_count(&self) -> usize {
        self.regions.lock().map_or(0, |r| r.len())
    }
}

/// Buffer backed by simulator memory
#[derive(Debug)]
pub struct SimBuffer {
    pages: HostPages,
    len: usize,
    address: u64,
    memory: Arc<SimMemory>,
}

impl BufferBackend for SimBuffer {
    fn physical_address(&self) -> u64 {
        self.address
    }

    fn byte_size(&self) -> usize {
        self.len
    }

    fn host_slice(&self) -> &[u8] {
        &self.pages.as_slice()[..self.len]
    }

    fn host_slice_mut(&mut self) -> &mut [u8] {
        &mut self.pages.as_mut_slice()[..self.len]
    }

    fn upload(&mut self) -> Result<()> {
        self.memory.write(self.address, &self.pages.as_slice()[..self.len])
    }

    fn download(&mut self) -> Result<()> {
        let data = self.memory.read(self.address, self.len)?;
        self.pages.as_mut_slice()[..self.len].copy_from_slice(&data);
        Ok(())
    }

    fn kind(&self) -> BackendType {
        BackendType::Simulated
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        self.memory.release(self.address);
        trace!("Released simulated buffer at {:#x}", self.address);
    }
}

/// When a submitted command reports completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// On the n-th wait after submission
    AfterWaits(u32),
    /// Never; every wait sleeps its interval and reports `Running`
    Never,
}

impl Default for Completion {
    fn default() -> Self {
        Self::AfterWaits(1)
    }
}

/// Device traffic observed by simulated queues
#[derive(Debug, Clone, Default)]
pub struct SimLog {
    /// Every packet executed, in order
    pub packets: Vec<ExecPacket>,
    /// Every register offset read, in order
    pub register_reads: Vec<usize>,
    /// Number of wait calls
    pub waits: u32,
    /// Workers that opened a queue
    pub opened: Vec<usize>,
}

/// Kernel invoked on every executed packet
pub type SimKernel = Arc<dyn Fn(&ExecPacket, &SimMemory) -> Result<()> + Send + Sync>;

/// Simulated platform
#[derive(Clone)]
pub struct SimulatedPlatform {
    memory: Arc<SimMemory>,
    log: Arc<Mutex<SimLog>>,
    registers: Arc<Mutex<HashMap<usize, u32>>>,
    completion: Completion,
    version: u64,
    kernel: Option<SimKernel>,
}

impl fmt::Debug for SimulatedPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedPlatform")
            .field("completion", &self.completion)
            .field("version", &format_args!("{:#018x}", self.version))
            .field("kernel", &self.kernel.is_some())
            .field("regions", &self.memory.region_count())
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    /// Platform with immediate completion and no kernel
    pub fn new() -> Self {
        Self {
            memory: Arc::new(SimMemory::default()),
            log: Arc::new(Mutex::new(SimLog::default())),
            registers: Arc::new(Mutex::new(HashMap::new())),
            completion: Completion::default(),
            version: 0,
            kernel: None,
        }
    }

    /// Platform whose kernel copies the compute-array input to the result
    pub fn loopback() -> Self {
        Self::new().with_kernel(Arc::new(loopback_kernel))
    }

    /// Set completion behavior
    #[must_use]
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    /// Set the hardware version code
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Set the kernel run on every packet
    #[must_use]
    pub fn with_kernel(mut self, kernel: SimKernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Preset a control register value
    #[must_use]
    pub fn with_register(self, offset: usize, value: u32) -> Self {
        if let Ok(mut regs) = self.registers.lock() {
            regs.insert(offset, value);
        }
        self
    }

    /// Simulator address space
    pub fn memory(&self) -> &SimMemory {
        &self.memory
    }

    /// Snapshot of the device traffic so far
    pub fn log(&self) -> SimLog {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

impl Platform for SimulatedPlatform {
    fn allocate(&self, len: usize) -> Result<Box<dyn BufferBackend>> {
        let pages = HostPages::new(len)?;
        let address = self.memory.reserve(len)?;
        Ok(Box::new(SimBuffer {
            pages,
            len,
            address,
            memory: Arc::clone(&self.memory),
        }))
    }

    fn open_queue(&self, worker: usize) -> Result<Box<dyn CommandQueue>> {
        self.log.lock().map_err(|_| poisoned("log"))?.opened.push(worker);
        let cu = u32::try_from(worker)
            .map_err(|_| DpuError::invalid_config(format!("worker index {worker} out of range")))?;
        debug!("Opened simulated queue for worker {worker}");
        Ok(Box::new(SimulatedQueue {
            cu,
            platform: self.clone(),
            waits_since_submit: None,
        }))
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Simulated
    }
}

/// Execution context of one worker on the simulator
#[derive(Debug)]
pub struct SimulatedQueue {
    cu: u32,
    platform: SimulatedPlatform,
    waits_since_submit: Option<u32>,
}

impl SimulatedQueue {
    fn log(&self) -> Result<MutexGuard<'_, SimLog>> {
        self.platform.log.lock().map_err(|_| poisoned("log"))
    }
}

impl CommandQueue for SimulatedQueue {
    fn compute_unit(&self) -> u32 {
        self.cu
    }

    fn execute(&mut self, packet: &ExecPacket) -> Result<()> {
        if packet.state() != Some(CommandState::New) || packet.opcode() != ert::OPCODE_EXEC_WRITE {
            return Err(DpuError::hardware_error(format!(
                "simulated CU {} rejects packet header {:#010x}",
                self.cu,
                packet.words()[0]
            )));
        }
        self.log()?.packets.push(packet.clone());
        if let Some(kernel) = &self.platform.kernel {
            kernel(packet, &self.platform.memory)?;
        }
        self.waits_since_submit = Some(0);
        Ok(())
    }

    fn wait(&mut self, interval: Duration) -> Result<CommandState> {
        self.log()?.waits += 1;
        let Some(waits) = self.waits_since_submit.as_mut() else {
            return Err(DpuError::invalid_state(format!("simulated CU {} has nothing to wait for", self.cu)));
        };
        *waits += 1;
        match self.platform.completion {
            Completion::AfterWaits(n) if *waits >= n => {
                self.waits_since_submit = None;
                Ok(CommandState::Completed)
            }
            Completion::AfterWaits(_) => Ok(CommandState::Running),
            Completion::Never => {
                std::thread::sleep(interval);
                Ok(CommandState::Running)
            }
        }
    }

    fn read_register(&self, offset: usize) -> Result<u32> {
        self.log()?.register_reads.push(offset);
        #[allow(clippy::cast_possible_truncation)]
        let value = match offset {
            regs::VERSION_CODE_L => self.platform.version as u32,
            regs::VERSION_CODE_H => (self.platform.version >> 32) as u32,
            _ => self
                .platform
                .registers
                .lock()
                .map_err(|_| poisoned("register"))?
                .get(&offset)
                .copied()
                .unwrap_or(0),
        };
        Ok(value)
    }
}

/// Kernel that copies the compute-array input to the result buffer.
///
/// With a non-null source address the data-reorg step is modelled as a
/// plain copy from source to destination first.
///
/// # Errors
///
/// Returns `TransferFailed` if a programmed address has no region.
pub fn loopback_kernel(packet: &ExecPacket, memory: &SimMemory) -> Result<()> {
    let address = |block: usize, name: &str| {
        packet
            .address_at(block)
            .ok_or_else(|| DpuError::hardware_error(format!("packet carries no {name} address")))
    };
    let src = address(regs::BLOCK_SRC, "source")?;
    let dst = address(regs::BLOCK_DST, "destination")?;
    let result = address(regs::BLOCK_RESULT, "result")?;

    if src != 0 {
        let len = memory.region_len(src)?.min(memory.region_len(dst)?);
        memory.write(dst, &memory.read(src, len)?)?;
    }
    let len = memory.region_len(dst)?.min(memory.region_len(result)?);
    memory.write(result, &memory.read(dst, len)?)?;
    trace!("Loop-back kernel: {len} bytes {dst:#x} -> {result:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_released_on_drop() {
        let platform = SimulatedPlatform::new();
        let a = platform.allocate(100).unwrap();
        let b = platform.allocate(5000).unwrap();
        assert_eq!(platform.memory().region_count(), 2);
        assert_eq!(b.physical_address() - a.physical_address(), SIM_ALIGN);
        drop(a);
        assert_eq!(platform.memory().region_count(), 1);
        drop(b);
        assert_eq!(platform.memory().region_count(), 0);
    }

    #[test]
    fn access_past_region_fails() {
        let platform = SimulatedPlatform::new();
        let buf = platform.allocate(16).unwrap();
        assert!(platform.memory().read(buf.physical_address() + 8, 16).is_err());
        assert!(platform.memory().read(0x10, 1).is_err());
    }

    #[test]
    fn preset_registers_are_readable() {
        let platform = SimulatedPlatform::new().with_register(regs::CYCLE_COUNTER, 1234);
        let queue = platform.open_queue(1).unwrap();
        assert_eq!(queue.read_register(regs::CYCLE_COUNTER).unwrap(), 1234);
        assert_eq!(queue.read_register(regs::LOAD_START).unwrap(), 0);
        assert_eq!(platform.log().register_reads, vec![regs::CYCLE_COUNTER, regs::LOAD_START]);
        assert_eq!(platform.log().opened, vec![1]);
    }
}
