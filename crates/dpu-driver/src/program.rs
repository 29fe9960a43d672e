//! Register programming
//!
//! Turns buffer physical addresses and the static task parameters into the
//! ordered [`RegisterWriteList`] carried by one exec-write command.
//!
//! ```text
//! INSTR lo/hi, PARAMS lo/hi (unless single-pool), SWAP lo/hi, RESULT lo/hi,
//! SRC lo/hi, DST lo/hi, then 17 task parameters in map order
//! ```

use crate::buffer::BufferRole;
use crate::error::{DpuError, Result};
use dpu_chip::regs;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Role to 64-bit physical address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTable {
    entries: BTreeMap<BufferRole, u64>,
}

impl AddressTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the address of `role`, replacing any previous entry
    pub fn set(&mut self, role: BufferRole, address: u64) {
        self.entries.insert(role, address);
    }

    /// Builder form of [`set`](Self::set)
    #[must_use]
    pub fn with(mut self, role: BufferRole, address: u64) -> Self {
        self.set(role, address);
        self
    }

    /// Address of `role`, if populated
    pub fn get(&self, role: BufferRole) -> Option<u64> {
        self.entries.get(&role).copied()
    }

    /// Address of `role`, or `MissingBufferRole`.
    ///
    /// # Errors
    ///
    /// Returns `MissingBufferRole` when `role` has no entry.
    pub fn require(&self, role: BufferRole) -> Result<u64> {
        self.get(role).ok_or(DpuError::MissingBufferRole { role })
    }

    /// Derive the source and destination entries from the DRU buffers.
    ///
    /// With the DRU enabled the unit reads `DruSrc` and writes `DruDst`,
    /// which the compute array then reads, so `Src = DruSrc` and
    /// `Dst = DruDst`. Without it the host writes the hardware layout
    /// straight into `DruDst`: `Src` is null and `Dst = DruDst`.
    ///
    /// # Errors
    ///
    /// Returns `MissingBufferRole` if a DRU buffer address is absent.
    pub fn fill_transfer_roles(&mut self, dru: bool) -> Result<()> {
        let dst = self.require(BufferRole::DruDst)?;
        let src = if dru { self.require(BufferRole::DruSrc)? } else { 0 };
        self.set(BufferRole::Src, src);
        self.set(BufferRole::Dst, dst);
        Ok(())
    }
}

/// Mode flags that change the write list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramMode {
    /// Weights live in the instruction pool; no parameter address is written
    pub single_pool: bool,
    /// On-chip data-reorg-unit handles the input layout
    pub dru: bool,
}

/// Static task parameters, in register-map order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskParameters {
    /// DRU address stride
    pub dru_addr_stride: u32,
    /// Kernel width
    pub kernel_width: u32,
    /// Stride width
    pub stride_width: u32,
    /// Input channels
    pub input_channels: u32,
    /// Output width
    pub output_width: u32,
    /// Output height
    pub output_height: u32,
    /// Source transfer count
    pub src_transfers: u32,
    /// Destination transfer count
    pub dst_transfers: u32,
    /// Pad-left correction
    pub pad_left_corr: u32,
    /// Pad-right correction
    pub pad_right_corr: u32,
    /// Input-width correction
    pub input_width_corr: u32,
    /// Stride-width correction
    pub stride_width_corr: u32,
    /// Weight-channel-group correction
    pub weight_group_corr: u32,
    /// DRU read mode
    pub read_mode: u32,
    /// Task mode
    pub task_mode: u32,
    /// AXI cache / QoS attributes
    pub axcache_axqos: u32,
    /// Profiling enable
    pub prof_enable: u32,
}

impl TaskParameters {
    /// Number of task parameter registers
    pub const COUNT: usize = 17;

    /// `(name, offset, value)` in canonical order
    pub const fn fields(&self) -> [(&'static str, usize, u32); Self::COUNT] {
        [
            ("TASK_DRU_ADDR_STRD", regs::TASK_DRU_ADDR_STRD, self.dru_addr_stride),
            ("TASK_DRU_KW", regs::TASK_DRU_KW, self.kernel_width),
            ("TASK_DRU_SW", regs::TASK_DRU_SW, self.stride_width),
            ("TASK_DRU_IC", regs::TASK_DRU_IC, self.input_channels),
            ("TASK_DRU_OW", regs::TASK_DRU_OW, self.output_width),
            ("TASK_DRU_OH", regs::TASK_DRU_OH, self.output_height),
            ("TASK_DRU_SRC_NTRANS", regs::TASK_DRU_SRC_NTRANS, self.src_transfers),
            ("TASK_DRU_DST_NTRANS", regs::TASK_DRU_DST_NTRANS, self.dst_transfers),
            ("TASK_DRU_PL_CORR", regs::TASK_DRU_PL_CORR, self.pad_left_corr),
            ("TASK_DRU_PR_CORR", regs::TASK_DRU_PR_CORR, self.pad_right_corr),
            ("TASK_DRU_IW_CORR", regs::TASK_DRU_IW_CORR, self.input_width_corr),
            ("TASK_DRU_SW_CORR", regs::TASK_DRU_SW_CORR, self.stride_width_corr),
            ("TASK_DRU_WCG_CORR", regs::TASK_DRU_WCG_CORR, self.weight_group_corr),
            ("TASK_DRU_READ_MODE", regs::TASK_DRU_READ_MODE, self.read_mode),
            ("TASK_MODE", regs::TASK_MODE, self.task_mode),
            ("AXCACHE_AXQOS", regs::AXCACHE_AXQOS, self.axcache_axqos),
            ("PROF_ENABLE", regs::PROF_ENABLE, self.prof_enable),
        ]
    }
}

/// One register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    /// Register name for dumps
    pub name: &'static str,
    /// Byte offset within the compute unit block
    pub offset: u32,
    /// Value written
    pub value: u32,
}

/// Ordered register writes for one pass. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWriteList {
    writes: Vec<RegisterWrite>,
}

impl RegisterWriteList {
    /// Writes in programming order
    pub fn writes(&self) -> &[RegisterWrite] {
        &self.writes
    }

    /// `(offset, value)` pairs in programming order
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.writes.iter().map(|w| (w.offset, w.value))
    }

    /// Number of writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Value last written at `offset`
    pub fn value_at(&self, offset: usize) -> Option<u32> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.offset as usize == offset)
            .map(|w| w.value)
    }

    /// 64-bit address written to the block at `block`
    pub fn address_at(&self, block: usize) -> Option<u64> {
        let lo = self.value_at(block)?;
        let hi = self.value_at(block + regs::BLOCK_HI_OFFSET)?;
        Some((u64::from(hi) << 32) | u64::from(lo))
    }

    /// Render as `NAME, reg: 0x.. val: 0x..` lines
    pub fn render(&self) -> String {
        let mut text = String::new();
        for w in &self.writes {
            let _ = writeln!(text, "{}, reg: {:#x} val: {:#x}", w.name, w.offset, w.value);
        }
        text
    }
}

/// Build the write list for one pass.
///
/// Pure and deterministic: the same inputs always give the same list.
///
/// # Errors
///
/// Returns `MissingBufferRole` when an address needed by `mode` is absent.
// Register offsets are below 0x200; addresses split into 32-bit halves
#[allow(clippy::cast_possible_truncation)]
pub fn build_write_list(
    table: &AddressTable,
    params: &TaskParameters,
    mode: ProgramMode,
) -> Result<RegisterWriteList> {
    let mut blocks: Vec<(&'static str, usize, BufferRole)> =
        vec![("BLOCK_INSTR", regs::BLOCK_INSTR, BufferRole::Instruction)];
    if !mode.single_pool {
        blocks.push(("BLOCK_PARAMS", regs::BLOCK_PARAMS, BufferRole::Params));
    }
    blocks.extend([
        ("BLOCK_SWAP", regs::BLOCK_SWAP, BufferRole::Swap),
        ("BLOCK_RESULT", regs::BLOCK_RESULT, BufferRole::Result),
        ("BLOCK_SRC", regs::BLOCK_SRC, BufferRole::Src),
        ("BLOCK_DST", regs::BLOCK_DST, BufferRole::Dst),
    ]);

    let mut writes = Vec::with_capacity(blocks.len() * 2 + TaskParameters::COUNT);
    for (name, offset, role) in blocks {
        let address = table.require(role)?;
        writes.push(RegisterWrite {
            name,
            offset: offset as u32,
            value: address as u32,
        });
        writes.push(RegisterWrite {
            name,
            offset: (offset + regs::BLOCK_HI_OFFSET) as u32,
            value: (address >> 32) as u32,
        });
    }
    for (name, offset, value) in params.fields() {
        writes.push(RegisterWrite {
            name,
            offset: offset as u32,
            value,
        });
    }

    tracing::debug!(
        "Register write list: {} writes (single_pool={}, dru={})",
        writes.len(),
        mode.single_pool,
        mode.dru
    );
    Ok(RegisterWriteList { writes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_table() -> AddressTable {
        AddressTable::new()
            .with(BufferRole::Instruction, 0x1_0000_1000)
            .with(BufferRole::Params, 0x2000)
            .with(BufferRole::Swap, 0x3000)
            .with(BufferRole::Result, 0x4000)
            .with(BufferRole::Src, 0x5000)
            .with(BufferRole::Dst, 0x6000)
    }

    fn params() -> TaskParameters {
        TaskParameters {
            dru_addr_stride: 1,
            kernel_width: 2,
            stride_width: 3,
            input_channels: 4,
            output_width: 5,
            output_height: 6,
            src_transfers: 7,
            dst_transfers: 8,
            pad_left_corr: 9,
            pad_right_corr: 10,
            input_width_corr: 11,
            stride_width_corr: 12,
            weight_group_corr: 13,
            read_mode: 14,
            task_mode: 15,
            axcache_axqos: 16,
            prof_enable: 17,
        }
    }

    #[test]
    fn write_list_matches_recorded_sequence() {
        let list = build_write_list(&full_table(), &params(), ProgramMode::default()).unwrap();
        let recorded: Vec<(u32, u32)> = vec![
            (0x040, 0x0000_1000),
            (0x044, 0x1),
            (0x048, 0x2000),
            (0x04C, 0),
            (0x050, 0x3000),
            (0x054, 0),
            (0x058, 0x4000),
            (0x05C, 0),
            (0x060, 0x5000),
            (0x064, 0),
            (0x068, 0x6000),
            (0x06C, 0),
            (0x100, 1),
            (0x104, 2),
            (0x108, 3),
            (0x10C, 4),
            (0x110, 5),
            (0x114, 6),
            (0x118, 7),
            (0x11C, 8),
            (0x120, 9),
            (0x124, 10),
            (0x128, 11),
            (0x12C, 12),
            (0x130, 13),
            (0x134, 14),
            (0x138, 15),
            (0x13C, 16),
            (0x140, 17),
        ];
        assert_eq!(list.pairs().collect::<Vec<_>>(), recorded);
    }

    #[test]
    fn write_list_is_deterministic() {
        let a = build_write_list(&full_table(), &params(), ProgramMode::default()).unwrap();
        let b = build_write_list(&full_table(), &params(), ProgramMode::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn single_pool_omits_params_block() {
        let mut table = full_table();
        table.entries.remove(&BufferRole::Params);
        let mode = ProgramMode {
            single_pool: true,
            dru: false,
        };
        let list = build_write_list(&table, &params(), mode).unwrap();
        assert_eq!(list.len(), 10 + TaskParameters::COUNT);
        assert_eq!(list.value_at(regs::BLOCK_PARAMS), None);
        assert_eq!(list.address_at(regs::BLOCK_INSTR), Some(0x1_0000_1000));
    }

    #[test]
    fn missing_role_is_reported() {
        let mut table = full_table();
        table.entries.remove(&BufferRole::Swap);
        match build_write_list(&table, &params(), ProgramMode::default()) {
            Err(DpuError::MissingBufferRole { role }) => assert_eq!(role, BufferRole::Swap),
            other => panic!("expected MissingBufferRole, got {other:?}"),
        }
    }

    #[test]
    fn params_required_outside_single_pool() {
        let mut table = full_table();
        table.entries.remove(&BufferRole::Params);
        assert!(matches!(
            build_write_list(&table, &params(), ProgramMode::default()),
            Err(DpuError::MissingBufferRole { role: BufferRole::Params })
        ));
    }

    #[test]
    fn transfer_roles_follow_dru_mode() {
        let mut table = AddressTable::new()
            .with(BufferRole::DruSrc, 0xA000)
            .with(BufferRole::DruDst, 0xB000);
        table.fill_transfer_roles(true).unwrap();
        assert_eq!(table.get(BufferRole::Src), Some(0xA000));
        assert_eq!(table.get(BufferRole::Dst), Some(0xB000));

        table.fill_transfer_roles(false).unwrap();
        assert_eq!(table.get(BufferRole::Src), Some(0));
        assert_eq!(table.get(BufferRole::Dst), Some(0xB000));
    }

    #[test]
    fn render_names_every_write() {
        let list = build_write_list(&full_table(), &params(), ProgramMode::default()).unwrap();
        let text = list.render();
        assert_eq!(text.lines().count(), list.len());
        assert!(text.starts_with("BLOCK_INSTR, reg: 0x40 val: 0x1000\n"));
        assert!(text.contains("PROF_ENABLE, reg: 0x140 val: 0x11"));
    }
}
