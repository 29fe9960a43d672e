//! Control register map for the DPU compute unit.
//!
//! All offsets are byte offsets from the start of one compute unit's control
//! block. Compute units repeat every [`CU_STRIDE`] bytes inside BAR0.
//!
//! ```text
//! 0x000        AP control (start / done / idle)
//! 0x004-0x00C  interrupt enable / status
//! 0x040-0x06C  buffer address blocks (lo/hi pairs)
//! 0x084-0x0A8  stage diagnostic counters
//! 0x100-0x140  static task parameters
//! 0x1F0-0x1F4  hardware version code (fingerprint)
//! ```

// ── AP control ───────────────────────────────────────────────────────────────

/// AP control register. Bit 0 starts the unit, bit 1 reports done.
pub const AP_CONTROL: usize = 0x000;
/// Global interrupt enable.
pub const GIE: usize = 0x004;
/// Interrupt enable register.
pub const IER: usize = 0x008;
/// Interrupt status register.
pub const ISR: usize = 0x00C;

/// AP control bit definitions
pub mod ap {
    /// Start the compute unit.
    pub const START: u32 = 1 << 0;
    /// Last command completed.
    pub const DONE: u32 = 1 << 1;
    /// Unit is idle.
    pub const IDLE: u32 = 1 << 2;
    /// Unit accepts a new command.
    pub const READY: u32 = 1 << 3;
}

/// Stride between compute unit register blocks in BAR0.
pub const CU_STRIDE: usize = 0x1_0000;

// ── Buffer address blocks ────────────────────────────────────────────────────
// Each block is a 64-bit address split into a low word at the listed offset
// and a high word at offset + 4.

/// Instruction stream address.
pub const BLOCK_INSTR: usize = 0x040;
/// Parameter (weights) address. Not programmed in single-pool mode.
pub const BLOCK_PARAMS: usize = 0x048;
/// Swap / scratch address.
pub const BLOCK_SWAP: usize = 0x050;
/// Result address.
pub const BLOCK_RESULT: usize = 0x058;
/// Source address (data-reorg-unit input).
pub const BLOCK_SRC: usize = 0x060;
/// Destination address (compute-array input).
pub const BLOCK_DST: usize = 0x068;

/// Offset of the high word relative to the low word of an address block.
pub const BLOCK_HI_OFFSET: usize = 0x4;

// ── Diagnostic stage counters ────────────────────────────────────────────────

/// Misc stage end marker.
pub const MISC_END: usize = 0x084;
/// Convolution stage end marker.
pub const CONV_END: usize = 0x088;
/// Save stage end marker.
pub const SAVE_END: usize = 0x08C;
/// Load stage end marker.
pub const LOAD_END: usize = 0x090;
/// Misc stage start marker.
pub const MISC_START: usize = 0x094;
/// Convolution stage start marker.
pub const CONV_START: usize = 0x098;
/// Save stage start marker.
pub const SAVE_START: usize = 0x09C;
/// Load stage start marker.
pub const LOAD_START: usize = 0x0A0;
/// Free-running cycle counter of the last command.
pub const CYCLE_COUNTER: usize = 0x0A8;

// ── Static task parameters ───────────────────────────────────────────────────
// Several of these fields share control words inside the unit, so the
// programming order below is part of the device contract.

/// Data-reorg-unit address stride.
pub const TASK_DRU_ADDR_STRD: usize = 0x100;
/// Data-reorg-unit kernel width.
pub const TASK_DRU_KW: usize = 0x104;
/// Data-reorg-unit stride width.
pub const TASK_DRU_SW: usize = 0x108;
/// Data-reorg-unit input channel count.
pub const TASK_DRU_IC: usize = 0x10C;
/// Data-reorg-unit output width.
pub const TASK_DRU_OW: usize = 0x110;
/// Data-reorg-unit output height.
pub const TASK_DRU_OH: usize = 0x114;
/// Source transfer count.
pub const TASK_DRU_SRC_NTRANS: usize = 0x118;
/// Destination transfer count.
pub const TASK_DRU_DST_NTRANS: usize = 0x11C;
/// Pad-left correction.
pub const TASK_DRU_PL_CORR: usize = 0x120;
/// Pad-right correction.
pub const TASK_DRU_PR_CORR: usize = 0x124;
/// Input-width correction.
pub const TASK_DRU_IW_CORR: usize = 0x128;
/// Stride-width correction.
pub const TASK_DRU_SW_CORR: usize = 0x12C;
/// Weight-channel-group correction.
pub const TASK_DRU_WCG_CORR: usize = 0x130;
/// Data-reorg-unit read mode.
pub const TASK_DRU_READ_MODE: usize = 0x134;
/// Task mode.
pub const TASK_MODE: usize = 0x138;
/// AXI cache / QoS attributes.
pub const AXCACHE_AXQOS: usize = 0x13C;
/// Profiling enable.
pub const PROF_ENABLE: usize = 0x140;

// ── Identity ─────────────────────────────────────────────────────────────────

/// Hardware version code, low word.
pub const VERSION_CODE_L: usize = 0x1F0;
/// Hardware version code, high word.
pub const VERSION_CODE_H: usize = 0x1F4;

/// Size of one compute unit's register block that the host touches.
pub const CU_REGISTER_SPAN: usize = 0x200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_blocks_do_not_overlap() {
        let blocks = [
            BLOCK_INSTR,
            BLOCK_PARAMS,
            BLOCK_SWAP,
            BLOCK_RESULT,
            BLOCK_SRC,
            BLOCK_DST,
        ];
        for pair in blocks.windows(2) {
            assert!(pair[0] + BLOCK_HI_OFFSET < pair[1]);
        }
    }

    #[test]
    fn task_parameters_are_word_spaced() {
        assert_eq!(PROF_ENABLE - TASK_DRU_ADDR_STRD, 16 * 4);
        assert!(VERSION_CODE_H + 4 <= CU_REGISTER_SPAN);
    }
}
