//! Fixed geometry of the hardware tensor layout.

/// Channels processed per hardware lane in one cycle.
pub const PARALLELISM: usize = 16;

/// Channels packed into one byte in narrow (2-bit) interleave mode.
pub const NARROW_FIELDS_PER_BYTE: usize = 4;

/// Bits per channel in narrow interleave mode.
pub const NARROW_FIELD_BITS: u32 = 2;

/// DMA burst word in bytes. Also the dmem dump line width.
pub const WORD_BYTES: usize = 64;

/// Channel groups per output word (`WORD_BYTES / PARALLELISM`).
pub const GROUPS_PER_WORD: usize = WORD_BYTES / PARALLELISM;

/// Words per output segment, per output element (`segment = 64 * 16 * out_size`).
pub const SEGMENT_WORDS: usize = 16;

/// Batch lanes the output de-interleave can address.
pub const OUTPUT_LANES: usize = 4;

/// Batch size of the current accelerator generation.
pub const DEFAULT_BATCH: usize = 4;

/// Page size assumed for device-visible allocations when the host cannot tell.
pub const DEVICE_PAGE: usize = 4096;

/// Base addresses of the simulator memory views used in dmem dumps.
pub mod dmem {
    /// Inputs (raw and batch-interleaved).
    pub const INPUT_BASE: u64 = 0x0;
    /// Parameter stream.
    pub const PARAMS_BASE: u64 = 0x3000_0000;
    /// Outputs and every other dump.
    pub const OUTPUT_BASE: u64 = 0x1000_0000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_holds_whole_groups() {
        assert_eq!(WORD_BYTES % PARALLELISM, 0);
        assert_eq!(GROUPS_PER_WORD, OUTPUT_LANES);
        assert_eq!(PARALLELISM % NARROW_FIELDS_PER_BYTE, 0);
    }

    #[test]
    fn dmem_bases_match_simulator() {
        assert_eq!(dmem::PARAMS_BASE, 805_306_368);
        assert_eq!(dmem::OUTPUT_BASE, 268_435_456);
    }
}
