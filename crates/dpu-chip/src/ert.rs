//! Exec-write command packet.
//!
//! A single command carries every register write of one inference pass.
//!
//! ```text
//! word 0      header: state[3:0] stat[4] unused[9:5] extra_cu[11:10]
//!                     count[22:12] opcode[27:23] type[31:28]
//! word 1      compute unit mask
//! word 2..7   reserved (zero)
//! word 8..    (register offset, value) pairs
//! ```
//!
//! `count` is the number of words following the header.

/// Command state field values.
pub mod state {
    /// Freshly built, not yet seen by the scheduler.
    pub const NEW: u32 = 1;
    /// Queued by the scheduler.
    pub const QUEUED: u32 = 2;
    /// Running on a compute unit.
    pub const RUNNING: u32 = 3;
    /// Finished successfully.
    pub const COMPLETED: u32 = 4;
    /// Scheduler reported an error.
    pub const ERROR: u32 = 5;
    /// Aborted.
    pub const ABORT: u32 = 6;
}

/// Opcode for a register-write-then-start command.
pub const OPCODE_EXEC_WRITE: u32 = 5;
/// Packet type for control-path commands.
pub const TYPE_CTRL: u32 = 1;

/// Reserved words between the compute unit mask and the register pairs.
pub const RESERVED_WORDS: usize = 6;
/// Largest value the 11-bit count field holds.
pub const MAX_COUNT: u32 = (1 << 11) - 1;

/// Header bit positions.
pub mod header {
    /// State field shift.
    pub const STATE_SHIFT: u32 = 0;
    /// Statistics-enabled bit shift.
    pub const STAT_SHIFT: u32 = 4;
    /// Count field shift.
    pub const COUNT_SHIFT: u32 = 12;
    /// Opcode field shift.
    pub const OPCODE_SHIFT: u32 = 23;
    /// Type field shift.
    pub const TYPE_SHIFT: u32 = 28;
}

/// Pack a header word.
#[must_use]
pub const fn pack_header(state: u32, stat_enabled: bool, count: u32, opcode: u32, ty: u32) -> u32 {
    ((state & 0xF) << header::STATE_SHIFT)
        | ((stat_enabled as u32) << header::STAT_SHIFT)
        | ((count & MAX_COUNT) << header::COUNT_SHIFT)
        | ((opcode & 0x1F) << header::OPCODE_SHIFT)
        | ((ty & 0xF) << header::TYPE_SHIFT)
}

/// Extract the state field from a header word.
#[must_use]
pub const fn header_state(word: u32) -> u32 {
    (word >> header::STATE_SHIFT) & 0xF
}

/// Extract the count field from a header word.
#[must_use]
pub const fn header_count(word: u32) -> u32 {
    (word >> header::COUNT_SHIFT) & MAX_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_roundtrip() {
        let word = pack_header(state::NEW, true, 41, OPCODE_EXEC_WRITE, TYPE_CTRL);
        assert_eq!(header_state(word), state::NEW);
        assert_eq!(header_count(word), 41);
        assert_eq!(word >> header::TYPE_SHIFT, TYPE_CTRL);
        assert_eq!((word >> header::OPCODE_SHIFT) & 0x1F, OPCODE_EXEC_WRITE);
    }
}
