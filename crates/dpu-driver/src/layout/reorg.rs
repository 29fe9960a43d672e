//! Output de-interleave: hardware result buffer back to standard NHWC.

use crate::error::{DpuError, Result};
use dpu_chip::geometry::{GROUPS_PER_WORD, OUTPUT_LANES, PARALLELISM, SEGMENT_WORDS, WORD_BYTES};
use tracing::{debug, warn};

/// Reorganize a hardware result buffer into `batch` standard outputs of
/// `out_size` bytes each.
///
/// For byte `i` of `hw`:
///
/// ```text
/// segment_size = 64 * 16 * out_size
/// mbatch  = i / segment_size
/// segment = (i - mbatch*segment_size) / 64
/// group   = (i - mbatch*segment_size - segment*64) / 16
/// dest    = mbatch*4 + group
/// ```
///
/// Only destinations `0..4` exist. Each keeps its own cursor starting at
/// `dest * out_size`; bytes routed to any other destination are dropped and
/// advance nothing. A destination at or beyond `batch` still advances its
/// cursor but its bytes fall outside the returned buffer and are discarded.
///
/// The returned buffer is `out_size * batch` bytes. With `batch > 4` the lanes
/// past the fourth stay zero.
///
/// # Errors
///
/// Returns `InvalidConfig` for a zero `out_size` or `batch`, or when the
/// sizes overflow `usize`.
pub fn output_reorg(hw: &[u8], out_size: usize, batch: usize) -> Result<Vec<u8>> {
    if out_size == 0 || batch == 0 {
        return Err(DpuError::invalid_config(format!(
            "output reorg needs non-zero out_size and batch (out_size={out_size}, batch={batch})"
        )));
    }

    let overflow = || {
        DpuError::invalid_config(format!("output reorg size overflows (out_size={out_size}, batch={batch})"))
    };
    let segment_size = (WORD_BYTES * SEGMENT_WORDS).checked_mul(out_size).ok_or_else(overflow)?;
    let mut out = vec![0u8; out_size.checked_mul(batch).ok_or_else(overflow)?];
    let mut cursors = [0usize; OUTPUT_LANES];
    let mut dropped = 0usize;

    for (i, &byte) in hw.iter().enumerate() {
        let mbatch = i / segment_size;
        let within = i - mbatch * segment_size;
        let segment = within / WORD_BYTES;
        let group = (within - segment * WORD_BYTES) / PARALLELISM;
        let dest = mbatch * GROUPS_PER_WORD + group;

        if dest >= OUTPUT_LANES {
            dropped += 1;
            continue;
        }
        let pos = dest * out_size + cursors[dest];
        cursors[dest] += 1;
        match out.get_mut(pos) {
            Some(slot) => *slot = byte,
            None => dropped += 1,
        }
    }

    if batch > OUTPUT_LANES {
        warn!("Output reorg fills {OUTPUT_LANES} lanes, batch {batch} leaves the rest zero");
    }
    debug!(
        "Output reorg: {} hw bytes -> {} std bytes ({dropped} dropped)",
        hw.len(),
        out.len()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_word_splits_into_four_lanes() {
        let hw: Vec<u8> = (0..64).collect();
        let out = output_reorg(&hw, 16, 4).unwrap();
        assert_eq!(out, hw);
    }

    #[test]
    fn lanes_are_filled_word_by_word() {
        // Two words, out_size 32: lane d receives bytes 16d..16d+16 of each word
        let hw: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let out = output_reorg(&hw, 32, 4).unwrap();
        for d in 0..4 {
            let lane = &out[d * 32..(d + 1) * 32];
            let expect: Vec<u8> = (16 * d..16 * d + 16)
                .chain(64 + 16 * d..64 + 16 * d + 16)
                .map(|i| i as u8)
                .collect();
            assert_eq!(lane, expect.as_slice());
        }
    }

    #[test]
    fn bytes_past_first_segment_are_dropped() {
        // out_size 1: segment is 1024 bytes; everything from byte 1024 on maps
        // to destination >= 4.
        let mut hw = vec![0u8; 2048];
        hw[..1024].fill(1);
        hw[1024..].fill(9);
        let out = output_reorg(&hw, 1, 4).unwrap();
        assert_eq!(out, vec![1, 1, 1, 1]);
    }

    #[test]
    fn small_batch_discards_upper_lanes() {
        let hw: Vec<u8> = (0..64).collect();
        let out = output_reorg(&hw, 16, 2).unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(out, (0..32).collect::<Vec<u8>>());
    }

    #[test]
    fn rejects_zero_out_size() {
        assert!(matches!(
            output_reorg(&[0; 64], 0, 4),
            Err(DpuError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_overflowing_sizes() {
        assert!(matches!(
            output_reorg(&[0; 64], usize::MAX / 2, 4),
            Err(DpuError::InvalidConfig { .. })
        ));
        assert!(matches!(
            output_reorg(&[0; 64], 16, usize::MAX),
            Err(DpuError::InvalidConfig { .. })
        ));
    }
}
