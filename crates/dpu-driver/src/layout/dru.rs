//! Host-side pack for data-reorg-unit (DRU) mode.
//!
//! With the DRU enabled the hardware reorganizes the input itself; the host
//! only places `batch` consecutive standard bytes into each 32-bit word.

use crate::error::{DpuError, Result};
use dpu_chip::geometry::OUTPUT_LANES;
use tracing::debug;

/// Pack `input` into 32-bit words of `batch` bytes each.
///
/// Bytes keep their memory order inside a word; unused high bytes are zero.
/// For `batch == 4` the result equals the input.
///
/// # Errors
///
/// Returns `InvalidConfig` when `batch` is outside `1..=4` and
/// `ShapeMismatch` when the input length is not a multiple of `batch`.
pub fn dru_pack(input: &[u8], batch: usize) -> Result<Vec<u8>> {
    if !(1..=OUTPUT_LANES).contains(&batch) {
        return Err(DpuError::invalid_config(format!(
            "DRU pack needs batch in 1..={OUTPUT_LANES}, got {batch}"
        )));
    }
    if input.len() % batch != 0 {
        return Err(DpuError::shape_mismatch(
            format!("DRU pack input (batch {batch})"),
            input.len().next_multiple_of(batch),
            input.len(),
        ));
    }

    let mut words = vec![0u32; input.len() / batch];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
    for (word, chunk) in bytes.chunks_exact_mut(4).zip(input.chunks_exact(batch)) {
        word[..batch].copy_from_slice(chunk);
    }

    debug!("DRU pack: {} bytes -> {} words", input.len(), words.len());
    Ok(bytemuck::cast_slice(&words).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_four_is_identity() {
        let input: Vec<u8> = (0..32).collect();
        assert_eq!(dru_pack(&input, 4).unwrap(), input);
    }

    #[test]
    fn batch_two_pads_each_word() {
        let out = dru_pack(&[1, 2, 3, 4], 2).unwrap();
        assert_eq!(out, vec![1, 2, 0, 0, 3, 4, 0, 0]);
    }

    #[test]
    fn rejects_batch_out_of_range() {
        assert!(matches!(dru_pack(&[0; 8], 0), Err(DpuError::InvalidConfig { .. })));
        assert!(matches!(dru_pack(&[0; 8], 5), Err(DpuError::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_ragged_input() {
        assert!(matches!(dru_pack(&[0; 7], 2), Err(DpuError::ShapeMismatch { .. })));
    }
}
