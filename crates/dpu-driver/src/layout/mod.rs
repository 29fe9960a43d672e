//! Layout transforms between the host's standard NHWC layout and the
//! accelerator's channel-parallel layout.
//!
//! | Transform | Direction |
//! |-----------|-----------|
//! | [`channel_augment`] | NHWC → NHWC with stride folded into channels |
//! | [`batch_interleave`] | NHWC → hardware (wide or narrow) |
//! | [`dru_pack`] | NHWC → 32-bit words for the on-chip reorg unit |
//! | [`output_reorg`] | hardware result → NHWC |
//! | [`dmem_encode`] | any buffer → simulator memory dump lines |
//!
//! Every transform works on a borrowed buffer plus its [`TensorShape`]
//! (or explicit sizes) and returns a new buffer; inputs are never mutated.
//!
//! [`TensorShape`]: crate::shape::TensorShape

mod augment;
mod dmem;
mod dru;
mod interleave;
mod reorg;

pub use augment::{channel_augment, AugmentParams};
pub use dmem::{dmem_encode, dmem_encode_at, render_dmem, DmemLine, DmemRegion};
pub use dru::dru_pack;
pub use interleave::{batch_interleave, InterleaveConfig, InterleaveMode, PaddingPolicy};
pub use reorg::output_reorg;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::TensorShape;

    #[test]
    fn reorg_inverts_wide_interleave() {
        for (h, w) in [(1usize, 1usize), (2, 3), (4, 4)] {
            let shape = TensorShape::int8(4, h, w, 16);
            let input: Vec<u8> = (0..shape.element_count().unwrap()).map(|i| (i * 7 % 251) as u8).collect();
            let hw = batch_interleave(&input, &shape, &InterleaveConfig::default()).unwrap();
            let back = output_reorg(&hw, h * w * 16, 4).unwrap();
            assert_eq!(back, input, "H={h} W={w}");
        }
    }

    #[test]
    fn augmented_buffer_feeds_interleave() {
        let shape = TensorShape::int8(4, 2, 8, 3);
        let input = vec![1u8; shape.element_count().unwrap()];
        let (aug, aug_shape) = channel_augment(&input, &shape, &AugmentParams::new(3, 2, 1)).unwrap();
        let hw = batch_interleave(&aug, &aug_shape, &InterleaveConfig::default()).unwrap();
        // 9 augmented channels pad to one group of 16
        assert_eq!(hw.len(), 4 * 16 * 4 * 2);
    }
}
