//! Channel augmentation: folds the horizontal convolution stride into the
//! channel dimension so the compute array can run the layer as stride 1.

use crate::error::{DpuError, Result};
use crate::shape::TensorShape;
use tracing::debug;

/// Parameters of the first convolution layer that drive augmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AugmentParams {
    /// Convolution kernel width
    pub kernel_width: usize,
    /// Horizontal stride
    pub stride_width: usize,
    /// Left padding
    pub pad_left: usize,
}

impl AugmentParams {
    /// Create augmentation parameters
    pub const fn new(kernel_width: usize, stride_width: usize, pad_left: usize) -> Self {
        Self {
            kernel_width,
            stride_width,
            pad_left,
        }
    }

    /// Shape of the augmented buffer for a given source shape
    ///
    /// Width is `floor(width / stride)` and channels are multiplied by the
    /// kernel width.
    pub const fn output_shape(&self, src: &TensorShape) -> TensorShape {
        TensorShape::new(
            src.batch,
            src.height,
            src.width / self.stride_width,
            src.channels * self.kernel_width,
            src.kind,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.kernel_width == 0 || self.stride_width == 0 {
            return Err(DpuError::invalid_config(format!(
                "channel augmentation needs non-zero kernel and stride (kw={}, sw={})",
                self.kernel_width, self.stride_width
            )));
        }
        Ok(())
    }
}

/// Produce the augmented NHWC buffer.
///
/// For output column `w` and augmented channel `c`, the source column is
/// `stride*w - pad_left + c / src_channels` and the source channel is
/// `c % src_channels`. Source columns outside `[0, src_width)` are written as
/// zero.
///
/// # Errors
///
/// Returns `ShapeMismatch` when `input` does not hold `shape`, and
/// `InvalidConfig` for a zero kernel width or stride.
pub fn channel_augment(
    input: &[u8],
    shape: &TensorShape,
    params: &AugmentParams,
) -> Result<(Vec<u8>, TensorShape)> {
    params.validate()?;
    shape.validate_buffer("channel augmentation input", input.len())?;

    let elem = shape.element_width()?;
    let dst = params.output_shape(shape);
    let mut out = vec![0u8; dst.byte_len()?];

    let src_w = shape.width as i64;
    let src_c = shape.channels;
    for b in 0..dst.batch {
        for h in 0..dst.height {
            for w in 0..dst.width {
                for c in 0..dst.channels {
                    // Widths are bounded by allocation size, well inside i64
                    #[allow(clippy::cast_possible_wrap)]
                    let sw = (params.stride_width * w) as i64 - params.pad_left as i64
                        + (c / src_c) as i64;
                    if sw < 0 || sw >= src_w {
                        continue;
                    }
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                    let from = shape.index(b, h, sw as usize, c % src_c) * elem;
                    let to = dst.index(b, h, w, c) * elem;
                    out[to..to + elem].copy_from_slice(&input[from..from + elem]);
                }
            }
        }
    }

    debug!("Channel augmentation {shape} -> {dst} (kw={}, sw={}, pl={})",
        params.kernel_width, params.stride_width, params.pad_left);
    Ok((out, dst))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: &TensorShape) -> Vec<u8> {
        (0..shape.element_count().unwrap()).map(|i| (i % 250 + 1) as u8).collect()
    }

    #[test]
    fn output_shape_folds_stride_into_channels() {
        let src = TensorShape::int8(2, 4, 9, 3);
        let dst = AugmentParams::new(3, 2, 1).output_shape(&src);
        assert_eq!((dst.batch, dst.height, dst.width, dst.channels), (2, 4, 4, 9));
    }

    #[test]
    fn identity_when_kernel_and_stride_are_one() {
        let shape = TensorShape::int8(1, 2, 3, 4);
        let input = ramp(&shape);
        let (out, dst) = channel_augment(&input, &shape, &AugmentParams::new(1, 1, 0)).unwrap();
        assert_eq!(dst, shape);
        assert_eq!(out, input);
    }

    #[test]
    fn copies_neighbouring_columns_into_channels() {
        // 1x1x4x1: values 1,2,3,4; kw=3, sw=1, pad=1
        let shape = TensorShape::int8(1, 1, 4, 1);
        let input = vec![1u8, 2, 3, 4];
        let (out, dst) = channel_augment(&input, &shape, &AugmentParams::new(3, 1, 1)).unwrap();
        assert_eq!(dst.channels, 3);
        assert_eq!(out, vec![0, 1, 2, 1, 2, 3, 2, 3, 4, 3, 4, 0]);
    }

    #[test]
    fn out_of_range_columns_are_zero_for_all_params() {
        let shape = TensorShape::int8(2, 2, 6, 2);
        let input = ramp(&shape);
        for kw in [1usize, 3] {
            for sw in [1usize, 2] {
                for pl in [0usize, 1, 2] {
                    let params = AugmentParams::new(kw, sw, pl);
                    let (out, dst) = channel_augment(&input, &shape, &params).unwrap();
                    for b in 0..dst.batch {
                        for h in 0..dst.height {
                            for w in 0..dst.width {
                                for c in 0..dst.channels {
                                    let src_w = (sw * w + c / shape.channels) as i64 - pl as i64;
                                    let v = out[dst.index(b, h, w, c)];
                                    if src_w < 0 || src_w >= shape.width as i64 {
                                        assert_eq!(v, 0, "kw={kw} sw={sw} pl={pl} w={w} c={c}");
                                    } else {
                                        let expect = input[shape.index(b, h, src_w as usize, c % shape.channels)];
                                        assert_eq!(v, expect);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn wider_elements_move_whole() {
        let shape = TensorShape::new(1, 1, 2, 1, crate::shape::DataKind::Int16);
        let input = vec![0x11, 0x12, 0x21, 0x22];
        let (out, _) = channel_augment(&input, &shape, &AugmentParams::new(2, 1, 0)).unwrap();
        assert_eq!(out, vec![0x11, 0x12, 0x21, 0x22, 0x21, 0x22, 0, 0]);
    }

    #[test]
    fn rejects_short_input() {
        let shape = TensorShape::int8(1, 1, 4, 1);
        let err = channel_augment(&[1, 2, 3], &shape, &AugmentParams::new(1, 1, 0)).unwrap_err();
        assert!(matches!(err, DpuError::ShapeMismatch { .. }));
    }

    #[test]
    fn rejects_zero_stride() {
        let shape = TensorShape::int8(1, 1, 4, 1);
        let err = channel_augment(&[1, 2, 3, 4], &shape, &AugmentParams::new(1, 0, 0)).unwrap_err();
        assert!(matches!(err, DpuError::InvalidConfig { .. }));
    }
}
