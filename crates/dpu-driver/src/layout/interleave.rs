//! Batch interleave: NHWC standard layout to the channel-parallel hardware
//! layout.
//!
//! ```text
//! for h, for w, for channel group g, for batch b:
//!     wide:   P bytes, channel g*P + i
//!     narrow: P/4 bytes, four 2-bit channels per byte (bits 2k..2k+1 = sub-index k)
//! ```

use crate::error::{DpuError, Result};
use crate::shape::TensorShape;
use dpu_chip::geometry::{NARROW_FIELDS_PER_BYTE, NARROW_FIELD_BITS, PARALLELISM};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Input buffer encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterleaveMode {
    /// One byte per channel
    #[default]
    Wide,
    /// Four 2-bit channels per byte
    Narrow,
}

impl fmt::Display for InterleaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wide => write!(f, "wide"),
            Self::Narrow => write!(f, "narrow"),
        }
    }
}

impl FromStr for InterleaveMode {
    type Err = DpuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wide" | "8" => Ok(Self::Wide),
            "narrow" | "2" => Ok(Self::Narrow),
            other => Err(DpuError::invalid_config(format!("unknown interleave mode '{other}'"))),
        }
    }
}

/// Value written into padding channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingPolicy {
    /// All bits clear
    #[default]
    Zero,
    /// All bits set (0xFF wide, 0b11 per narrow field)
    Max,
    /// Pseudo-random, reproducible from the seed
    Random {
        /// RNG seed
        seed: u64,
    },
}

impl fmt::Display for PaddingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "zero"),
            Self::Max => write!(f, "max"),
            Self::Random { seed } => write!(f, "random(seed={seed})"),
        }
    }
}

/// Batch interleave settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleaveConfig {
    /// Channels per hardware group
    pub parallelism: usize,
    /// Wide or narrow encoding
    pub mode: InterleaveMode,
    /// Padding channel fill
    pub padding: PaddingPolicy,
}

impl Default for InterleaveConfig {
    fn default() -> Self {
        Self {
            parallelism: PARALLELISM,
            mode: InterleaveMode::Wide,
            padding: PaddingPolicy::Zero,
        }
    }
}

impl InterleaveConfig {
    /// Set encoding mode
    #[must_use]
    pub const fn with_mode(mut self, mode: InterleaveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set padding policy
    #[must_use]
    pub const fn with_padding(mut self, padding: PaddingPolicy) -> Self {
        self.padding = padding;
        self
    }

    /// Set channel parallelism
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Channels rounded up to a whole number of groups
    pub const fn padded_channels(&self, channels: usize) -> usize {
        channels.div_ceil(self.parallelism) * self.parallelism
    }

    /// Bytes produced for one (pixel, group, batch) step
    pub const fn bytes_per_group(&self) -> usize {
        match self.mode {
            InterleaveMode::Wide => self.parallelism,
            InterleaveMode::Narrow => self.parallelism / NARROW_FIELDS_PER_BYTE,
        }
    }

    /// Length of the hardware buffer for `shape`
    ///
    /// Wide: `batch * ceil(C/P)*P * W * H`.
    pub const fn output_len(&self, shape: &TensorShape) -> usize {
        let groups = shape.channels.div_ceil(self.parallelism);
        shape.height * shape.width * groups * shape.batch * self.bytes_per_group()
    }

    fn validate(&self, shape: &TensorShape) -> Result<()> {
        if self.parallelism == 0 {
            return Err(DpuError::invalid_config("parallelism must be non-zero"));
        }
        if self.mode == InterleaveMode::Narrow && self.parallelism % NARROW_FIELDS_PER_BYTE != 0 {
            return Err(DpuError::invalid_config(format!(
                "narrow mode needs parallelism divisible by {NARROW_FIELDS_PER_BYTE}, got {}",
                self.parallelism
            )));
        }
        if shape.element_width()? != 1 {
            return Err(DpuError::unsupported_data_kind(format!(
                "{} (batch interleave takes 8-bit elements)",
                shape.kind
            )));
        }
        Ok(())
    }
}

/// Source of padding values for one interleave pass
enum Filler {
    Zero,
    Max,
    Random(StdRng),
}

impl Filler {
    fn new(policy: PaddingPolicy) -> Self {
        match policy {
            PaddingPolicy::Zero => Self::Zero,
            PaddingPolicy::Max => Self::Max,
            PaddingPolicy::Random { seed } => Self::Random(StdRng::seed_from_u64(seed)),
        }
    }

    fn byte(&mut self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Max => 0xFF,
            Self::Random(rng) => rng.gen(),
        }
    }

    /// Two-bit field value, unshifted
    fn field(&mut self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Max => 0b11,
            Self::Random(rng) => rng.gen_range(0..4),
        }
    }
}

/// Convert a standard NHWC buffer into the hardware layout.
///
/// Real channels copy the source byte (narrow: its low two bits). Channels
/// past the real channel count take the configured padding value. Narrow
/// padding fields are OR-ed into the byte alongside real fields.
///
/// # Errors
///
/// Returns `ShapeMismatch` if `input` does not hold `shape`,
/// `UnsupportedDataKind` for elements wider than one byte, and
/// `InvalidConfig` for an unusable parallelism.
pub fn batch_interleave(input: &[u8], shape: &TensorShape, config: &InterleaveConfig) -> Result<Vec<u8>> {
    config.validate(shape)?;
    shape.validate_buffer("batch interleave input", input.len())?;

    let p = config.parallelism;
    let groups = shape.channels.div_ceil(p);
    let mut filler = Filler::new(config.padding);
    let mut out = Vec::with_capacity(config.output_len(shape));

    for h in 0..shape.height {
        for w in 0..shape.width {
            for g in 0..groups {
                for b in 0..shape.batch {
                    let base = g * p;
                    match config.mode {
                        InterleaveMode::Wide => {
                            for i in 0..p {
                                let c = base + i;
                                let v = if c < shape.channels {
                                    input[shape.index(b, h, w, c)]
                                } else {
                                    filler.byte()
                                };
                                out.push(v);
                            }
                        }
                        InterleaveMode::Narrow => {
                            for pack in (0..p).step_by(NARROW_FIELDS_PER_BYTE) {
                                let mut byte = 0u8;
                                for k in 0..NARROW_FIELDS_PER_BYTE {
                                    let c = base + pack + k;
                                    let field = if c < shape.channels {
                                        input[shape.index(b, h, w, c)] & 0b11
                                    } else {
                                        filler.field()
                                    };
                                    #[allow(clippy::cast_possible_truncation)]
                                    let shift = k as u32 * NARROW_FIELD_BITS;
                                    byte |= field << shift;
                                }
                                out.push(byte);
                            }
                        }
                    }
                }
            }
        }
    }

    debug!(
        "Batch interleave {shape} -> {} bytes ({}, pad {}, P={p})",
        out.len(),
        config.mode,
        config.padding
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: &TensorShape) -> Vec<u8> {
        (0..shape.element_count().unwrap()).map(|i| (i % 127 + 1) as u8).collect()
    }

    #[test]
    fn wide_length_matches_padded_channels() {
        let cfg = InterleaveConfig::default();
        for c in [1usize, 15, 16, 17, 33] {
            let shape = TensorShape::int8(4, 3, 2, c);
            let out = batch_interleave(&ramp(&shape), &shape, &cfg).unwrap();
            assert_eq!(out.len(), 4 * c.div_ceil(16) * 16 * 2 * 3);
            assert_eq!(out.len(), cfg.output_len(&shape));
        }
    }

    #[test]
    fn narrow_length_is_quarter_of_wide() {
        let cfg = InterleaveConfig::default().with_mode(InterleaveMode::Narrow);
        let shape = TensorShape::int8(2, 2, 2, 20);
        let out = batch_interleave(&ramp(&shape), &shape, &cfg).unwrap();
        assert_eq!(out.len(), 2 * 2 * 2 * 2 * 4);
    }

    #[test]
    fn wide_order_is_pixel_group_batch_channel() {
        // B=2, H=1, W=1, C=2, P=2: [b0c0, b0c1, b1c0, b1c1]
        let shape = TensorShape::int8(2, 1, 1, 2);
        let input = vec![10u8, 11, 20, 21];
        let cfg = InterleaveConfig::default().with_parallelism(2);
        let out = batch_interleave(&input, &shape, &cfg).unwrap();
        assert_eq!(out, vec![10, 11, 20, 21]);
    }

    #[test]
    fn zero_padding_fills_zero() {
        let shape = TensorShape::int8(1, 1, 1, 3);
        let out = batch_interleave(&[1, 2, 3], &shape, &InterleaveConfig::default()).unwrap();
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert!(out[3..].iter().all(|&v| v == 0));
    }

    #[test]
    fn max_padding_fills_ff() {
        let shape = TensorShape::int8(2, 1, 1, 3);
        let cfg = InterleaveConfig::default().with_padding(PaddingPolicy::Max);
        let out = batch_interleave(&[1, 2, 3, 4, 5, 6], &shape, &cfg).unwrap();
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert!(out[3..16].iter().all(|&v| v == 0xFF));
        assert_eq!(&out[16..19], &[4, 5, 6]);
        assert!(out[19..].iter().all(|&v| v == 0xFF));
    }

    #[test]
    fn narrow_max_padding_sets_every_padded_field() {
        // Channels 0..5 real (value 0b01), 5..16 padding.
        let shape = TensorShape::int8(1, 1, 1, 5);
        let cfg = InterleaveConfig::default()
            .with_mode(InterleaveMode::Narrow)
            .with_padding(PaddingPolicy::Max);
        let out = batch_interleave(&[1, 1, 1, 1, 1], &shape, &cfg).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0b01_01_01_01);
        // channel 4 real, channels 5..7 padded
        assert_eq!(out[1], 0b11_11_11_01);
        assert_eq!(out[2], 0xFF);
        assert_eq!(out[3], 0xFF);
    }

    #[test]
    fn narrow_zero_padding_clears_padded_fields() {
        let shape = TensorShape::int8(1, 1, 1, 5);
        let cfg = InterleaveConfig::default().with_mode(InterleaveMode::Narrow);
        let out = batch_interleave(&[0xFF, 0xFE, 0xFD, 0xFC, 0xFF], &shape, &cfg).unwrap();
        assert_eq!(out, vec![0b00_01_10_11, 0b00_00_00_11, 0, 0]);
    }

    #[test]
    fn narrow_random_padding_draws_one_field_per_padded_channel() {
        let shape = TensorShape::int8(1, 1, 1, 5);
        let cfg = InterleaveConfig::default()
            .with_mode(InterleaveMode::Narrow)
            .with_padding(PaddingPolicy::Random { seed: 11 });
        let out = batch_interleave(&[1, 1, 1, 1, 1], &shape, &cfg).unwrap();
        assert_eq!(out, batch_interleave(&[1, 1, 1, 1, 1], &shape, &cfg).unwrap());

        let mut rng = StdRng::seed_from_u64(11);
        let mut expected = vec![0b01_01_01_01u8, 0b01];
        for k in 1..4 {
            expected[1] |= rng.gen_range(0..4u8) << (2 * k);
        }
        for _ in 0..2 {
            let mut byte = 0u8;
            for k in 0..4 {
                byte |= rng.gen_range(0..4u8) << (2 * k);
            }
            expected.push(byte);
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn narrow_keeps_low_two_bits() {
        let shape = TensorShape::int8(1, 1, 1, 4);
        let cfg = InterleaveConfig::default()
            .with_mode(InterleaveMode::Narrow)
            .with_parallelism(4);
        let out = batch_interleave(&[0xFC, 0xFD, 0xFE, 0xFF], &shape, &cfg).unwrap();
        assert_eq!(out, vec![0b11_10_01_00]);
    }

    #[test]
    fn random_padding_is_reproducible() {
        let shape = TensorShape::int8(4, 2, 2, 5);
        let input = ramp(&shape);
        let cfg = InterleaveConfig::default().with_padding(PaddingPolicy::Random { seed: 7 });
        let a = batch_interleave(&input, &shape, &cfg).unwrap();
        let b = batch_interleave(&input, &shape, &cfg).unwrap();
        assert_eq!(a, b);
        // real channels untouched
        assert_eq!(&a[..5], &input[..5]);
    }

    #[test]
    fn rejects_wrong_length() {
        let shape = TensorShape::int8(4, 2, 2, 16);
        let err = batch_interleave(&[0; 10], &shape, &InterleaveConfig::default()).unwrap_err();
        assert!(matches!(err, DpuError::ShapeMismatch { expected: 256, actual: 10, .. }));
    }

    #[test]
    fn rejects_wide_elements() {
        let shape = TensorShape::new(1, 1, 1, 2, crate::shape::DataKind::Int16);
        let err = batch_interleave(&[0; 4], &shape, &InterleaveConfig::default()).unwrap_err();
        assert!(matches!(err, DpuError::UnsupportedDataKind { .. }));
    }

    #[test]
    fn mode_parses_from_cli_names() {
        assert_eq!("wide".parse::<InterleaveMode>().unwrap(), InterleaveMode::Wide);
        assert_eq!("narrow".parse::<InterleaveMode>().unwrap(), InterleaveMode::Narrow);
        assert!("both".parse::<InterleaveMode>().is_err());
    }
}
