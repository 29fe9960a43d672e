//! Fixed-point conversion between `f32` tensors and the device's int8 data.
//!
//! A tensor with fix point `fp` stores `x` as `x * 2^fp` truncated toward
//! zero. Out-of-range products saturate at the int8 limits.

/// Input scale for fix point `fp`: `2^fp`
pub fn input_scale(fix_point: i32) -> f32 {
    2f32.powi(fix_point)
}

/// Output scale for fix point `fp`: `2^-fp`
pub fn output_scale(fix_point: i32) -> f32 {
    2f32.powi(-fix_point)
}

/// Convert floats to int8 with fix point `fix_point`.
#[allow(clippy::cast_possible_truncation)]
pub fn float_to_fix(src: &[f32], fix_point: i32) -> Vec<u8> {
    let scale = input_scale(fix_point);
    src.iter().map(|&x| (x * scale) as i8 as u8).collect()
}

/// Convert int8 with fix point `fix_point` back to floats.
pub fn fix_to_float(src: &[u8], fix_point: i32) -> Vec<f32> {
    let scale = output_scale(fix_point);
    src.iter().map(|&b| f32::from(b as i8) * scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_are_powers_of_two() {
        assert!((input_scale(3) - 8.0).abs() < f32::EPSILON);
        assert!((output_scale(3) - 0.125).abs() < f32::EPSILON);
        assert!((input_scale(-1) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn float_to_fix_truncates_and_saturates() {
        let fixed = float_to_fix(&[1.0, -1.0, 0.99, -0.99, 100.0, -100.0], 2);
        let signed: Vec<i8> = fixed.iter().map(|&b| b as i8).collect();
        assert_eq!(signed, vec![4, -4, 3, -3, 127, -128]);
    }

    #[test]
    fn fix_to_float_applies_negative_power() {
        let floats = fix_to_float(&[4, 0xFC, 0x7F], 2);
        assert_eq!(floats, vec![1.0, -1.0, 31.75]);
    }
}
