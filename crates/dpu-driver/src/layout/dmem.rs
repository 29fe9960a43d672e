//! Canonical dmem dump encoding, line-compatible with the simulator's memory
//! view.
//!
//! ```text
//! 0x0000000010000040 : 3f3e3d...0201
//!   address = word_index*64 + base      64 bytes, last byte first
//! ```

use crate::error::{DpuError, Result};
use dpu_chip::geometry::{dmem, WORD_BYTES};
use std::fmt::{self, Write as _};
use std::str::FromStr;

/// Memory region a dump belongs to; selects the base address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmemRegion {
    /// Raw standard input
    Input,
    /// Batch-interleaved input
    Interleaved,
    /// Parameter stream
    Params,
    /// Outputs, golden references and anything else
    Output,
}

impl DmemRegion {
    /// Base address of the region
    pub const fn base(self) -> u64 {
        match self {
            Self::Input | Self::Interleaved => dmem::INPUT_BASE,
            Self::Params => dmem::PARAMS_BASE,
            Self::Output => dmem::OUTPUT_BASE,
        }
    }
}

impl FromStr for DmemRegion {
    type Err = DpuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "input" => Ok(Self::Input),
            "interleaved" | "inputBatchInterleaved" => Ok(Self::Interleaved),
            "params" => Ok(Self::Params),
            "output" => Ok(Self::Output),
            other => Err(DpuError::invalid_config(format!("unknown dmem region '{other}'"))),
        }
    }
}

/// One 64-byte word of a dmem dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmemLine {
    /// Word address including the region base
    pub address: u64,
    /// 128 hex digits, last byte of the word first
    pub hex: String,
}

impl fmt::Display for DmemLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x} : {}", self.address, self.hex)
    }
}

/// Encode `buffer` at the base address of `region`.
pub fn dmem_encode(buffer: &[u8], region: DmemRegion) -> Vec<DmemLine> {
    dmem_encode_at(buffer, region.base())
}

/// Encode `buffer` as 64-byte words starting at `base`.
///
/// A trailing partial word is padded with zero bytes.
pub fn dmem_encode_at(buffer: &[u8], base: u64) -> Vec<DmemLine> {
    buffer
        .chunks(WORD_BYTES)
        .enumerate()
        .map(|(index, word)| {
            let mut hex = String::with_capacity(WORD_BYTES * 2);
            for _ in word.len()..WORD_BYTES {
                hex.push_str("00");
            }
            for byte in word.iter().rev() {
                // Writing into a String cannot fail
                let _ = write!(hex, "{byte:02x}");
            }
            DmemLine {
                address: (index * WORD_BYTES) as u64 + base,
                hex,
            }
        })
        .collect()
}

/// Render a complete dump with its `dmem format of <label>` header.
pub fn render_dmem(label: &str, lines: &[DmemLine]) -> String {
    let mut text = String::with_capacity((lines.len() + 1) * (WORD_BYTES * 2 + 24));
    let _ = writeln!(text, "dmem format of {label}");
    for line in lines {
        let _ = writeln!(text, "{line}");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_reversed_within_a_word() {
        let word: Vec<u8> = (0..64).collect();
        let lines = dmem_encode(&word, DmemRegion::Input);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].hex.starts_with("3f3e3d"));
        assert!(lines[0].hex.ends_with("020100"));
        assert_eq!(lines[0].hex.len(), 128);
    }

    #[test]
    fn address_column_uses_region_base() {
        let buf = vec![0xABu8; 128];
        let lines = dmem_encode(&buf, DmemRegion::Output);
        assert!(lines[0].to_string().starts_with("0x0000000010000000 : abab"));
        assert_eq!(lines[1].address, 0x1000_0040);

        let params = dmem_encode(&buf, DmemRegion::Params);
        assert!(params[1].to_string().starts_with("0x0000000030000040 : "));
        assert_eq!(dmem_encode(&buf, DmemRegion::Interleaved)[1].address, 0x40);
    }

    #[test]
    fn signed_values_print_as_twos_complement() {
        let mut buf = vec![0u8; 64];
        buf[63] = (-1i8) as u8;
        buf[62] = (-128i8) as u8;
        let lines = dmem_encode(&buf, DmemRegion::Input);
        assert!(lines[0].hex.starts_with("ff80"));
    }

    #[test]
    fn partial_word_is_zero_padded() {
        let lines = dmem_encode(&[1, 2], DmemRegion::Input);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].hex.ends_with("0201"));
        assert!(lines[0].hex[..124].chars().all(|c| c == '0'));
    }

    #[test]
    fn render_adds_header() {
        let lines = dmem_encode(&[0u8; 64], DmemRegion::Params);
        let text = render_dmem("params", &lines);
        let mut it = text.lines();
        assert_eq!(it.next(), Some("dmem format of params"));
        assert!(it.next().unwrap().starts_with("0x0000000030000000 : 00"));
        assert_eq!(it.next(), None);
    }
}
