//! Golden-output verification
//!
//! A [`GoldenReference`] is the expected standard-layout output of one pass,
//! loaded once. [`GoldenReference::compare`] checks a reorganized board
//! output against it element by element (signed 8-bit) and reports every
//! mismatch plus the L2 distance over the mismatching elements. Mismatches
//! are data in the report; only a length difference is an error.

use crate::error::{DpuError, Result};
use bytes::Bytes;
use std::fmt::{self, Write as _};
use std::path::Path;
use tracing::{debug, info, warn};

/// One differing element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Element index in the standard layout
    pub index: usize,
    /// Board value
    pub actual: i8,
    /// Golden value
    pub expected: i8,
}

/// Outcome of one comparison
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComparisonReport {
    /// Number of elements compared
    pub compared: usize,
    /// Every mismatching element, in index order
    pub mismatches: Vec<Mismatch>,
    /// Square root of the summed squared differences
    pub distance: f64,
}

impl ComparisonReport {
    /// True when every element matched
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Number of mismatching elements
    pub fn mismatch_count(&self) -> usize {
        self.mismatches.len()
    }

    /// One-line verdict
    pub fn summary(&self) -> String {
        if self.passed() {
            "RESULT: SUCCESS, all outputs converted to standard format match the golden reference".to_string()
        } else {
            format!(
                "RESULT: FAIL, {} values mismatch between outputs converted to standard format and golden values",
                self.mismatch_count()
            )
        }
    }

    /// Full text report: mismatch lines, then distance and verdict.
    pub fn render(&self) -> String {
        let mut out = String::from(
            "Comparison of outputs in standard NHWC format against the golden reference (int8 values of mismatching indices)\n",
        );
        for m in &self.mismatches {
            let _ = writeln!(
                out,
                "Mismatch at idx: {} int8 board std value: {} int8 golden output value: {}",
                m.index, m.actual, m.expected
            );
        }
        if !self.passed() {
            let _ = writeln!(out, "L2 difference: {}", self.distance);
        }
        out.push_str(&self.summary());
        out.push('\n');
        out
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            write!(f, "{}/{} match", self.compared, self.compared)
        } else {
            write!(
                f,
                "{} of {} mismatch, L2 {:.3}",
                self.mismatch_count(),
                self.compared,
                self.distance
            )
        }
    }
}

/// Immutable expected output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldenReference {
    data: Bytes,
}

impl GoldenReference {
    /// Reference from raw int8 bytes
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Load a raw int8 binary file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        info!("Loaded golden reference {}: {} int8 values", path.display(), data.len());
        Ok(Self::from_bytes(data))
    }

    /// Reference bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the reference is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reference values as signed 8-bit
    pub fn values(&self) -> impl Iterator<Item = i8> + '_ {
        self.data.iter().map(|&b| b as i8)
    }

    /// Compare `actual` against the reference.
    ///
    /// # Errors
    ///
    /// Returns `GoldenSizeMismatch` if the lengths differ.
    pub fn compare(&self, actual: &[u8]) -> Result<ComparisonReport> {
        if actual.len() != self.data.len() {
            return Err(DpuError::GoldenSizeMismatch {
                actual: actual.len(),
                expected: self.data.len(),
            });
        }

        let mut mismatches = Vec::new();
        let mut squared = 0.0f64;
        for (index, (&a, &e)) in actual.iter().zip(self.data.iter()).enumerate() {
            let (actual, expected) = (a as i8, e as i8);
            if actual != expected {
                let diff = f64::from(i32::from(actual) - i32::from(expected));
                squared += diff * diff;
                mismatches.push(Mismatch {
                    index,
                    actual,
                    expected,
                });
            }
        }

        let report = ComparisonReport {
            compared: actual.len(),
            mismatches,
            distance: squared.sqrt(),
        };
        if report.passed() {
            debug!("Golden comparison passed ({} values)", report.compared);
        } else {
            warn!("Golden comparison: {report}");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_outputs_pass() {
        let golden = GoldenReference::from_bytes(vec![1u8, 2, 3, 4]);
        let report = golden.compare(&[1, 2, 3, 4]).unwrap();
        assert!(report.passed());
        assert_eq!(report.mismatch_count(), 0);
        assert!(report.distance.abs() < f64::EPSILON);
        assert!(report.render().contains("RESULT: SUCCESS"));
    }

    #[test]
    fn single_mismatch_is_reported() {
        let golden = GoldenReference::from_bytes(vec![1u8, 2, 3, 5]);
        let report = golden.compare(&[1, 2, 3, 4]).unwrap();
        assert!(!report.passed());
        assert_eq!(
            report.mismatches,
            vec![Mismatch {
                index: 3,
                actual: 4,
                expected: 5
            }]
        );
        assert!((report.distance - 1.0).abs() < 1e-12);
        let text = report.render();
        assert!(text.contains("Mismatch at idx: 3 int8 board std value: 4 int8 golden output value: 5"));
        assert!(text.contains("L2 difference: 1"));
        assert!(text.contains("RESULT: FAIL, 1 values mismatch"));
    }

    #[test]
    fn length_difference_is_fatal() {
        let golden = GoldenReference::from_bytes(vec![1u8, 2, 3, 4, 5]);
        assert!(matches!(
            golden.compare(&[1, 2, 3, 4]),
            Err(DpuError::GoldenSizeMismatch {
                actual: 4,
                expected: 5
            })
        ));
    }

    #[test]
    fn values_are_signed() {
        let golden = GoldenReference::from_bytes(vec![0xFFu8, 0x7F]);
        assert_eq!(golden.values().collect::<Vec<_>>(), vec![-1, 127]);
        // -1 vs 1: distance 2
        let report = golden.compare(&[0x01, 0x7F]).unwrap();
        assert!((report.distance - 2.0).abs() < 1e-12);
    }

    #[test]
    fn load_reads_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("golden.bin");
        std::fs::write(&path, [9u8, 8, 7]).unwrap();
        let golden = GoldenReference::load(&path).unwrap();
        assert_eq!(golden.as_bytes(), &[9, 8, 7]);
        assert!(matches!(
            GoldenReference::load(dir.path().join("missing.bin")),
            Err(DpuError::Io { .. })
        ));
    }
}
