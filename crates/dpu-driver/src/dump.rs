//! Debug dump writer
//!
//! Writes the text artifacts of one pass into a directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `inputDmem.txt` | standard input, dmem format |
//! | `inputsStd.txt` | input values before interleave |
//! | `inputBatchInterleaved.txt` / `inputBatchInterleaveDmem.txt` | hardware-layout input |
//! | `paramsdmem.txt` | parameter image, dmem format |
//! | `goldenFlattened.txt` / `goldenOutputDmem.txt` | golden reference |
//! | `outBoard.txt` / `outBoardDmem.txt` | result straight from the board |
//! | `outStdFormat.txt` / `outStdDmem.txt` | result after output reorg |
//! | `regVals.txt` | programmed register values |
//! | `comparisonAgainstGolden.txt` | verification report |
//!
//! Each file starts with a one-line header.

use crate::error::Result;
use crate::golden::{ComparisonReport, GoldenReference};
use crate::layout::{dmem_encode, render_dmem, DmemRegion};
use crate::program::RegisterWriteList;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const RULE: &str = "*****************************************************";

/// Dump directory for one controller
#[derive(Debug, Clone)]
pub struct DebugDump {
    dir: PathBuf,
}

impl DebugDump {
    /// Use `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Debug dumps go to {}", dir.display());
        Ok(Self { dir })
    }

    /// Dump directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, name: &str, contents: &str) -> Result<()> {
        let path = self.dir.join(name);
        fs::write(&path, contents)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn write_values(&self, name: &str, header: &str, values: &[u8]) -> Result<()> {
        self.write(name, &flatten(header, values))
    }

    fn write_dmem(&self, name: &str, label: &str, values: &[u8], region: DmemRegion) -> Result<()> {
        self.write(name, &render_dmem(label, &dmem_encode(values, region)))
    }

    /// Standard-layout input
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub fn input(&self, input: &[u8]) -> Result<()> {
        self.write_dmem("inputDmem.txt", "input", input, DmemRegion::Input)
    }

    /// Values entering the interleaver
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub fn input_std(&self, values: &[u8], augmented: bool) -> Result<()> {
        let header = if augmented {
            "int8 input values before batch interleave, after channel augmentation"
        } else {
            "int8 input values before batch interleave"
        };
        self.write_values("inputsStd.txt", header, values)
    }

    /// Hardware-layout input
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub fn interleaved(&self, hw: &[u8]) -> Result<()> {
        self.write_values(
            "inputBatchInterleaved.txt",
            "int8 input values after batch interleave",
            hw,
        )?;
        self.write_dmem(
            "inputBatchInterleaveDmem.txt",
            "inputBatchInterleaved",
            hw,
            DmemRegion::Interleaved,
        )
    }

    /// Parameter image
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub fn params(&self, params: &[u8]) -> Result<()> {
        self.write_dmem("paramsdmem.txt", "params", params, DmemRegion::Params)
    }

    /// Golden reference, flattened and in dmem format
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub fn golden(&self, golden: &GoldenReference) -> Result<()> {
        self.write_values(
            "goldenFlattened.txt",
            "int8 golden output values",
            golden.as_bytes(),
        )?;
        self.write_dmem(
            "goldenOutputDmem.txt",
            "golden output",
            golden.as_bytes(),
            DmemRegion::Output,
        )
    }

    /// Board result before and after output reorg
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub fn outputs(&self, board: &[u8], standard: &[u8]) -> Result<()> {
        self.write_values(
            "outBoard.txt",
            "int8 output values straight from board, not yet output reorganized",
            board,
        )?;
        self.write_dmem(
            "outBoardDmem.txt",
            "outputs straight from board, not converted to std format",
            board,
            DmemRegion::Output,
        )?;
        self.write_values(
            "outStdFormat.txt",
            "int8 output values reorganized to standard format, NHWC",
            standard,
        )?;
        self.write_dmem(
            "outStdDmem.txt",
            "outputs converted to std NHWC format",
            standard,
            DmemRegion::Output,
        )
    }

    /// Programmed register values
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub fn registers(&self, writes: &RegisterWriteList) -> Result<()> {
        let text = format!(
            "{RULE}\nregister values programmed onto the kernel\n{}{RULE}\n",
            writes.render()
        );
        self.write("regVals.txt", &text)
    }

    /// Verification report
    ///
    /// # Errors
    ///
    /// Returns `Io` on write failure.
    pub fn comparison(&self, report: &ComparisonReport) -> Result<()> {
        self.write("comparisonAgainstGolden.txt", &format!("{RULE}\n{}", report.render()))
    }
}

/// `idx: i int8 val: v` lines under a header
fn flatten(header: &str, values: &[u8]) -> String {
    let mut out = String::with_capacity(values.len() * 24 + header.len() + RULE.len() + 2);
    let _ = writeln!(out, "{RULE}\n{header}");
    for (i, &v) in values.iter().enumerate() {
        let _ = writeln!(out, "idx: {i} int8 val: {}", v as i8);
    }
    out
}
