//! Tensor shapes and the element size table
//!
//! Every byte-size computation in the driver goes through
//! [`DataKind::byte_width`], which reads the static [`SIZE_TABLE`].

use crate::error::{DpuError, Result};
use std::fmt;
use std::str::FromStr;

/// Element data kind as declared by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 8-bit integer
    Uint8,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 16-bit integer
    Uint16,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 32-bit integer
    Uint32,
    /// IEEE-754 single precision
    Float32,
    /// IEEE-754 double precision
    Float64,
}

impl DataKind {
    /// Every kind the driver knows about.
    pub const ALL: [Self; 8] = [
        Self::Int8,
        Self::Uint8,
        Self::Int16,
        Self::Uint16,
        Self::Int32,
        Self::Uint32,
        Self::Float32,
        Self::Float64,
    ];

    /// Byte width of one element, from [`SIZE_TABLE`].
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDataKind` if the table has no entry for `self`.
    pub fn byte_width(self) -> Result<usize> {
        SIZE_TABLE
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|&(_, width)| width)
            .ok_or_else(|| DpuError::unsupported_data_kind(self.name()))
    }

    /// Canonical lower-case name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataKind {
    type Err = DpuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int8" | "i8" | "xint8" => Ok(Self::Int8),
            "uint8" | "u8" => Ok(Self::Uint8),
            "int16" | "i16" => Ok(Self::Int16),
            "uint16" | "u16" => Ok(Self::Uint16),
            "int32" | "i32" => Ok(Self::Int32),
            "uint32" | "u32" => Ok(Self::Uint32),
            "float" | "float32" | "f32" => Ok(Self::Float32),
            "double" | "float64" | "f64" => Ok(Self::Float64),
            other => Err(DpuError::unsupported_data_kind(other)),
        }
    }
}

/// Data kind to element byte width.
pub const SIZE_TABLE: [(DataKind, usize); 8] = [
    (DataKind::Int8, 1),
    (DataKind::Uint8, 1),
    (DataKind::Int16, 2),
    (DataKind::Uint16, 2),
    (DataKind::Int32, 4),
    (DataKind::Uint32, 4),
    (DataKind::Float32, 4),
    (DataKind::Float64, 8),
];

/// Check that every [`DataKind`] has a table entry.
///
/// Run once at controller construction so a kind added without a width fails
/// before any buffer is sized.
///
/// # Errors
///
/// Returns `UnsupportedDataKind` naming the first kind without an entry.
pub fn validate_size_table() -> Result<()> {
    for kind in DataKind::ALL {
        kind.byte_width()?;
    }
    Ok(())
}

/// NHWC tensor shape with its element kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
    /// Batch dimension (outermost)
    pub batch: usize,
    /// Rows
    pub height: usize,
    /// Columns
    pub width: usize,
    /// Channels (innermost)
    pub channels: usize,
    /// Element kind
    pub kind: DataKind,
}

impl TensorShape {
    /// Create an NHWC shape
    pub const fn new(batch: usize, height: usize, width: usize, channels: usize, kind: DataKind) -> Self {
        Self {
            batch,
            height,
            width,
            channels,
            kind,
        }
    }

    /// Signed 8-bit NHWC shape, the common case for this accelerator
    pub const fn int8(batch: usize, height: usize, width: usize, channels: usize) -> Self {
        Self::new(batch, height, width, channels, DataKind::Int8)
    }

    /// Build from collaborator-supplied dimensions and a declared kind name.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDataKind` for an unknown kind and `InvalidConfig`
    /// when `dims` is not four-dimensional.
    pub fn from_declared(dims: &[usize], kind: &str) -> Result<Self> {
        let kind: DataKind = kind.parse()?;
        match *dims {
            [batch, height, width, channels] => Ok(Self::new(batch, height, width, channels, kind)),
            _ => Err(DpuError::invalid_config(format!(
                "expected NHWC dimensions, got {} dims",
                dims.len()
            ))),
        }
    }

    /// Same shape with a different batch dimension
    #[must_use]
    pub const fn with_batch(self, batch: usize) -> Self {
        Self { batch, ..self }
    }

    /// Number of elements
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the product overflows `usize`.
    pub fn element_count(&self) -> Result<usize> {
        [self.height, self.width, self.channels]
            .into_iter()
            .try_fold(self.batch, usize::checked_mul)
            .ok_or_else(|| DpuError::invalid_config(format!("element count of {self} overflows")))
    }

    /// Element byte width from the size table
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDataKind` if the kind has no table entry.
    pub fn element_width(&self) -> Result<usize> {
        self.kind.byte_width()
    }

    /// Total byte length
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDataKind` if the kind has no table entry and
    /// `InvalidConfig` if the length overflows `usize`.
    pub fn byte_len(&self) -> Result<usize> {
        self.element_count()?
            .checked_mul(self.element_width()?)
            .ok_or_else(|| DpuError::invalid_config(format!("byte length of {self} overflows")))
    }

    /// Linear NHWC index of `(b, h, w, c)`
    pub const fn index(&self, b: usize, h: usize, w: usize, c: usize) -> usize {
        ((b * self.height + h) * self.width + w) * self.channels + c
    }

    /// Check that a buffer of `len` bytes holds exactly this shape.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` when the lengths disagree.
    pub fn validate_buffer(&self, context: &str, len: usize) -> Result<()> {
        let expected = self.byte_len()?;
        if expected != len {
            return Err(DpuError::shape_mismatch(
                format!("{context} {self}"),
                expected,
                len,
            ));
        }
        Ok(())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}] {}",
            self.batch, self.height, self.width, self.channels, self.kind
        )
    }
}
