//! Error types for DPU driver operations

use crate::buffer::BufferRole;
use crate::exec::StageCounters;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for DPU operations
pub type Result<T> = std::result::Result<T, DpuError>;

/// Errors that can occur while preparing, running or verifying a DPU pass.
///
/// Every variant is fatal for the call that produced it. Element mismatches
/// against a golden reference are not errors; they are reported through
/// [`ComparisonReport`](crate::golden::ComparisonReport).
#[derive(Debug, Error)]
pub enum DpuError {
    /// Buffer length disagrees with the declared tensor shape
    #[error("Shape mismatch in {context}: expected {expected} bytes, got {actual}")]
    ShapeMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Byte length implied by the shape
        expected: usize,
        /// Byte length actually supplied
        actual: usize,
    },

    /// Element kind has no entry in the address size table
    #[error("Unsupported data kind: {kind}")]
    UnsupportedDataKind {
        /// Kind as declared by the caller
        kind: String,
    },

    /// Host or device memory could not be obtained
    #[error("Allocation failed: {reason}")]
    AllocationFailure {
        /// Reason for failure
        reason: String,
    },

    /// Address table lacks a role required by the active mode
    #[error("Missing address for buffer role {role}")]
    MissingBufferRole {
        /// The unpopulated role
        role: BufferRole,
    },

    /// Device did not signal completion within the retry budget
    #[error("CU timeout on compute unit {cu_index} after {attempts} attempts ({counters})")]
    ExecutionTimeout {
        /// Compute unit that stalled
        cu_index: u32,
        /// Polling attempts made
        attempts: u32,
        /// Stage counters captured after the timeout
        counters: StageCounters,
    },

    /// Verification input length differs from the golden reference
    #[error("Golden size mismatch: output has {actual} values, golden has {expected}")]
    GoldenSizeMismatch {
        /// Length of the reorganized output
        actual: usize,
        /// Length of the golden reference
        expected: usize,
    },

    /// Hardware version code does not match the compiled program
    #[error("Fingerprint mismatch: program built for {expected:#018x}, hardware reports {actual:#018x}")]
    FingerprintMismatch {
        /// Fingerprint the program was compiled for
        expected: u64,
        /// Version code read from the device
        actual: u64,
    },

    /// Configuration is internally inconsistent
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for failure
        reason: String,
    },

    /// Operation not valid in the current state
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Reason for failure
        reason: String,
    },

    /// Data transfer between host and device failed
    #[error("Transfer failed: {reason}")]
    TransferFailed {
        /// Reason for failure
        reason: String,
    },

    /// Hardware-level error from device
    #[error("Hardware error: {reason}")]
    HardwareError {
        /// Reason for failure
        reason: String,
    },

    /// Device node or sysfs entry not found
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl DpuError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Create an unsupported data kind error
    pub fn unsupported_data_kind(kind: impl Into<String>) -> Self {
        Self::UnsupportedDataKind { kind: kind.into() }
    }

    /// Create an allocation failure error
    pub fn allocation_failure(reason: impl Into<String>) -> Self {
        Self::AllocationFailure {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a transfer failed error
    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Create a hardware error
    pub fn hardware_error(reason: impl Into<String>) -> Self {
        Self::HardwareError {
            reason: reason.into(),
        }
    }

    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Whether the error came from the device itself rather than the host
    pub const fn is_device_fault(&self) -> bool {
        matches!(
            self,
            Self::ExecutionTimeout { .. } | Self::HardwareError { .. } | Self::FingerprintMismatch { .. }
        )
    }
}
