//! Error types for the DFU engine

use core::fmt;

use crate::storage::StorageError;

/// Error type for DFU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuError {
    /// Underlying flash operation failed
    Storage(StorageError),
    /// Access outside of the partition it targets
    OutOfBounds { addr: u32, len: u32 },
    /// Staged envelope does not start with the image magic
    InvalidMagic(u32),
    /// Bytes written do not match the envelope's declared size
    SizeMismatch { expected: u32, actual: u32 },
    /// Declared payload does not fit the destination partition
    ImageTooLarge { size: u32, capacity: u32 },
    /// Recomputed digest differs from the stored one
    DigestMismatch,
    /// Counter did not reach the expected parity after advancing
    CounterState,
    /// Partition layout is inconsistent
    InvalidLayout,
}

impl fmt::Display for DfuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuError::Storage(e) => write!(f, "storage error: {}", e),
            DfuError::OutOfBounds { addr, len } => {
                write!(f, "out of bounds access at {:#x} ({} bytes)", addr, len)
            }
            DfuError::InvalidMagic(magic) => write!(f, "invalid image magic {:#010x}", magic),
            DfuError::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {}, written {}", expected, actual)
            }
            DfuError::ImageTooLarge { size, capacity } => {
                write!(f, "image of {} bytes exceeds {} bytes", size, capacity)
            }
            DfuError::DigestMismatch => write!(f, "digest mismatch"),
            DfuError::CounterState => write!(f, "counter parity mismatch"),
            DfuError::InvalidLayout => write!(f, "invalid flash layout"),
        }
    }
}

impl From<StorageError> for DfuError {
    fn from(e: StorageError) -> Self {
        DfuError::Storage(e)
    }
}
