//! Transfer data model.

use core::fmt;

use heapless::String;

use crate::error::ParseError;

pub const VERSION_MAX_LEN: usize = 12;

pub type Version = String<VERSION_MAX_LEN>;

/// Where the orchestrator is in an update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Requesting,
    Downloading,
    Validating,
    /// Image armed, waiting for the reboot
    Applying,
    Failed,
}

/// The update being negotiated or downloaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateTarget {
    pub version: Version,
    pub force: bool,
    /// Total envelope size in bytes
    pub file_size: u32,
    pub chunk_size: u16,
    /// Next expected chunk, starting at 1
    pub chunk_index: u32,
}

impl UpdateTarget {
    /// Target carrying only a version, as sent in reports
    pub fn version_only(version: &str) -> Result<Self, ParseError> {
        let mut value = Version::new();
        value
            .push_str(version)
            .map_err(|()| ParseError::VersionTooLong)?;
        Ok(Self {
            version: value,
            ..Self::default()
        })
    }

    /// Bytes covered by the chunks accepted so far
    pub fn downloaded(&self) -> u32 {
        self.chunk_index
            .saturating_sub(1)
            .saturating_mul(u32::from(self.chunk_size))
    }

    pub fn is_complete(&self) -> bool {
        self.chunk_index > 1 && self.downloaded() >= self.file_size
    }

    /// Index of the final, possibly short, chunk
    pub fn last_chunk_index(&self) -> u32 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(u32::from(self.chunk_size))
    }

    /// Whether `chunk` is the one to write next
    pub fn check_chunk(&self, chunk: &Chunk<'_>) -> Result<(), ChunkRejection> {
        if chunk.index != self.chunk_index {
            return Err(ChunkRejection::UnexpectedIndex {
                expected: self.chunk_index,
                actual: chunk.index,
            });
        }

        let size = chunk.data.len();
        let full = usize::from(self.chunk_size);
        let fits = if chunk.index == self.last_chunk_index() {
            size > 0 && size <= full
        } else {
            size == full
        };
        if !fits {
            return Err(ChunkRejection::InvalidSize {
                index: chunk.index,
                size,
            });
        }
        Ok(())
    }
}

/// One fragment of the image, borrowed from the decode buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: u32,
    pub data: &'a [u8],
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaMessage<'a> {
    Request(UpdateTarget),
    Chunk(Chunk<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRejection {
    UnexpectedIndex { expected: u32, actual: u32 },
    InvalidSize { index: u32, size: usize },
}

impl fmt::Display for ChunkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkRejection::UnexpectedIndex { expected, actual } => {
                write!(f, "expected chunk #{}, got #{}", expected, actual)
            }
            ChunkRejection::InvalidSize { index, size } => {
                write!(f, "chunk #{} has invalid size {}", index, size)
            }
        }
    }
}
