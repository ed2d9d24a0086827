//! Flash partition descriptors.

use crate::counter::COUNTER_SIZE;
use crate::error::DfuError;
use crate::image::HEADER_SIZE;

/// Contiguous flash range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u32,
    pub len: u32,
}

impl Region {
    pub const fn new(base: u32, len: u32) -> Self {
        Self { base, len }
    }

    /// First address past the region, saturating at the top of the address space
    pub const fn end(&self) -> u32 {
        self.base.saturating_add(self.len)
    }

    pub const fn contains(&self, addr: u32, len: u32) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    pub const fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Whether both ends fall on a `block` boundary
    pub const fn is_aligned(&self, block: u32) -> bool {
        block != 0 && self.base % block == 0 && self.len % block == 0
    }
}

/// Where the DFU engine keeps its state, the incoming image and the
/// running application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    /// Update counter followed by the error counter
    pub boot_options: Region,
    /// Incoming envelope
    pub staging: Region,
    /// Running application
    pub app: Region,
}

impl FlashLayout {
    pub const fn new(boot_options: Region, staging: Region, app: Region) -> Self {
        Self {
            boot_options,
            staging,
            app,
        }
    }

    /// Check sizes, overlaps and alignment to the flash `erase_size`.
    ///
    /// Every region must start and end on an erase block, otherwise erasing
    /// one partition could clear its neighbour or skip its own first block.
    #[allow(clippy::cast_possible_truncation)]
    pub fn validate(&self, erase_size: u32) -> Result<(), DfuError> {
        if self.boot_options.len < 2 * COUNTER_SIZE as u32
            || self.staging.len <= HEADER_SIZE as u32
            || self.app.len == 0
        {
            return Err(DfuError::InvalidLayout);
        }
        if self.boot_options.overlaps(&self.staging)
            || self.boot_options.overlaps(&self.app)
            || self.staging.overlaps(&self.app)
        {
            return Err(DfuError::InvalidLayout);
        }
        if !self.boot_options.is_aligned(erase_size)
            || !self.staging.is_aligned(erase_size)
            || !self.app.is_aligned(erase_size)
        {
            return Err(DfuError::InvalidLayout);
        }
        Ok(())
    }
}
