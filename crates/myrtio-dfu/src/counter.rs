//! Flash bit counters.
//!
//! A counter region is [`COUNTER_SIZE`] bytes of NOR flash. Every advance
//! clears exactly one more bit, starting from the last byte and moving
//! towards the first, so an increment is a single byte write and the region
//! only needs an erase once all 4096 bits are spent. A torn write can at
//! worst leave the previous value in place.

use log::{debug, warn};

use crate::error::DfuError;
use crate::layout::Region;
use crate::storage::DfuStorage;

pub const COUNTER_SIZE: usize = 512;

const ERASED: u8 = 0xFF;
const BITS_PER_BYTE: u32 = 8;

/// Single bit counter stored at a fixed flash address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitCounter {
    base: u32,
}

impl BitCounter {
    pub const fn new(base: u32) -> Self {
        Self { base }
    }

    pub fn value<S: DfuStorage>(&self, storage: &mut S) -> Result<u32, DfuError> {
        Ok(bit_count(&self.load(storage)?))
    }

    pub fn is_odd<S: DfuStorage>(&self, storage: &mut S) -> Result<bool, DfuError> {
        Ok(self.value(storage)? % 2 == 1)
    }

    /// Clear one more bit, erasing the region first when it is exhausted
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance<S: DfuStorage>(&self, storage: &mut S) -> Result<(), DfuError> {
        let buf = self.load(storage)?;
        let (index, byte) = match next_flip(&buf) {
            Some(flip) => flip,
            None => {
                warn!("dfu: counter at {:#x} exhausted, erasing", self.base);
                storage.erase(self.base, COUNTER_SIZE as u32)?;
                let buf = self.load(storage)?;
                next_flip(&buf).ok_or(DfuError::CounterState)?
            }
        };

        storage.write(self.base + index as u32, &[byte])?;
        Ok(())
    }

    fn load<S: DfuStorage>(&self, storage: &mut S) -> Result<[u8; COUNTER_SIZE], DfuError> {
        let mut buf = [0u8; COUNTER_SIZE];
        storage.read(self.base, &mut buf)?;
        Ok(buf)
    }
}

/// Index of the byte currently being consumed, or `COUNTER_SIZE` when the
/// region is fully erased.
fn active_index(buf: &[u8; COUNTER_SIZE]) -> usize {
    buf.iter()
        .position(|&byte| byte != ERASED)
        .unwrap_or(COUNTER_SIZE)
}

#[allow(clippy::cast_possible_truncation)]
fn bit_count(buf: &[u8; COUNTER_SIZE]) -> u32 {
    let index = active_index(buf);
    if index >= COUNTER_SIZE {
        return 0;
    }
    let spent_bytes = (COUNTER_SIZE - index - 1) as u32;
    spent_bytes * BITS_PER_BYTE + buf[index].trailing_zeros()
}

/// Byte to program for the next advance, `None` once every bit is cleared.
fn next_flip(buf: &[u8; COUNTER_SIZE]) -> Option<(usize, u8)> {
    let mut index = active_index(buf);
    if index == 0 && buf[0] == 0 {
        return None;
    }
    if index >= COUNTER_SIZE {
        index = COUNTER_SIZE - 1;
    }
    if buf[index] == 0 {
        index -= 1;
    }
    Some((index, buf[index] << 1))
}

/// Update counter paired with the error counter.
///
/// An odd update count means an image was registered and the boot that
/// applies it has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackCounter {
    update: BitCounter,
    error: BitCounter,
}

impl RollbackCounter {
    /// Counters for a boot options region: the update counter at its base,
    /// the error counter right after it.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(boot_options: Region) -> Self {
        Self {
            update: BitCounter::new(boot_options.base),
            error: BitCounter::new(boot_options.base + COUNTER_SIZE as u32),
        }
    }

    pub fn has_update<S: DfuStorage>(&self, storage: &mut S) -> Result<bool, DfuError> {
        self.update.is_odd(storage)
    }

    /// Mark a staged image as pending
    pub fn register<S: DfuStorage>(&self, storage: &mut S) -> Result<(), DfuError> {
        if self.update.is_odd(storage)? {
            return Ok(());
        }
        self.update.advance(storage)?;
        if self.update.is_odd(storage)? {
            Ok(())
        } else {
            Err(DfuError::CounterState)
        }
    }

    /// Mark the pending image as booted
    pub fn finish<S: DfuStorage>(&self, storage: &mut S) -> Result<(), DfuError> {
        if !self.update.is_odd(storage)? {
            return Ok(());
        }
        self.update.advance(storage)?;
        if self.update.is_odd(storage)? {
            Err(DfuError::CounterState)
        } else {
            debug!("dfu: update cycle finished");
            Ok(())
        }
    }

    /// Completed register/finish cycles
    pub fn count<S: DfuStorage>(&self, storage: &mut S) -> Result<u32, DfuError> {
        Ok(self.update.value(storage)? / 2)
    }

    pub fn count_error<S: DfuStorage>(&self, storage: &mut S) -> Result<u32, DfuError> {
        self.error.value(storage)
    }

    /// Count a failed update.
    ///
    /// Both counters share an erase block, so an exhausted error counter
    /// also clears the update counter. A pending update is re-armed after
    /// that erase; the completed cycle count restarts from zero.
    pub fn record_error<S: DfuStorage>(&self, storage: &mut S) -> Result<(), DfuError> {
        let pending = self.update.is_odd(storage)?;
        self.error.advance(storage)?;
        if pending && !self.update.is_odd(storage)? {
            warn!("dfu: error counter erase cleared pending update, re-arming");
            self.update.advance(storage)?;
        }
        Ok(())
    }
}
