//! Byte-addressable flash access used by the DFU engine.

use core::fmt;

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

const BOUNCE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    Read,
    Write,
    Erase,
    NotAligned,
    OutOfBounds,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Read => write!(f, "flash read failed"),
            StorageError::Write => write!(f, "flash write failed"),
            StorageError::Erase => write!(f, "flash erase failed"),
            StorageError::NotAligned => write!(f, "unaligned flash access"),
            StorageError::OutOfBounds => write!(f, "flash access out of bounds"),
        }
    }
}

/// Linear flash address space as seen by the DFU engine.
pub trait DfuStorage {
    /// Acquire the backend before a session
    fn prepare(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Release the backend after a session
    fn finish(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Smallest erasable unit; partitions must be aligned to it
    fn erase_size(&self) -> u32;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Program bytes into an already erased range
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Erase the blocks a sequential stream enters, then program
    fn overwrite(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Erase every block touched by `[addr, addr + len)`
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), StorageError>;
}

/// [`DfuStorage`] on top of any `embedded-storage` NOR flash.
///
/// Reads and writes may start and end anywhere: unaligned edges go through
/// a bounce buffer, and write padding is `0xFF` so programming never touches
/// neighbouring bytes.
pub struct NorFlashStorage<F> {
    flash: F,
}

impl<F: NorFlash> NorFlashStorage<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_unaligned(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError> {
        let align = F::WRITE_SIZE;
        if BOUNCE_SIZE % align != 0 {
            return Err(StorageError::NotAligned);
        }

        let mut bounce = [0xFFu8; BOUNCE_SIZE];
        let mut done = 0;
        while done < data.len() {
            let cursor = addr + done as u32;
            let skip = cursor as usize % align;
            let take = (BOUNCE_SIZE - skip).min(data.len() - done);
            let span = (skip + take).next_multiple_of(align);

            bounce.fill(0xFF);
            bounce[skip..skip + take].copy_from_slice(&data[done..done + take]);
            self.flash
                .write(cursor - skip as u32, &bounce[..span])
                .map_err(|e| map_error(e.kind(), StorageError::Write))?;
            done += take;
        }

        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_unaligned(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let align = F::READ_SIZE;
        if BOUNCE_SIZE % align != 0 {
            return Err(StorageError::NotAligned);
        }

        let mut bounce = [0u8; BOUNCE_SIZE];
        let mut done = 0;
        while done < buf.len() {
            let cursor = addr + done as u32;
            let skip = cursor as usize % align;
            let take = (BOUNCE_SIZE - skip).min(buf.len() - done);
            let span = (skip + take).next_multiple_of(align);

            self.flash
                .read(cursor - skip as u32, &mut bounce[..span])
                .map_err(|e| map_error(e.kind(), StorageError::Read))?;
            buf[done..done + take].copy_from_slice(&bounce[skip..skip + take]);
            done += take;
        }

        Ok(())
    }
}

impl<F: NorFlash> DfuStorage for NorFlashStorage<F> {
    #[allow(clippy::cast_possible_truncation)]
    fn erase_size(&self) -> u32 {
        F::ERASE_SIZE as u32
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        end_of(addr, buf.len())?;
        if is_aligned(addr, buf.len(), F::READ_SIZE) {
            return self
                .flash
                .read(addr, buf)
                .map_err(|e| map_error(e.kind(), StorageError::Read));
        }
        self.read_unaligned(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError> {
        end_of(addr, data.len())?;
        if is_aligned(addr, data.len(), F::WRITE_SIZE) {
            return self
                .flash
                .write(addr, data)
                .map_err(|e| map_error(e.kind(), StorageError::Write));
        }
        self.write_unaligned(addr, data)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn overwrite(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError> {
        let end = end_of(addr, data.len())?;
        let block = F::ERASE_SIZE as u32;

        // Blocks that start before `addr` were entered by an earlier call.
        // Partitions are block aligned, so a stream's first block always
        // starts at its base.
        let mut cursor = addr.next_multiple_of(block);
        while cursor < end {
            self.erase(cursor, block)?;
            cursor += block;
        }

        self.write(addr, data)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), StorageError> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len).ok_or(StorageError::OutOfBounds)?;
        let block = F::ERASE_SIZE as u32;
        let from = addr - addr % block;
        let to = end.next_multiple_of(block);

        self.flash
            .erase(from, to)
            .map_err(|e| map_error(e.kind(), StorageError::Erase))
    }
}

fn map_error(kind: NorFlashErrorKind, fallback: StorageError) -> StorageError {
    match kind {
        NorFlashErrorKind::NotAligned => StorageError::NotAligned,
        NorFlashErrorKind::OutOfBounds => StorageError::OutOfBounds,
        _ => fallback,
    }
}

fn is_aligned(addr: u32, len: usize, align: usize) -> bool {
    align <= 1 || (addr as usize % align == 0 && len % align == 0)
}

fn end_of(addr: u32, len: usize) -> Result<u32, StorageError> {
    u32::try_from(len)
        .ok()
        .and_then(|len| addr.checked_add(len))
        .ok_or(StorageError::OutOfBounds)
}
