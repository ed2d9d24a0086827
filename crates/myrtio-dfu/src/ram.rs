//! RAM-backed NOR flash for host tests and simulators.

use embedded_storage::nor_flash::{
    ErrorType,
    NorFlash,
    NorFlashErrorKind,
    ReadNorFlash,
    check_erase,
    check_read,
    check_write,
};

pub const RAM_ERASE_SIZE: usize = 4096;

/// NOR flash emulator: erase sets whole blocks to `0xFF`, programming can
/// only clear bits.
pub struct RamFlash<const SIZE: usize, const WORD: usize = 1> {
    data: [u8; SIZE],
    erase_count: usize,
    failing_writes: usize,
    failing_erases: usize,
}

impl<const SIZE: usize, const WORD: usize> RamFlash<SIZE, WORD> {
    pub const fn new() -> Self {
        Self {
            data: [0xFF; SIZE],
            erase_count: 0,
            failing_writes: 0,
            failing_erases: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of erase operations issued so far
    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&mut self, count: usize) {
        self.failing_writes = count;
    }

    /// Make the next `count` erases fail
    pub fn fail_next_erases(&mut self, count: usize) {
        self.failing_erases = count;
    }
}

impl<const SIZE: usize, const WORD: usize> Default for RamFlash<SIZE, WORD> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize, const WORD: usize> ErrorType for RamFlash<SIZE, WORD> {
    type Error = NorFlashErrorKind;
}

impl<const SIZE: usize, const WORD: usize> ReadNorFlash for RamFlash<SIZE, WORD> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        SIZE
    }
}

impl<const SIZE: usize, const WORD: usize> NorFlash for RamFlash<SIZE, WORD> {
    const WRITE_SIZE: usize = WORD;
    const ERASE_SIZE: usize = RAM_ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        if self.failing_erases > 0 {
            self.failing_erases -= 1;
            return Err(NorFlashErrorKind::Other);
        }
        self.data[from as usize..to as usize].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(NorFlashErrorKind::Other);
        }
        let start = offset as usize;
        for (cell, byte) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}
