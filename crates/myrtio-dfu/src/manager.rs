use log::{debug, error, info};

use crate::counter::RollbackCounter;
use crate::digest::DigestEngine;
use crate::error::DfuError;
use crate::image::{HEADER_SIZE, IMAGE_MAGIC, ImageHeader};
use crate::layout::FlashLayout;
use crate::storage::DfuStorage;

/// Block size for hashing and copying images
pub const COPY_BLOCK_SIZE: usize = 128;

/// Write cursor into the staging partition.
///
/// Obtained from [`DfuManager::begin`] and handed back through
/// [`DfuManager::end`].
#[derive(Debug, PartialEq, Eq)]
pub struct ImageWriter {
    base: u32,
    offset: u32,
}

impl ImageWriter {
    /// Bytes written so far, header included
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Stages, verifies and applies firmware images.
pub struct DfuManager<S, D> {
    storage: S,
    digest: D,
    layout: FlashLayout,
    counter: RollbackCounter,
}

impl<S: DfuStorage, D: DigestEngine> DfuManager<S, D> {
    pub fn new(storage: S, digest: D, layout: FlashLayout) -> Result<Self, DfuError> {
        layout.validate(storage.erase_size())?;
        Ok(Self {
            storage,
            digest,
            layout,
            counter: RollbackCounter::new(layout.boot_options),
        })
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Start a staging session at the beginning of the staging partition
    pub fn begin(&mut self) -> Result<ImageWriter, DfuError> {
        self.storage.prepare()?;
        Ok(ImageWriter {
            base: self.layout.staging.base,
            offset: 0,
        })
    }

    /// Close a staging session
    pub fn end(&mut self, writer: ImageWriter) -> Result<(), DfuError> {
        debug!("dfu: session closed at {} bytes", writer.offset);
        self.storage.finish()?;
        Ok(())
    }

    /// Append `data` to the staged image
    pub fn write(&mut self, writer: &mut ImageWriter, data: &[u8]) -> Result<(), DfuError> {
        let len = u32::try_from(data.len()).map_err(|_| DfuError::OutOfBounds {
            addr: writer.base + writer.offset,
            len: u32::MAX,
        })?;
        let addr = writer.base + writer.offset;
        if !self.layout.staging.contains(addr, len) {
            return Err(DfuError::OutOfBounds { addr, len });
        }

        self.storage.overwrite(addr, data)?;
        writer.offset += len;
        Ok(())
    }

    /// Check the staged envelope against what the session has written
    pub fn validate(&mut self, writer: &ImageWriter) -> Result<ImageHeader, DfuError> {
        self.verify(writer.base, writer.offset)
    }

    /// Arm the staged image for the next boot
    pub fn register(&mut self, writer: &ImageWriter) -> Result<(), DfuError> {
        debug!("dfu: registering image of {} bytes", writer.offset);
        self.counter.register(&mut self.storage)
    }

    pub fn has_update(&mut self) -> Result<bool, DfuError> {
        self.counter.has_update(&mut self.storage)
    }

    pub fn finish(&mut self) -> Result<(), DfuError> {
        self.counter.finish(&mut self.storage)
    }

    pub fn count(&mut self) -> Result<u32, DfuError> {
        self.counter.count(&mut self.storage)
    }

    pub fn count_error(&mut self) -> Result<u32, DfuError> {
        self.counter.count_error(&mut self.storage)
    }

    pub fn record_error(&mut self) -> Result<(), DfuError> {
        self.counter.record_error(&mut self.storage)
    }

    /// Verify the staged envelope and copy its payload into the app
    /// partition. Returns the number of payload bytes copied.
    ///
    /// Staging is left untouched.
    pub fn apply_update(&mut self) -> Result<u32, DfuError> {
        self.storage.prepare()?;
        let result = self.copy_staged();
        self.storage.finish()?;
        result
    }

    #[allow(clippy::cast_possible_truncation)]
    fn copy_staged(&mut self) -> Result<u32, DfuError> {
        let staging = self.layout.staging;
        let app = self.layout.app;

        let header = self.read_header(staging.base)?;
        let written = header.image_size().ok_or(DfuError::ImageTooLarge {
            size: header.datasize(),
            capacity: staging.len,
        })?;
        self.verify(staging.base, written)?;

        let size = header.datasize();
        if size > app.len {
            return Err(DfuError::ImageTooLarge {
                size,
                capacity: app.len,
            });
        }

        info!("dfu: copying {} bytes into app partition", size);
        let mut block = [0u8; COPY_BLOCK_SIZE];
        let mut copied = 0;
        while copied < size {
            let len = (size - copied).min(COPY_BLOCK_SIZE as u32);
            let buf = &mut block[..len as usize];
            self.storage
                .read(staging.base + HEADER_SIZE as u32 + copied, buf)?;
            self.storage.overwrite(app.base + copied, buf)?;
            copied += len;
        }

        Ok(size)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn verify(&mut self, base: u32, written: u32) -> Result<ImageHeader, DfuError> {
        let header = self.read_header(base)?;
        if header.magic() != IMAGE_MAGIC {
            error!("dfu: invalid magic {:#010x}", header.magic());
            return Err(DfuError::InvalidMagic(header.magic()));
        }

        let capacity = self.layout.staging.len - HEADER_SIZE as u32;
        let size = header.datasize();
        if size > capacity {
            return Err(DfuError::ImageTooLarge { size, capacity });
        }

        let expected = size + HEADER_SIZE as u32;
        if written != expected {
            error!("dfu: expected {} bytes, written {}", expected, written);
            return Err(DfuError::SizeMismatch {
                expected,
                actual: written,
            });
        }

        let mut block = [0u8; COPY_BLOCK_SIZE];
        let mut hashed = 0;
        self.digest.reset();
        while hashed < size {
            let len = (size - hashed).min(COPY_BLOCK_SIZE as u32);
            let buf = &mut block[..len as usize];
            self.storage
                .read(base + HEADER_SIZE as u32 + hashed, buf)?;
            self.digest.update(buf);
            hashed += len;
        }

        if self.digest.finalize() != *header.digest() {
            error!("dfu: digest mismatch");
            return Err(DfuError::DigestMismatch);
        }
        Ok(header)
    }

    fn read_header(&mut self, base: u32) -> Result<ImageHeader, DfuError> {
        let mut raw = [0u8; HEADER_SIZE];
        self.storage.read(base, &mut raw)?;
        Ok(ImageHeader::from_bytes(&raw))
    }
}
