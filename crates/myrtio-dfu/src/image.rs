//! Envelope prepended to firmware payloads in the staging partition.
//!
//! ```text
//! +-------------+---------------+-------------------+-------------
//! | magic (u32) | datasize (u32)| sha256 (32 bytes) | payload ...
//! +-------------+---------------+-------------------+-------------
//! ```
//!
//! Integers are little-endian.

use bytemuck::{Pod, Zeroable};

use crate::digest::{DIGEST_SIZE, DigestEngine};

pub const IMAGE_MAGIC: u32 = 0xC0DE_FEED;
pub const HEADER_SIZE: usize = size_of::<ImageHeader>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct ImageHeader {
    magic: u32,
    datasize: u32,
    digest: [u8; DIGEST_SIZE],
}

impl ImageHeader {
    pub fn new(datasize: u32, digest: [u8; DIGEST_SIZE]) -> Self {
        Self {
            magic: IMAGE_MAGIC.to_le(),
            datasize: datasize.to_le(),
            digest,
        }
    }

    /// Header for `payload`, hashed with `engine`
    pub fn seal<D: DigestEngine>(engine: &mut D, payload: &[u8]) -> Option<Self> {
        let datasize = u32::try_from(payload.len()).ok()?;
        engine.reset();
        engine.update(payload);
        Some(Self::new(datasize, engine.finalize()))
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn magic(&self) -> u32 {
        u32::from_le(self.magic)
    }

    pub fn datasize(&self) -> u32 {
        u32::from_le(self.datasize)
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// Envelope length, header included
    #[allow(clippy::cast_possible_truncation)]
    pub fn image_size(&self) -> Option<u32> {
        self.datasize().checked_add(HEADER_SIZE as u32)
    }
}
