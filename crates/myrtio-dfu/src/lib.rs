//! Power-loss-safe device firmware update engine.
//!
//! Images are streamed into a staging partition wrapped in an [`ImageHeader`]
//! envelope, verified against their SHA-256 digest, and copied into the
//! application partition by the boot-time [`loader`]. The pending/finished
//! state lives in a flash bit counter that advances by flipping single bits,
//! so no erase is needed for ordinary updates.
#![cfg_attr(not(test), no_std)]

pub mod counter;
pub mod digest;
mod error;
pub mod image;
pub mod layout;
pub mod loader;
mod manager;
pub mod ram;
pub mod storage;

pub use counter::{BitCounter, RollbackCounter};
pub use digest::{DIGEST_SIZE, DigestEngine, Sha256Engine};
pub use error::DfuError;
pub use image::{HEADER_SIZE, IMAGE_MAGIC, ImageHeader};
pub use layout::{FlashLayout, Region};
pub use manager::{COPY_BLOCK_SIZE, DfuManager, ImageWriter};
pub use ram::RamFlash;
pub use storage::{DfuStorage, NorFlashStorage, StorageError};
