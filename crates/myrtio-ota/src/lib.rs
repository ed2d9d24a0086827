//! Over-the-air transfer of firmware images.
//!
//! [`Ota`] negotiates an update with a controller, pulls the image chunk by
//! chunk over an [`OtaTransport`], streams it into a
//! [`myrtio_dfu::DfuManager`] and arms it for the next boot once the digest
//! checks out. Messages are encoded by an [`OtaParser`]; [`JsonParser`] and
//! the MQTT binding in [`mqtt`] are the stock implementations.
#![cfg_attr(not(test), no_std)]

pub mod config;
mod error;
mod inbox;
pub mod model;
pub mod mqtt;
mod ota;
pub mod parser;
pub mod transport;

pub use config::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_MESSAGE_LEN, OtaConfig};
pub use error::{OtaError, ParseError, TransportError};
pub use inbox::{InboxMessage, OtaInbox};
pub use model::{Chunk, ChunkRejection, OtaMessage, Phase, UpdateTarget, VERSION_MAX_LEN, Version};
pub use ota::{Ota, StartOutcome, TransferOutcome};
pub use parser::{JsonParser, OtaParser};
pub use transport::OtaTransport;
