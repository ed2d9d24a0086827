//! Wire format of update requests, chunk requests and chunks.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::model::{Chunk, OtaMessage, UpdateTarget};

/// Encoder/decoder for OTA messages
pub trait OtaParser {
    /// Encode `target` into `buf`, returning the encoded length
    fn encode(&self, target: &UpdateTarget, buf: &mut [u8]) -> Result<usize, ParseError>;

    /// Decode an inbound message. Chunk payloads are decoded into `scratch`.
    fn decode<'b>(
        &self,
        msg: &[u8],
        scratch: &'b mut [u8],
    ) -> Result<OtaMessage<'b>, ParseError>;
}

/// Compact JSON messages with base64 chunk payloads.
///
/// Outbound: `{"version":"1.3.0","packet_size":128,"index":1}`, zero fields
/// omitted. Inbound requests carry `version`, `size`, `force` and an
/// optional `packet_size`; chunks carry `index` and `data`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonParser;

#[derive(Serialize)]
struct OutboundBody<'a> {
    version: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    packet_size: u16,
    #[serde(skip_serializing_if = "is_zero")]
    index: u32,
}

#[derive(Deserialize)]
struct InboundBody<'a> {
    #[serde(rename = "type", default, borrow)]
    kind: Option<&'a str>,
    #[serde(default, borrow)]
    version: Option<&'a str>,
    #[serde(default)]
    size: Option<u32>,
    #[serde(default)]
    packet_size: Option<u16>,
    #[serde(default)]
    force: Option<bool>,
    #[serde(default)]
    index: Option<u32>,
    #[serde(default, borrow)]
    data: Option<&'a str>,
}

fn is_zero<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

impl OtaParser for JsonParser {
    fn encode(&self, target: &UpdateTarget, buf: &mut [u8]) -> Result<usize, ParseError> {
        let body = OutboundBody {
            version: target.version.as_str(),
            packet_size: target.chunk_size,
            index: target.chunk_index,
        };
        serde_json_core::to_slice(&body, buf).map_err(|_| ParseError::BufferTooSmall)
    }

    fn decode<'b>(
        &self,
        msg: &[u8],
        scratch: &'b mut [u8],
    ) -> Result<OtaMessage<'b>, ParseError> {
        let (body, _) = serde_json_core::from_slice::<InboundBody<'_>>(msg)
            .map_err(|_| ParseError::Malformed)?;

        let index = body.index.unwrap_or(0);
        if body.kind == Some("request") || index == 0 {
            return decode_request(&body).map(OtaMessage::Request);
        }

        let data = body.data.ok_or(ParseError::MissingField("data"))?;
        let len = STANDARD
            .decode_slice(data, scratch)
            .map_err(|_| ParseError::InvalidPayload)?;
        Ok(OtaMessage::Chunk(Chunk {
            index,
            data: &scratch[..len],
        }))
    }
}

fn decode_request(body: &InboundBody<'_>) -> Result<UpdateTarget, ParseError> {
    let version = body
        .version
        .filter(|version| !version.is_empty())
        .ok_or(ParseError::MissingField("version"))?;
    let force = body.force.ok_or(ParseError::MissingField("force"))?;
    let file_size = body
        .size
        .filter(|&size| size != 0)
        .ok_or(ParseError::MissingField("size"))?;

    let mut target = UpdateTarget::version_only(version)?;
    target.force = force;
    target.file_size = file_size;
    target.chunk_size = body.packet_size.unwrap_or(0);
    Ok(target)
}
