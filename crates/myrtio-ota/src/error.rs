//! Error types for OTA transfers

use core::fmt;

use myrtio_dfu::DfuError;

/// Wire message encoding/decoding error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Not a well-formed message
    Malformed,
    /// Required field absent or zero
    MissingField(&'static str),
    /// Version string longer than the device can hold
    VersionTooLong,
    /// Chunk data is not valid base64 or does not fit the chunk buffer
    InvalidPayload,
    /// Encoded message does not fit the output buffer
    BufferTooSmall,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Malformed => write!(f, "malformed message"),
            ParseError::MissingField(name) => write!(f, "missing field `{}`", name),
            ParseError::VersionTooLong => write!(f, "version too long"),
            ParseError::InvalidPayload => write!(f, "invalid chunk payload"),
            ParseError::BufferTooSmall => write!(f, "buffer too small"),
        }
    }
}

/// Transport binding error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Prepare,
    Finish,
    Publish,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Prepare => write!(f, "cannot prepare transport"),
            TransportError::Finish => write!(f, "cannot release transport"),
            TransportError::Publish => write!(f, "cannot publish message"),
        }
    }
}

/// Error type for OTA operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    Parse(ParseError),
    Transport(TransportError),
    Dfu(DfuError),
    /// A chunk arrived where an update request was expected
    UnexpectedMessage,
    /// The transfer did not complete before the overall deadline
    Timeout,
    /// No transfer target is held
    NoTarget,
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaError::Parse(e) => write!(f, "parse error: {}", e),
            OtaError::Transport(e) => write!(f, "transport error: {}", e),
            OtaError::Dfu(e) => write!(f, "dfu error: {}", e),
            OtaError::UnexpectedMessage => write!(f, "unexpected message"),
            OtaError::Timeout => write!(f, "transfer timed out"),
            OtaError::NoTarget => write!(f, "no transfer target"),
        }
    }
}

impl From<ParseError> for OtaError {
    fn from(e: ParseError) -> Self {
        OtaError::Parse(e)
    }
}

impl From<TransportError> for OtaError {
    fn from(e: TransportError) -> Self {
        OtaError::Transport(e)
    }
}

impl From<DfuError> for OtaError {
    fn from(e: DfuError) -> Self {
        OtaError::Dfu(e)
    }
}
