use embassy_time::Duration;

/// Chunk size used when the controller does not ask for one
pub const DEFAULT_CHUNK_SIZE: u16 = 128;
/// Largest chunk payload the device accepts
pub const MAX_CHUNK_SIZE: usize = 512;
/// Largest inbound message, base64 chunk plus framing
pub const MAX_MESSAGE_LEN: usize = 768;
/// Decoded chunk buffer. The base64 decoder sizes its output in whole
/// 3-byte groups.
pub(crate) const CHUNK_BUFSIZE: usize = MAX_CHUNK_SIZE + 3;
/// Outbound request/report buffer
pub(crate) const PAYLOAD_BUFSIZE: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaConfig {
    /// Chunk size when the request leaves it at zero
    pub default_chunk_size: u16,
    /// Wait for a single chunk before asking again
    pub rtt_timeout: Duration,
    /// Deadline for the whole transfer
    pub transfer_timeout: Duration,
}

impl OtaConfig {
    pub const DEFAULT: OtaConfig = OtaConfig {
        default_chunk_size: DEFAULT_CHUNK_SIZE,
        rtt_timeout: Duration::from_millis(5000),
        transfer_timeout: Duration::from_secs(300),
    };
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
