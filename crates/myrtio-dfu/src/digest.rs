//! Streaming digest used to verify staged images.

use sha2::{Digest, Sha256};

pub const DIGEST_SIZE: usize = 32;

/// Streaming hash context
pub trait DigestEngine {
    /// Drop any absorbed data and start over
    fn reset(&mut self);

    fn update(&mut self, data: &[u8]);

    /// Produce the digest of everything absorbed since the last reset,
    /// then reset
    fn finalize(&mut self) -> [u8; DIGEST_SIZE];
}

/// SHA-256 digest engine
#[derive(Default)]
pub struct Sha256Engine {
    hasher: Sha256,
}

impl Sha256Engine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DigestEngine for Sha256Engine {
    fn reset(&mut self) {
        Digest::reset(&mut self.hasher);
    }

    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.hasher, data);
    }

    fn finalize(&mut self) -> [u8; DIGEST_SIZE] {
        let hash = self.hasher.finalize_reset();
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&hash);
        out
    }
}
