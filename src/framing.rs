//! Gzip framing of request and response bodies

use crate::error::{BrokerError, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::io::{Read, Write};

/// Gzip codec with a fixed compression level
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    level: Compression,
}

impl Default for Framing {
    fn default() -> Self {
        Self::new(9)
    }
}

impl Framing {
    /// `level` is clamped to 0-9
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    pub fn compress(&self, body: &[u8]) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2 + 32), self.level);
        encoder.write_all(body)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Serialize `value` as compact JSON and compress it
    pub fn encode_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        self.compress(&serde_json::to_vec(value)?)
    }

    pub fn decompress(&self, body: &[u8]) -> Result<Bytes> {
        decompress(body)
    }
}

/// Inflate a gzip body; any decoding failure is `BadCompression`
pub fn decompress(body: &[u8]) -> Result<Bytes> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| {
        tracing::debug!(error = %e, len = body.len(), "Rejected body with bad gzip framing");
        BrokerError::BadCompression
    })?;
    Ok(Bytes::from(out))
}
