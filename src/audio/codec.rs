//! PCM16 wire codec
//!
//! Outbound frames are packed as little-endian signed 16-bit PCM and base64
//! encoded. Inbound chunks arrive in the same format at the playback rate.

use crate::error::DecodeError;
use base64::prelude::*;

/// Base64 text of one encoded frame, ready for the transport
pub type PayloadBlob = String;

/// Encode float samples (nominally -1.0..=1.0) as a PCM16 payload
pub fn encode(samples: &[f32]) -> PayloadBlob {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        debug_assert!(sample.is_finite(), "non-finite sample in capture frame");
        let sample = if sample.is_finite() { sample } else { 0.0 };
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    BASE64_STANDARD.encode(bytes)
}

/// Decode a PCM16 payload into float samples
pub fn decode(payload: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Duration in seconds of `sample_count` mono samples
pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    sample_count as f64 / sample_rate as f64
}
