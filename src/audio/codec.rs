//! PCM16 codec: normalized `f32` samples ⇄ little-endian 16-bit PCM ⇄ base64.
//!
//! The realtime wire format is mono PCM16 carried as base64 text inside JSON.
//! Encoding clamps to [-1, 1] before scaling by `i16::MAX`; decoding divides
//! by 32768. Out-of-range input is clamped, never wrapped.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::Result;

/// Divisor used when converting PCM16 back to floats.
const PCM16_DECODE_SCALE: f32 = 32768.0;

/// Encode normalized samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = float_to_i16(sample);
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 bytes into normalized samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_DECODE_SCALE)
        .collect()
}

/// Wrap raw bytes in standard base64 for the wire.
pub fn base64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Unwrap a base64 payload received from the wire.
pub fn base64_decode(payload: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(payload.trim())?)
}

/// Encode samples straight to the base64 PCM16 form used by `input_audio`.
pub fn encode_base64_pcm16(samples: &[f32]) -> String {
    base64_encode(&encode_pcm16(samples))
}

/// Decode a base64 PCM16 audio delta into samples.
pub fn decode_base64_pcm16(payload: &str) -> Result<Vec<f32>> {
    Ok(decode_pcm16(&base64_decode(payload)?))
}

/// Scale by `i16::MAX` and round the magnitude up. Decoding divides by
/// 32768, so the two error terms have opposite signs and a round trip stays
/// within one step. NaN survives `clamp` but saturates to 0 in the cast.
pub(crate) fn float_to_i16(sample: f32) -> i16 {
    let scaled = sample.clamp(-1.0, 1.0) * i16::MAX as f32;
    scaled.abs().ceil().copysign(scaled) as i16
}
