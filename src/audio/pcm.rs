//! # PCM16 Framing Helpers
//!
//! Raw 16-bit PCM is the only codec this crate speaks. These helpers convert
//! between sample arrays and the little-endian byte layout used on the wire,
//! and between PCM16 and the normalized f32 samples the playback side expects.

use crate::error::{AppError, AppResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Append `samples` to `out` as little-endian 16-bit integers.
///
/// Writing into a `Vec<u8>` cannot fail, so the io::Result is discarded.
pub fn encode_pcm16_le(samples: &[i16], out: &mut Vec<u8>) {
    out.reserve(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        let _ = out.write_i16::<LittleEndian>(sample);
    }
}

/// Parse little-endian PCM16 bytes back into samples.
///
/// ## Errors:
/// Returns `BadRequest` when the byte count is odd, since a trailing half
/// sample means the frame was truncated somewhere upstream.
pub fn decode_pcm16_le(data: &[u8]) -> AppResult<Vec<i16>> {
    if data.len() % BYTES_PER_SAMPLE != 0 {
        return Err(AppError::BadRequest(
            "Audio data length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / BYTES_PER_SAMPLE);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Scale PCM16 samples from [-32768, 32767] to [-1.0, 1.0].
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Convert normalized f32 samples back to PCM16, clamping out-of-range values.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let scaled = sample * 32768.0;
            scaled.clamp(-32768.0, 32767.0) as i16
        })
        .collect()
}
