//! PCM wire codec
//!
//! The remote endpoint speaks 16-bit little-endian mono PCM: 16 kHz from the
//! microphone, 24 kHz for generated speech. Internally every buffer is `f32`
//! in `[-1.0, 1.0]`.

use std::sync::Arc;

/// Microphone capture rate expected by the endpoint
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Rate of the audio the endpoint streams back
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Samples per capture frame (~256 ms at 16 kHz)
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;
/// Mime descriptor attached to every outbound audio frame
pub const CAPTURE_MIME: &str = "audio/pcm;rate=16000";

/// Errors raised while turning wire bytes back into samples
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated PCM chunk: {len} bytes is not a whole number of 16-bit samples")]
    OddLength { len: usize },

    #[error("inline audio is not valid base64: {0}")]
    InvalidBase64(String),
}

/// Immutable mono frame tagged with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Always mono on both directions.
    pub fn channels(&self) -> u16 {
        1
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds at the frame's own rate.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Encode float samples as little-endian signed 16-bit PCM.
///
/// Values are clamped to `[-1, 1]`; negatives scale by `0x8000` and the rest
/// by `0x7FFF` so that `-1.0` maps to `i16::MIN` without overflowing.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&to_i16(s).to_le_bytes());
    }
    out
}

fn to_i16(sample: f32) -> i16 {
    // NaN has no meaningful level; treat it as silence.
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Decode little-endian signed 16-bit PCM into floats (`/ 32768`).
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength { len: bytes.len() });
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}
