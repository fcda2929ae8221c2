//! Raw PCM layouts accepted at the ingest boundary.

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

/// Sample encoding of interleaved PCM bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    S16Le,
    F32Le,
}

impl SampleEncoding {
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16Le => 2,
            Self::F32Le => 4,
        }
    }
}

/// Describes a stream of interleaved PCM frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl PcmFormat {
    /// 16-bit little-endian mono at `sample_rate`.
    pub const fn s16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            encoding: SampleEncoding::S16Le,
        }
    }

    pub const fn frame_bytes(&self) -> usize {
        self.channels as usize * self.encoding.bytes_per_sample()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(CadenceError::AudioFormat("sample rate must be non-zero".into()));
        }
        if self.channels == 0 {
            return Err(CadenceError::AudioFormat("channel count must be non-zero".into()));
        }
        Ok(())
    }
}

/// Decode whole frames from `bytes` into mono f32, averaging channels.
///
/// Returns the number of bytes consumed; a trailing partial frame is left
/// for the caller to carry over.
pub fn decode_to_mono(bytes: &[u8], format: PcmFormat, out: &mut Vec<f32>) -> usize {
    let frame = format.frame_bytes();
    if frame == 0 {
        return 0;
    }
    let ch = format.channels as usize;
    let width = format.encoding.bytes_per_sample();
    let frames = bytes.len() / frame;
    out.reserve(frames);

    for f in bytes[..frames * frame].chunks_exact(frame) {
        let sum: f32 = f
            .chunks_exact(width)
            .map(|s| decode_sample(s, format.encoding))
            .sum();
        out.push(sum / ch as f32);
    }
    frames * frame
}

#[inline]
fn decode_sample(bytes: &[u8], encoding: SampleEncoding) -> f32 {
    match encoding {
        SampleEncoding::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        SampleEncoding::F32Le => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

/// Iterate s16le bytes as normalised f32 samples. An odd trailing byte is ignored.
pub fn s16le_samples(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
}

/// Append `samples` as clamped s16le.
pub fn encode_s16le(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn stereo_s16_is_averaged() {
        let fmt = PcmFormat {
            sample_rate: 48_000,
            channels: 2,
            encoding: SampleEncoding::S16Le,
        };
        let mut bytes = Vec::new();
        for v in [16_384i16, 0, -16_384, -16_384] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut out = Vec::new();
        assert_eq!(decode_to_mono(&bytes, fmt, &mut out), 8);
        assert_abs_diff_eq!(out[0], 0.25, epsilon = 1e-4);
        assert_abs_diff_eq!(out[1], -0.5, epsilon = 1e-4);
    }

    #[test]
    fn partial_frame_is_not_consumed() {
        let fmt = PcmFormat {
            sample_rate: 16_000,
            channels: 1,
            encoding: SampleEncoding::F32Le,
        };
        let mut bytes = 0.5f32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0]);
        let mut out = Vec::new();
        assert_eq!(decode_to_mono(&bytes, fmt, &mut out), 4);
        assert_eq!(out, vec![0.5]);
    }

    #[test]
    fn s16_encoding_clamps_out_of_range() {
        let mut out = Vec::new();
        encode_s16le(&[2.0, -2.0, 0.0], &mut out);
        let back: Vec<f32> = s16le_samples(&out).collect();
        assert_abs_diff_eq!(back[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(back[1], -1.0, epsilon = 1e-3);
        assert_eq!(back[2], 0.0);
    }

    #[test]
    fn zero_channels_fail_validation() {
        let fmt = PcmFormat {
            sample_rate: 16_000,
            channels: 0,
            encoding: SampleEncoding::S16Le,
        };
        assert!(matches!(fmt.validate(), Err(CadenceError::AudioFormat(_))));
    }
}
