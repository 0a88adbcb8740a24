//! WAV encode/decode
//!
//! 16-bit PCM little-endian RIFF/WAVE: `fmt ` (PCM, tag 1) followed by a
//! `data` chunk. Encoding serves the render output; decoding serves the
//! sample cache and the round-trip tests.

use thiserror::Error;

pub const HEADER_BYTES: usize = 44;

#[derive(Debug, Error)]
pub enum WavError {
    #[error("not a RIFF/WAVE file")]
    NotRiff,

    #[error("missing {0} chunk")]
    MissingChunk(&'static str),

    #[error("unsupported audio format tag {0} (only PCM is supported)")]
    UnsupportedFormat(u16),

    #[error("unsupported bit depth {0}")]
    UnsupportedBitDepth(u16),

    #[error("truncated file")]
    Truncated,
}

/// Encode interleaved float samples into a WAV byte buffer
///
/// Samples are clamped to [-1, 1] before 16-bit quantization.
pub fn encode(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = samples.len() * 2;
    let byte_rate = sample_rate * channels as u32 * 2;
    let block_align = channels * 2;

    let mut out = Vec::with_capacity(HEADER_BYTES + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let quantized = (clamped * 32767.0).round() as i16;
        out.extend_from_slice(&quantized.to_le_bytes());
    }

    out
}

/// Decoded WAV contents
#[derive(Debug, Clone)]
pub struct DecodedWav {
    /// Interleaved samples in [-1, 1]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Decode a 16-bit PCM WAV byte buffer
pub fn decode(bytes: &[u8]) -> Result<DecodedWav, WavError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(WavError::NotRiff);
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None; // tag, channels, rate, bits
    let mut data: Option<&[u8]> = None;

    // Walk the chunk list; chunks are word-aligned
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]]) as usize;
        let body_start = pos + 8;
        let body_end = body_start + size;
        if body_end > bytes.len() {
            return Err(WavError::Truncated);
        }
        let body = &bytes[body_start..body_end];

        match id {
            b"fmt " => {
                if size < 16 {
                    return Err(WavError::Truncated);
                }
                let tag = u16::from_le_bytes([body[0], body[1]]);
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits = u16::from_le_bytes([body[14], body[15]]);
                fmt = Some((tag, channels, rate, bits));
            }
            b"data" => data = Some(body),
            _ => {}
        }

        pos = body_end + (size % 2);
    }

    let (tag, channels, sample_rate, bits) = fmt.ok_or(WavError::MissingChunk("fmt "))?;
    if tag != 1 {
        return Err(WavError::UnsupportedFormat(tag));
    }
    if bits != 16 {
        return Err(WavError::UnsupportedBitDepth(bits));
    }
    let data = data.ok_or(WavError::MissingChunk("data"))?;

    let samples = data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32767.0)
        .collect();

    Ok(DecodedWav {
        samples,
        sample_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let bytes = encode(&[0.0; 4], 44100, 2);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(bytes.len(), HEADER_BYTES + 8);

        // PCM tag and bit depth
        assert_eq!(u16::from_le_bytes([bytes[20], bytes[21]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[34], bytes[35]]), 16);
        // Sample rate field
        assert_eq!(
            u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            44100
        );
    }

    #[test]
    fn test_empty_buffer_is_header_only() {
        let bytes = encode(&[], 48000, 1);
        assert_eq!(bytes.len(), HEADER_BYTES);
    }

    #[test]
    fn test_roundtrip_preserves_metadata() {
        let samples = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
        let bytes = encode(&samples, 22050, 2);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.sample_rate, 22050);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.samples.len(), samples.len());
    }

    #[test]
    fn test_clamping_out_of_range() {
        let bytes = encode(&[2.0, -3.0], 44100, 1);
        let decoded = decode(&bytes).unwrap();
        assert!((decoded.samples[0] - 1.0).abs() < 1e-4);
        assert!((decoded.samples[1] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not a wav"), Err(WavError::NotRiff)));
        assert!(matches!(decode(b""), Err(WavError::NotRiff)));
    }

    #[test]
    fn test_decode_rejects_non_pcm() {
        let mut bytes = encode(&[0.0], 44100, 1);
        // Overwrite the format tag with IEEE float (3)
        bytes[20] = 3;
        assert!(matches!(decode(&bytes), Err(WavError::UnsupportedFormat(3))));
    }

    #[test]
    fn test_decode_skips_unknown_chunks() {
        // Insert a LIST chunk between fmt and data
        let encoded = encode(&[0.5], 44100, 1);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encoded[..36]);
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(b"INFO");
        bytes.extend_from_slice(&encoded[36..]);
        // Fix the RIFF size
        let riff_size = (bytes.len() - 8) as u32;
        bytes[4..8].copy_from_slice(&riff_size.to_le_bytes());

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.samples.len(), 1);
        assert!((decoded.samples[0] - 0.5).abs() < 1e-4);
    }

    proptest! {
        #[test]
        fn prop_roundtrip_within_quantization_error(
            samples in prop::collection::vec(-1.0f32..=1.0, 0..512),
            stereo in any::<bool>(),
        ) {
            let channels = if stereo { 2 } else { 1 };
            let bytes = encode(&samples, 44100, channels);
            let decoded = decode(&bytes).unwrap();

            prop_assert_eq!(decoded.samples.len(), samples.len());
            for (original, roundtripped) in samples.iter().zip(&decoded.samples) {
                prop_assert!((original - roundtripped).abs() <= 1.0 / 32768.0);
            }
        }
    }
}
