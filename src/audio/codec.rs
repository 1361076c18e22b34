//! Canonical 16-bit PCM WAV encoding and decoding
//!
//! Encoding always produces the classic 44-byte RIFF header followed by
//! interleaved little-endian `i16` samples. Decoding accepts any integer
//! PCM WAV file via hound, plus the raw `f32` chunks delivered by capture
//! devices.

use crate::audio::device::StreamFormat;
use crate::error::{ClipError, DecodeError};
use crate::models::AudioClip;
use std::io::Cursor;

/// Size of the header written by [`encode`]
pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;
const PCM_FORMAT_TAG: u16 = 1;

/// Quantise a float sample to `i16`
///
/// Negative values scale by 32768 and non-negative ones by 32767, so both
/// -1.0 and 1.0 map onto the ends of the integer range.
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled.round() as i16
}

/// Inverse of [`quantize`] for an integer sample of `bits` width
pub fn dequantize(value: i32, bits: u16) -> f32 {
    let half = (1i64 << (bits - 1)) as f64;
    let v = value as f64;
    let normalized = if v < 0.0 { v / half } else { v / (half - 1.0) };
    normalized as f32
}

/// Size fields of a RIFF header
struct HeaderSizes {
    block_align: u16,
    byte_rate: u32,
    data_size: u32,
    file_size: u32,
}

/// Header sizes for a 16-bit clip, or an error if any exceeds 32 bits
fn header_sizes(
    sample_count: usize,
    channels: u16,
    sample_rate: u32,
) -> Result<HeaderSizes, ClipError> {
    let bytes_per_sample = BITS_PER_SAMPLE / 8;
    let too_long = || ClipError::TooLong {
        samples: sample_count,
    };

    let block_align = channels.checked_mul(bytes_per_sample).ok_or_else(too_long)?;
    let byte_rate = sample_rate
        .checked_mul(block_align as u32)
        .ok_or_else(too_long)?;
    let data_size = sample_count
        .checked_mul(bytes_per_sample as usize)
        .and_then(|bytes| u32::try_from(bytes).ok())
        .ok_or_else(too_long)?;
    let file_size = data_size.checked_add(36).ok_or_else(too_long)?;

    Ok(HeaderSizes {
        block_align,
        byte_rate,
        data_size,
        file_size,
    })
}

/// Encode a clip as a 16-bit PCM WAV file
///
/// Fails only for clips too large for the 32-bit RIFF size fields.
pub fn encode(clip: &AudioClip) -> Result<Vec<u8>, ClipError> {
    let channels = clip.channels();
    let sample_rate = clip.sample_rate();
    let HeaderSizes {
        block_align,
        byte_rate,
        data_size,
        file_size,
    } = header_sizes(clip.sample_count(), channels, sample_rate)?;

    let mut buf = Vec::with_capacity(WAV_HEADER_LEN + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&PCM_FORMAT_TAG.to_le_bytes());
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in clip.samples() {
        buf.extend_from_slice(&quantize(sample).to_le_bytes());
    }

    Ok(buf)
}

/// Decode a WAV file holding integer PCM samples
///
/// Fails on malformed headers, float or compressed formats, and data that
/// ends before the length the header declares.
pub fn decode(bytes: &[u8]) -> Result<AudioClip, DecodeError> {
    if bytes.len() < WAV_HEADER_LEN {
        return Err(DecodeError::Truncated(format!(
            "{} bytes is shorter than a WAV header",
            bytes.len()
        )));
    }

    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int {
        return Err(DecodeError::UnsupportedFormat(format!(
            "{:?} samples are not PCM",
            spec.sample_format
        )));
    }
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(DecodeError::MalformedHeader(format!(
            "{} channels at {} Hz",
            spec.channels, spec.sample_rate
        )));
    }

    let declared = reader.len() as usize;
    let bits = spec.bits_per_sample;
    let samples = reader
        .into_samples::<i32>()
        .map(|s| s.map(|v| dequantize(v, bits)))
        .collect::<Result<Vec<f32>, _>>()?;

    if samples.len() != declared {
        return Err(DecodeError::Truncated(format!(
            "header declares {} samples, found {}",
            declared,
            samples.len()
        )));
    }

    Ok(AudioClip::new(spec.sample_rate, spec.channels, samples)?)
}

/// Decode concatenated capture chunks of interleaved little-endian `f32`
pub fn decode_raw_f32le(bytes: &[u8], format: StreamFormat) -> Result<AudioClip, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let frame_bytes = format.channels as usize * std::mem::size_of::<f32>();
    if frame_bytes == 0 || bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::Truncated(format!(
            "{} bytes is not a whole number of {}-channel frames",
            bytes.len(),
            format.channels
        )));
    }

    let mut samples = Vec::with_capacity(bytes.len() / 4);
    for (index, raw) in bytes.chunks_exact(4).enumerate() {
        let sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if !sample.is_finite() {
            return Err(DecodeError::NonFinite { index });
        }
        samples.push(sample);
    }

    Ok(AudioClip::new(format.sample_rate, format.channels, samples)?)
}

/// Serialise samples the way capture devices deliver them
pub fn encode_raw_f32le(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
