//! PCM audio chunks and WAV framing helpers.
//!
//! All audio inside Parley is signed 16-bit little-endian mono PCM. Chunks
//! carry their own sample rate so that stages can reason about audio time
//! without consulting configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Length in bytes of the canonical RIFF/WAV header.
pub const WAV_HEADER_LEN: usize = 44;

/// Direction of travel for an [`AudioChunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Audio received from the client.
    Inbound,
    /// Audio synthesized for the client.
    Outbound,
}

/// Errors produced while decoding PCM payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcmError {
    /// s16le payloads must contain an even number of bytes.
    #[error("PCM payload has odd length {0}")]
    OddLength(usize),
}

/// An ordered block of PCM samples.
///
/// `seq` is monotonically increasing per direction within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub seq: u64,
    pub direction: Direction,
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl AudioChunk {
    pub fn new(seq: u64, direction: Direction, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            seq,
            direction,
            sample_rate,
            samples,
        }
    }

    /// Decodes an s16le payload into a chunk.
    pub fn from_le_bytes(
        seq: u64,
        direction: Direction,
        sample_rate: u32,
        bytes: &[u8],
    ) -> Result<Self, PcmError> {
        Ok(Self::new(seq, direction, sample_rate, decode_s16le(bytes)?))
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        encode_s16le(&self.samples)
    }

    /// Encodes the chunk as a self-contained mono WAV file.
    pub fn to_wav(&self) -> Vec<u8> {
        let data = self.to_le_bytes();
        let mut out = Vec::with_capacity(WAV_HEADER_LEN + data.len());
        out.extend_from_slice(&wav_header(self.sample_rate, 1, data.len() as u32));
        out.extend_from_slice(&data);
        out
    }

    /// Audio time covered by this chunk. Zero if the sample rate is zero.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(
            self.samples.len() as u64 * 1_000_000_000 / u64::from(self.sample_rate),
        )
    }

    /// Root-mean-square amplitude normalized to `0.0..=1.0`.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Root-mean-square amplitude of `samples`, normalized to `0.0..=1.0`.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / f64::from(i16::MAX);
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).min(1.0)
}

pub fn decode_s16le(bytes: &[u8]) -> Result<Vec<i16>, PcmError> {
    if bytes.len() % 2 != 0 {
        return Err(PcmError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn encode_s16le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Returns `bytes` without a leading RIFF/WAVE header, if one is present.
pub fn strip_wav_header(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= WAV_HEADER_LEN && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        &bytes[WAV_HEADER_LEN..]
    } else {
        bytes
    }
}

/// Builds a 44-byte PCM s16le WAV header.
pub fn wav_header(sample_rate: u32, channels: u16, data_len: u32) -> [u8; WAV_HEADER_LEN] {
    let bits_per_sample: u16 = 16;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}
