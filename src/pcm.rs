//! Integer-domain PCM16 scaling and averaging mix.
//!
//! Buffers are raw interleaved signed 16-bit little-endian samples. Scaling happens in place and
//! mixing reuses the first track as the destination; neither allocates.

use tracing::error;

use crate::MixError;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Decode one little-endian sample.
#[inline]
pub fn decode_sample(lo: u8, hi: u8) -> i16 {
    i16::from_le_bytes([lo, hi])
}

/// Encode one sample as little-endian bytes.
#[inline]
pub fn encode_sample(sample: i16) -> [u8; 2] {
    sample.to_le_bytes()
}

/// Stateless averaging mixer for equal-length PCM16 tracks.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageMixer;

impl AverageMixer {
    /// Construct a mixer.
    pub fn new() -> Self {
        Self
    }

    /// Multiply every sample in `buffer[..length]` by `factor` in place and return the buffer.
    ///
    /// Products outside the `i16` range wrap rather than clamp, so factors above 1.0 can
    /// distort loud material. `length` should be even; a trailing odd byte is left untouched.
    pub fn scale<'a>(&self, buffer: &'a mut [u8], length: usize, factor: f32) -> &'a mut [u8] {
        let length = length.min(buffer.len());
        for pair in buffer[..length].chunks_exact_mut(BYTES_PER_SAMPLE) {
            let sample = decode_sample(pair[0], pair[1]);
            let scaled = (sample as f32 * factor) as i32 as i16;
            pair.copy_from_slice(&encode_sample(scaled));
        }
        buffer
    }

    /// Average `tracks` sample by sample into the first track and return it.
    ///
    /// A single track is returned as-is. The per-index sum is accumulated in `i32` and divided
    /// by the track count, truncating toward zero.
    pub fn mix<'a>(&self, tracks: &'a mut [&mut [u8]]) -> Result<&'a mut [u8], MixError> {
        let Some((first, rest)) = tracks.split_first_mut() else {
            error!("mix called without tracks");
            return Err(MixError::NoTracks);
        };

        let expected = first.len();
        if let Some((index, track)) = rest
            .iter()
            .enumerate()
            .find(|(_, track)| track.len() != expected)
        {
            let err = MixError::LengthMismatch {
                track: index + 1,
                expected,
                actual: track.len(),
            };
            error!(%err, "mix rejected tracks");
            return Err(err);
        }

        if rest.is_empty() {
            return Ok(&mut **first);
        }

        let count = (rest.len() + 1) as i32;
        for offset in (0..expected - expected % BYTES_PER_SAMPLE).step_by(BYTES_PER_SAMPLE) {
            let mut sum = decode_sample(first[offset], first[offset + 1]) as i32;
            for track in rest.iter() {
                sum += decode_sample(track[offset], track[offset + 1]) as i32;
            }
            let mean = (sum / count) as i16;
            first[offset..offset + BYTES_PER_SAMPLE].copy_from_slice(&encode_sample(mean));
        }

        Ok(&mut **first)
    }
}
