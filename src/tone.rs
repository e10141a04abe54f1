//! Deterministic PCM16 test tones and simple signal measurements.

use dasp_signal::{ConstHz, Signal, Sine};

use crate::pcm::{BYTES_PER_SAMPLE, decode_sample, encode_sample};

/// Continuous sine generator producing interleaved PCM16 little-endian frames.
///
/// Phase carries over between calls, so consecutive buffers join without clicks.
pub struct ToneGenerator {
    signal: Sine<ConstHz>,
    channels: u16,
    amplitude: f64,
}

impl ToneGenerator {
    /// Sine at `frequency_hz`, `amplitude` in `0.0..=1.0` of full scale, copied to every channel.
    pub fn new(sample_rate: u32, channels: u16, frequency_hz: f64, amplitude: f64) -> Self {
        Self {
            signal: dasp_signal::rate(sample_rate as f64).const_hz(frequency_hz).sine(),
            channels: channels.max(1),
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }

    /// Fill `out` with whole frames. Returns the number of frames written.
    pub fn fill(&mut self, out: &mut [u8]) -> usize {
        let frame_bytes = self.channels as usize * BYTES_PER_SAMPLE;
        let mut frames = 0;
        for frame in out.chunks_exact_mut(frame_bytes) {
            let value = self.signal.next() * self.amplitude * i16::MAX as f64;
            let bytes = encode_sample(value.round() as i16);
            for sample in frame.chunks_exact_mut(BYTES_PER_SAMPLE) {
                sample.copy_from_slice(&bytes);
            }
            frames += 1;
        }
        frames
    }

    /// Render `frames` frames into a new buffer.
    pub fn render(&mut self, frames: usize) -> Vec<u8> {
        let mut out = vec![0u8; frames * self.channels as usize * BYTES_PER_SAMPLE];
        self.fill(&mut out);
        out
    }
}

/// Buffer of `samples` copies of `value`.
pub fn constant_pcm16(value: i16, samples: usize) -> Vec<u8> {
    encode_sample(value).repeat(samples)
}

/// Decode a PCM16 little-endian buffer. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| decode_sample(pair[0], pair[1]))
        .collect()
}

/// Root-mean-square level normalised to full scale (0.0 - 1.0).
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (energy / samples.len() as f64).sqrt() as f32
}

/// Normalised zero-lag correlation between two signals (-1.0 - 1.0).
pub fn correlation(a: &[i16], b: &[i16]) -> f32 {
    let mut dot = 0.0f64;
    let mut energy_a = 0.0f64;
    let mut energy_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        energy_a += x * x;
        energy_b += y * y;
    }
    if energy_a == 0.0 || energy_b == 0.0 {
        0.0
    } else {
        (dot / (energy_a.sqrt() * energy_b.sqrt())) as f32
    }
}
