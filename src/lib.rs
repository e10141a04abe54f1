#![deny(missing_docs)]

//! Real-time background-track mixer for live microphone audio.
//!
//! A [`MixSession`](session::MixSession) is driven by the host audio layer once per capture
//! callback. Each call reads a chunk of the background track, queues it for local playback on a
//! dedicated thread ([`PlaybackQueue`](playback::PlaybackQueue)), scales and averages it with the
//! microphone frame ([`AverageMixer`](pcm::AverageMixer)) and hands the mixed PCM16 frame back to
//! the host. Background failures degrade to microphone pass-through instead of surfacing errors
//! in the audio callback.

use std::sync::Once;
use std::time::Duration;

pub mod config;
pub mod ffi;
pub mod output;
pub mod pcm;
pub mod playback;
pub mod pool;
pub mod session;
pub mod shared;
pub mod source;
pub mod tone;

mod rt;

#[cfg(test)]
mod tests;

pub use config::{PlaybackConfig, RetryPolicy, SessionConfig};
pub use output::{FileOutputs, MemoryOutputs, OutputDevice, OutputFactory, OutputRoute, OutputSpec};
pub use pcm::AverageMixer;
pub use playback::{PlaybackQueue, PlaybackState, PlaybackStats};
pub use session::{MixSession, PassThroughReason, ProcessOutcome, SessionStatus};
pub use source::{FileTrack, MemoryTrack, TrackProvider, TrackSource};

static TRACING_INIT: Once = Once::new();

/// Install the fmt subscriber once per process. Later calls and pre-installed subscribers are
/// left alone.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// Negotiated PCM16 layout of a mix session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFormat {
    /// Interleaved channel count.
    pub channels: u16,
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Bytes per callback frame.
    pub buffer_size: usize,
}

impl SessionFormat {
    /// Derive the frame size for one callback: `channels * 2 * (sample_rate / callbacks_per_second)`.
    ///
    /// Returns `None` when the layout yields an empty frame.
    pub fn negotiate(channels: u16, sample_rate: u32, callbacks_per_second: u32) -> Option<Self> {
        let frames = (sample_rate / callbacks_per_second.max(1)) as usize;
        let buffer_size = channels as usize * pcm::BYTES_PER_SAMPLE * frames;
        (buffer_size > 0).then_some(Self {
            channels,
            sample_rate,
            buffer_size,
        })
    }

    /// Samples per channel in one frame.
    pub fn frames_per_buffer(&self) -> usize {
        self.buffer_size / (self.channels as usize * pcm::BYTES_PER_SAMPLE)
    }
}

/// Failure of the PCM mix step.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MixError {
    /// No tracks were supplied.
    #[error("no tracks to mix")]
    NoTracks,
    /// A track length differs from the first track.
    #[error("track {track} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        /// Index of the offending track.
        track: usize,
        /// Length of the first track.
        expected: usize,
        /// Length of the offending track.
        actual: usize,
    },
}

/// Failure reported by the playback queue.
#[derive(thiserror::Error, Debug)]
pub enum PlaybackError {
    /// The outputs never reported an initialised state.
    #[error("playback outputs unavailable after {attempts} attempts: {reason}")]
    OutputUnavailable {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last failure observed.
        reason: String,
    },
    /// The playback thread did not exit in time.
    #[error("playback thread still running after {0:?}")]
    StopTimeout(Duration),
    /// The playback thread could not be spawned.
    #[error("failed to spawn playback thread: {0}")]
    Spawn(#[from] std::io::Error),
}
