//! Session and playback tuning.

use std::time::Duration;

use crate::pool::DEFAULT_POOL_CAPACITY;

/// Host callback period assumed when sizing buffers.
pub const DEFAULT_CALLBACK_INTERVAL: Duration = Duration::from_millis(10);

/// Bounded retry schedule for opening the playback outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause between attempts; zero yields the thread instead of sleeping.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 200,
            retry_delay: Duration::from_millis(5),
        }
    }
}

/// Playback thread configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// Idle buffers retained for reuse.
    pub pool_capacity: usize,
    /// Output open retries.
    pub open_retry: RetryPolicy,
    /// Pause when the pending queue is empty; zero yields instead.
    pub idle_poll: Duration,
    /// `SCHED_FIFO` priority requested by the playback thread, `None` to keep the default.
    pub realtime_priority: Option<i32>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            open_retry: RetryPolicy::default(),
            idle_poll: Duration::from_micros(500),
            realtime_priority: Some(10),
        }
    }
}

/// Mix session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Host callback period.
    pub callback_interval: Duration,
    /// Restart the background track when it runs out.
    pub looping: bool,
    /// Initial background scale factor.
    pub background_level: f32,
    /// Initial microphone scale factor.
    pub local_level: f32,
    /// Local playback settings.
    pub playback: PlaybackConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            callback_interval: DEFAULT_CALLBACK_INTERVAL,
            looping: false,
            background_level: 1.0,
            local_level: 1.0,
            playback: PlaybackConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Enable or disable looping of the background track.
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Set the initial background and microphone levels.
    pub fn with_levels(mut self, background: f32, local: f32) -> Self {
        self.background_level = background;
        self.local_level = local;
        self
    }

    /// Replace the playback settings.
    pub fn with_playback(mut self, playback: PlaybackConfig) -> Self {
        self.playback = playback;
        self
    }

    /// Host callbacks per second implied by the callback interval.
    pub fn callbacks_per_second(&self) -> u32 {
        let millis = self.callback_interval.as_millis().max(1);
        (1000 / millis).max(1) as u32
    }
}
