use std::thread;
use std::time::{Duration, Instant};

use crate::config::{PlaybackConfig, RetryPolicy};
use crate::pcm::{decode_sample, encode_sample};

mod buffer_pool;
mod host_outputs;
mod tone_selftest;
mod track_sources;

fn pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| encode_sample(s)).collect()
}

fn samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| decode_sample(pair[0], pair[1]))
        .collect()
}

fn playback_config() -> PlaybackConfig {
    PlaybackConfig {
        open_retry: RetryPolicy {
            max_attempts: 5,
            retry_delay: Duration::from_millis(1),
        },
        realtime_priority: None,
        ..PlaybackConfig::default()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
