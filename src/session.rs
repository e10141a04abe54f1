//! Per-callback mix pipeline.
//!
//! The host calls [`MixSession::process`] once per capture interval with the live microphone
//! frame. The session reads a frame-sized chunk of the background track, queues it for local
//! playback, scales both signals and replaces the host frame with their average. Any failure on
//! the background side leaves the microphone frame untouched for that callback.
//!
//! The callback state sits behind a mutex shared only with the `start`/`stop` lifecycle calls.
//! Control-surface readers (`status`, `is_playing`, levels) never touch it: they read atomics
//! and a monitor handle to the playback queue published at initialisation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::output::OutputFactory;
use crate::pcm::AverageMixer;
use crate::playback::{PlaybackQueue, PlaybackState, PlaybackStats};
use crate::source::{TrackProvider, TrackSource, read_full};
use crate::{PlaybackError, SessionFormat};

/// Why a callback returned the microphone frame unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughReason {
    /// The session was stopped.
    Stopped,
    /// The host format yields an empty frame.
    UnsupportedFormat,
    /// No background track is open.
    SourceUnavailable,
    /// The background track ran out before a full frame.
    SourceExhausted,
    /// Reading the background track failed.
    ReadFailed,
    /// The host frame length differs from the negotiated frame size.
    FrameSizeMismatch,
    /// The mixer rejected the tracks.
    MixFailed,
}

/// Result of one [`MixSession::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The frame now holds the mixed signal.
    Mixed,
    /// The frame was left untouched.
    PassThrough(PassThroughReason),
}

impl ProcessOutcome {
    /// Whether the frame was replaced by the mix.
    pub fn is_mixed(self) -> bool {
        matches!(self, ProcessOutcome::Mixed)
    }
}

/// Snapshot of a session for control surfaces.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Background track name.
    pub track: String,
    /// A format has been negotiated and per-session buffers exist.
    pub active: bool,
    /// The session was stopped and ignores callbacks until started again.
    pub stopped: bool,
    /// A background cursor is open.
    pub source_open: bool,
    /// Negotiated layout, once the first callback arrived.
    pub format: Option<SessionFormat>,
    /// Background scale factor.
    pub background_level: f32,
    /// Microphone scale factor.
    pub local_level: f32,
    /// Whether the track restarts when exhausted.
    pub looping: bool,
    /// Playback thread state, when a playback queue exists.
    pub playback_state: Option<PlaybackState>,
    /// Playback counters, when a playback queue exists.
    pub playback: Option<PlaybackStats>,
    /// Frames awaiting local playback.
    pub pending_frames: usize,
    /// Idle buffers held by the playback pool.
    pub pooled_buffers: usize,
    /// Callbacks that produced a mix.
    pub frames_mixed: u64,
    /// Callbacks that passed the microphone through.
    pub frames_passed_through: u64,
    /// Times the background track was restarted.
    pub track_restarts: u64,
}

struct Active {
    format: SessionFormat,
    background: Vec<u8>,
    mic_cache: Vec<u8>,
    mixer: AverageMixer,
    playback: Arc<PlaybackQueue>,
}

/// Reader-side view of the active run.
#[derive(Clone)]
struct Monitor {
    format: SessionFormat,
    playback: Arc<PlaybackQueue>,
}

#[derive(Default)]
struct State {
    stopped: bool,
    source: Option<Box<dyn TrackSource>>,
    active: Option<Active>,
    last_pass_through: Option<PassThroughReason>,
}

/// Mixes a background track under the live microphone signal.
pub struct MixSession {
    provider: Arc<dyn TrackProvider>,
    outputs: Arc<dyn OutputFactory>,
    config: SessionConfig,
    background_level: AtomicU32,
    local_level: AtomicU32,
    looping: AtomicBool,
    state: Mutex<State>,
    monitor: RwLock<Option<Monitor>>,
    stopped: AtomicBool,
    source_open: AtomicBool,
    frames_mixed: AtomicU64,
    frames_passed_through: AtomicU64,
    track_restarts: AtomicU64,
}

impl MixSession {
    /// Create a session reading from `provider` and playing locally through `outputs`.
    ///
    /// Nothing is opened until [`start`](Self::start) or the first [`process`](Self::process).
    pub fn new(
        provider: Arc<dyn TrackProvider>,
        outputs: Arc<dyn OutputFactory>,
        config: SessionConfig,
    ) -> Self {
        Self {
            provider,
            outputs,
            background_level: AtomicU32::new(config.background_level.to_bits()),
            local_level: AtomicU32::new(config.local_level.to_bits()),
            looping: AtomicBool::new(config.looping),
            config,
            state: Mutex::new(State::default()),
            monitor: RwLock::new(None),
            stopped: AtomicBool::new(false),
            source_open: AtomicBool::new(false),
            frames_mixed: AtomicU64::new(0),
            frames_passed_through: AtomicU64::new(0),
            track_restarts: AtomicU64::new(0),
        }
    }

    /// Arm the session and open the background track. Returns whether the track is ready.
    ///
    /// Frame buffers are still sized lazily on the first callback because the host format is
    /// only known then. The track is opened without holding the callback lock.
    pub fn start(&self) -> bool {
        let needs_source = {
            let mut state = self.state.lock();
            if state.stopped {
                state.stopped = false;
                state.last_pass_through = None;
                self.stopped.store(false, Ordering::Release);
                info!(track = self.provider.name(), "mix session re-armed");
            }
            state.source.is_none()
        };
        if !needs_source {
            return true;
        }

        let opened = self.open_source();
        let mut state = self.state.lock();
        if state.source.is_none() {
            state.source = opened;
        }
        let open = state.source.is_some();
        self.source_open.store(open, Ordering::Release);
        open
    }

    /// Mix the background track into `frame` in place.
    ///
    /// `frame` holds interleaved PCM16 little-endian samples for `channels` channels at
    /// `sample_rate`. On any background failure the frame is left as captured.
    pub fn process(&self, channels: u16, sample_rate: u32, frame: &mut [u8]) -> ProcessOutcome {
        let mut state = self.state.lock();
        let outcome = self.process_locked(&mut state, channels, sample_rate, frame);
        self.source_open.store(state.source.is_some(), Ordering::Release);

        match outcome {
            ProcessOutcome::Mixed => {
                self.frames_mixed.fetch_add(1, Ordering::Relaxed);
                if let Some(previous) = state.last_pass_through.take() {
                    debug!(?previous, "mixing resumed");
                }
            }
            ProcessOutcome::PassThrough(reason) => {
                self.frames_passed_through.fetch_add(1, Ordering::Relaxed);
                if state.last_pass_through != Some(reason) {
                    debug!(?reason, "passing microphone through");
                    state.last_pass_through = Some(reason);
                }
            }
        }
        outcome
    }

    /// Release the track, buffers and mixer and signal the playback thread to stop.
    ///
    /// Returns immediately; the playback thread exits on its own. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(playback) = self.teardown(&mut state) {
            playback.stop();
        }
    }

    /// Like [`stop`](Self::stop) but waits for the playback thread to release its outputs.
    pub fn stop_and_wait(&self, timeout: Duration) -> Result<(), PlaybackError> {
        let playback = {
            let mut state = self.state.lock();
            self.teardown(&mut state)
        };
        match playback {
            Some(playback) => playback.stop_and_wait(timeout),
            None => Ok(()),
        }
    }

    /// Set the background scale factor applied from the next callback on.
    pub fn adjust_background_level(&self, level: f32) {
        self.background_level.store(level.to_bits(), Ordering::Relaxed);
        debug!(level, "background level adjusted");
    }

    /// Set the microphone scale factor applied from the next callback on.
    pub fn adjust_local_level(&self, level: f32) {
        self.local_level.store(level.to_bits(), Ordering::Relaxed);
        debug!(level, "local level adjusted");
    }

    /// Current background scale factor.
    pub fn background_level(&self) -> f32 {
        f32::from_bits(self.background_level.load(Ordering::Relaxed))
    }

    /// Current microphone scale factor.
    pub fn local_level(&self) -> f32 {
        f32::from_bits(self.local_level.load(Ordering::Relaxed))
    }

    /// Enable or disable restarting the track when it runs out.
    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Relaxed);
    }

    /// Whether the track restarts when it runs out.
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Relaxed)
    }

    /// Whether local playback is currently running.
    pub fn is_playing(&self) -> bool {
        self.monitor
            .read()
            .as_ref()
            .is_some_and(|monitor| monitor.playback.is_playing())
    }

    /// Take the fatal error reported by the playback thread, if any.
    pub fn take_playback_error(&self) -> Option<PlaybackError> {
        self.monitor
            .read()
            .as_ref()
            .and_then(|monitor| monitor.playback.take_error())
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot the session state without taking the callback lock.
    pub fn status(&self) -> SessionStatus {
        let monitor = self.monitor.read().clone();
        let stats = monitor.as_ref().map(|m| m.playback.stats());
        SessionStatus {
            track: self.provider.name().to_string(),
            active: monitor.is_some(),
            stopped: self.stopped.load(Ordering::Acquire),
            source_open: self.source_open.load(Ordering::Acquire),
            format: monitor.as_ref().map(|m| m.format),
            background_level: self.background_level(),
            local_level: self.local_level(),
            looping: self.is_looping(),
            playback_state: monitor.as_ref().map(|m| m.playback.state()),
            playback: stats,
            pending_frames: stats.map_or(0, |s| s.pending_frames),
            pooled_buffers: stats.map_or(0, |s| s.pooled_buffers),
            frames_mixed: self.frames_mixed.load(Ordering::Relaxed),
            frames_passed_through: self.frames_passed_through.load(Ordering::Relaxed),
            track_restarts: self.track_restarts.load(Ordering::Relaxed),
        }
    }

    fn process_locked(
        &self,
        state: &mut State,
        channels: u16,
        sample_rate: u32,
        frame: &mut [u8],
    ) -> ProcessOutcome {
        if state.stopped {
            return ProcessOutcome::PassThrough(PassThroughReason::Stopped);
        }
        if state.active.is_none() {
            if let Err(reason) = self.initialize(state, channels, sample_rate) {
                return ProcessOutcome::PassThrough(reason);
            }
        }

        let State { source, active, .. } = state;
        let Some(active) = active.as_mut() else {
            return ProcessOutcome::PassThrough(PassThroughReason::UnsupportedFormat);
        };

        if let Err(reason) = read_background(source, &mut active.background) {
            self.recover(source, &active.playback, reason);
            return ProcessOutcome::PassThrough(reason);
        }

        if !active.playback.is_playing() {
            if let Err(err) = active.playback.start() {
                warn!(%err, "local playback unavailable");
            }
        }
        active.playback.enqueue(&active.background);

        let size = active.format.buffer_size;
        if frame.len() != size {
            return ProcessOutcome::PassThrough(PassThroughReason::FrameSizeMismatch);
        }
        active.mic_cache.copy_from_slice(frame);

        let mixer = active.mixer;
        mixer.scale(&mut active.background, size, self.background_level());
        mixer.scale(&mut active.mic_cache, size, self.local_level());
        let mut tracks = [active.background.as_mut_slice(), active.mic_cache.as_mut_slice()];
        match mixer.mix(&mut tracks) {
            Ok(mixed) => {
                frame.copy_from_slice(mixed);
                ProcessOutcome::Mixed
            }
            Err(_) => ProcessOutcome::PassThrough(PassThroughReason::MixFailed),
        }
    }

    fn initialize(
        &self,
        state: &mut State,
        channels: u16,
        sample_rate: u32,
    ) -> Result<(), PassThroughReason> {
        let Some(format) =
            SessionFormat::negotiate(channels, sample_rate, self.config.callbacks_per_second())
        else {
            if state.last_pass_through != Some(PassThroughReason::UnsupportedFormat) {
                warn!(channels, sample_rate, "unsupported capture format");
            }
            return Err(PassThroughReason::UnsupportedFormat);
        };

        if state.source.is_none() {
            state.source = self.open_source();
        }
        let playback = Arc::new(PlaybackQueue::new(
            format,
            self.outputs.clone(),
            self.config.playback.clone(),
        ));
        state.active = Some(Active {
            format,
            background: vec![0u8; format.buffer_size],
            mic_cache: vec![0u8; format.buffer_size],
            mixer: AverageMixer::new(),
            playback: playback.clone(),
        });
        *self.monitor.write() = Some(Monitor { format, playback });
        info!(
            track = self.provider.name(),
            channels,
            sample_rate,
            buffer_size = format.buffer_size,
            "mix session initialised"
        );
        Ok(())
    }

    fn open_source(&self) -> Option<Box<dyn TrackSource>> {
        match self.provider.open() {
            Ok(source) => Some(source),
            Err(err) => {
                warn!(track = self.provider.name(), %err, "failed to open background track");
                None
            }
        }
    }

    fn recover(
        &self,
        source: &mut Option<Box<dyn TrackSource>>,
        playback: &PlaybackQueue,
        reason: PassThroughReason,
    ) {
        if self.is_looping() {
            let rewound = match (reason, source.as_mut()) {
                (PassThroughReason::SourceExhausted, Some(open)) => match open.rewind() {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(%err, "rewind failed, reopening background track");
                        false
                    }
                },
                _ => false,
            };
            if !rewound {
                *source = self.open_source();
            }
            if source.is_some() {
                self.track_restarts.fetch_add(1, Ordering::Relaxed);
                info!(track = self.provider.name(), ?reason, "background track restarted");
            }
        }
        playback.stop();
    }

    fn teardown(&self, state: &mut State) -> Option<Arc<PlaybackQueue>> {
        let was_running = !state.stopped;
        state.stopped = true;
        state.last_pass_through = Some(PassThroughReason::Stopped);
        state.source = None;
        self.stopped.store(true, Ordering::Release);
        self.source_open.store(false, Ordering::Release);
        self.monitor.write().take();
        let playback = state.active.take().map(|active| active.playback);
        if was_running {
            info!(track = self.provider.name(), "mix session stopped");
        }
        playback
    }
}

fn read_background(
    source: &mut Option<Box<dyn TrackSource>>,
    buffer: &mut [u8],
) -> Result<(), PassThroughReason> {
    let Some(source) = source.as_mut() else {
        return Err(PassThroughReason::SourceUnavailable);
    };
    match read_full(&mut **source, buffer) {
        Ok(n) if n == buffer.len() => Ok(()),
        Ok(_) => Err(PassThroughReason::SourceExhausted),
        Err(err) => {
            warn!(%err, "background track read failed");
            Err(PassThroughReason::ReadFailed)
        }
    }
}
