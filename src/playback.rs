//! Buffer-pooled playback queue feeding a dedicated output thread.
//!
//! The producer copies each frame into a pooled buffer and appends it to the pending queue. The
//! playback thread pops frames in FIFO order, writes them to the primary and backup outputs with
//! the queue lock released, then returns the buffer to the pool. Stopping is a flag: the thread
//! notices it between frames, stops both outputs and exits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::PlaybackConfig;
use crate::output::{OutputDevice, OutputFactory, OutputRoute, OutputSpec};
use crate::pool::BufferPool;
use crate::{PlaybackError, SessionFormat, rt};

/// Lifecycle of the playback thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    /// Never started.
    Idle = 0,
    /// Waiting for both outputs to initialise.
    OpeningOutput = 1,
    /// Writing queued frames.
    Playing = 2,
    /// Outputs released after a stop.
    Stopped = 3,
    /// Outputs never became available.
    Failed = 4,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::OpeningOutput,
            2 => PlaybackState::Playing,
            3 => PlaybackState::Stopped,
            4 => PlaybackState::Failed,
            _ => PlaybackState::Idle,
        }
    }
}

/// Counters describing queue traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Frames accepted by `enqueue`.
    pub frames_enqueued: u64,
    /// Frames rejected because the queue was not running.
    pub frames_dropped: u64,
    /// Frames written to both outputs.
    pub frames_played: u64,
    /// Failed output writes.
    pub write_errors: u64,
    /// Buffers allocated because the pool was empty.
    pub buffers_allocated: u64,
    /// Frames waiting for the playback thread.
    pub pending_frames: usize,
    /// Idle buffers held by the pool.
    pub pooled_buffers: usize,
}

struct Queue {
    pending: VecDeque<Vec<u8>>,
    pool: BufferPool,
}

struct Shared {
    running: AtomicBool,
    generation: AtomicU64,
    state: AtomicU8,
    queue: Mutex<Queue>,
    last_error: Mutex<Option<PlaybackError>>,
    frames_enqueued: AtomicU64,
    frames_dropped: AtomicU64,
    frames_played: AtomicU64,
    write_errors: AtomicU64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn owns_state(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn fail(&self, generation: u64, err: PlaybackError) {
        if !self.owns_state(generation) {
            return;
        }
        *self.last_error.lock() = Some(err);
        self.running.store(false, Ordering::Release);
        self.set_state(PlaybackState::Failed);
    }
}

struct Worker {
    handle: JoinHandle<()>,
    exited: Receiver<()>,
}

impl Worker {
    fn join(self) {
        if self.handle.join().is_err() {
            warn!("playback thread panicked");
        }
    }
}

/// The live worker plus superseded ones that have not exited yet.
#[derive(Default)]
struct Workers {
    current: Option<Worker>,
    retired: Vec<Worker>,
}

impl Workers {
    /// Join retired workers that already finished. Never blocks on a busy one.
    fn reap(&mut self) {
        let (finished, busy): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|worker| worker.handle.is_finished());
        self.retired = busy;
        for worker in finished {
            worker.join();
        }
    }
}

/// Producer/consumer queue that plays frames on a dedicated real-time thread.
pub struct PlaybackQueue {
    shared: Arc<Shared>,
    outputs: Arc<dyn OutputFactory>,
    format: SessionFormat,
    config: PlaybackConfig,
    workers: Mutex<Workers>,
}

impl PlaybackQueue {
    /// Create a stopped queue for frames of `format.buffer_size` bytes.
    pub fn new(format: SessionFormat, outputs: Arc<dyn OutputFactory>, config: PlaybackConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                state: AtomicU8::new(PlaybackState::Idle as u8),
                queue: Mutex::new(Queue {
                    pending: VecDeque::new(),
                    pool: BufferPool::new(config.pool_capacity),
                }),
                last_error: Mutex::new(None),
                frames_enqueued: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                frames_played: AtomicU64::new(0),
                write_errors: AtomicU64::new(0),
            }),
            outputs,
            format,
            config,
            workers: Mutex::new(Workers::default()),
        }
    }

    /// Spawn the playback thread. Does nothing while already running.
    ///
    /// Frames left over from a previous run are discarded. Never waits for a previous thread:
    /// one still finishing a write is retired and exits on its own, since its generation is no
    /// longer current. Retired threads are joined later by `start` or `stop_and_wait`.
    pub fn start(&self) -> Result<(), PlaybackError> {
        let mut workers = self.workers.lock();
        if self.shared.running.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(previous) = workers.current.take() {
            workers.retired.push(previous);
        }
        workers.reap();
        if !workers.retired.is_empty() {
            debug!(retired = workers.retired.len(), "previous playback thread still exiting");
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut queue = self.shared.queue.lock();
            while let Some(stale) = queue.pending.pop_front() {
                queue.pool.recycle(stale);
            }
        }
        self.shared.set_state(PlaybackState::OpeningOutput);
        self.shared.running.store(true, Ordering::Release);

        let (exit_tx, exit_rx) = bounded(1);
        let context = WorkerContext {
            shared: self.shared.clone(),
            outputs: self.outputs.clone(),
            format: self.format,
            config: self.config.clone(),
            generation,
        };
        let spawned = thread::Builder::new()
            .name("bgm-playback".into())
            .spawn(move || context.run(exit_tx));

        match spawned {
            Ok(handle) => {
                info!(generation, buffer_size = self.format.buffer_size, "playback started");
                workers.current = Some(Worker {
                    handle,
                    exited: exit_rx,
                });
                Ok(())
            }
            Err(err) => {
                error!(%err, "failed to spawn playback thread");
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_state(PlaybackState::Failed);
                Err(PlaybackError::Spawn(err))
            }
        }
    }

    /// Copy `frame` into a pooled buffer and queue it for playback.
    ///
    /// Returns `false` and drops the frame when the queue is not running.
    pub fn enqueue(&self, frame: &[u8]) -> bool {
        let mut queue = self.shared.queue.lock();
        if !self.shared.running.load(Ordering::Acquire) {
            self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut buffer = queue.pool.acquire(frame.len());
        buffer.copy_from_slice(frame);
        queue.pending.push_back(buffer);
        self.shared.frames_enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Signal the playback thread to stop. Returns immediately.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            debug!("playback stop requested");
        }
    }

    /// Signal stop and block until every playback thread, including retired ones, released
    /// its outputs.
    pub fn stop_and_wait(&self, timeout: Duration) -> Result<(), PlaybackError> {
        self.stop();
        let deadline = Instant::now() + timeout;
        let mut workers = self.workers.lock();
        let mut waiting = std::mem::take(&mut workers.retired);
        waiting.extend(workers.current.take());
        while let Some(worker) = waiting.pop() {
            match worker.exited.recv_deadline(deadline) {
                Err(RecvTimeoutError::Timeout) => {
                    waiting.push(worker);
                    workers.retired = waiting;
                    return Err(PlaybackError::StopTimeout(timeout));
                }
                _ => worker.join(),
            }
        }
        Ok(())
    }

    /// Whether the queue accepts frames.
    pub fn is_playing(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Current playback thread state.
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Frames waiting for the playback thread.
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Idle buffers held by the pool.
    pub fn pooled_len(&self) -> usize {
        self.shared.queue.lock().pool.len()
    }

    /// Frame layout this queue was created for.
    pub fn format(&self) -> SessionFormat {
        self.format
    }

    /// Snapshot of the traffic counters, taking the queue lock once.
    pub fn stats(&self) -> PlaybackStats {
        let (buffers_allocated, pending_frames, pooled_buffers) = {
            let queue = self.shared.queue.lock();
            (queue.pool.allocations(), queue.pending.len(), queue.pool.len())
        };
        PlaybackStats {
            frames_enqueued: self.shared.frames_enqueued.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            frames_played: self.shared.frames_played.load(Ordering::Relaxed),
            write_errors: self.shared.write_errors.load(Ordering::Relaxed),
            buffers_allocated,
            pending_frames,
            pooled_buffers,
        }
    }

    /// Take the fatal error recorded by the last failed run, if any.
    pub fn take_error(&self) -> Option<PlaybackError> {
        self.shared.last_error.lock().take()
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerContext {
    shared: Arc<Shared>,
    outputs: Arc<dyn OutputFactory>,
    format: SessionFormat,
    config: PlaybackConfig,
    generation: u64,
}

impl WorkerContext {
    fn run(self, exited: Sender<()>) {
        if let Some(priority) = self.config.realtime_priority {
            if let Err(err) = rt::promote_current_thread(priority) {
                debug!(%err, "real-time priority unavailable");
            }
        }

        if let Some((mut primary, mut backup)) = self.open_outputs() {
            if self.shared.owns_state(self.generation) {
                self.shared.set_state(PlaybackState::Playing);
            }
            for (route, device) in [
                (OutputRoute::Primary, &mut primary),
                (OutputRoute::Backup, &mut backup),
            ] {
                if let Err(err) = device.play() {
                    warn!(route = route.as_str(), %err, "output refused to start");
                }
            }

            self.play_loop(&mut *primary, &mut *backup);

            close(OutputRoute::Primary, primary);
            close(OutputRoute::Backup, backup);
            if self.shared.owns_state(self.generation) {
                self.shared.set_state(PlaybackState::Stopped);
            }
        } else if self.shared.owns_state(self.generation)
            && self.state() != PlaybackState::Failed
        {
            self.shared.set_state(PlaybackState::Stopped);
        }

        debug!(generation = self.generation, "playback thread exiting");
        let _ = exited.send(());
    }

    fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn play_loop(&self, primary: &mut dyn OutputDevice, backup: &mut dyn OutputDevice) {
        while self.shared.is_current(self.generation) {
            let next = self.shared.queue.lock().pending.pop_front();
            let Some(frame) = next else {
                idle(self.config.idle_poll);
                continue;
            };
            self.write(OutputRoute::Primary, primary, &frame);
            self.write(OutputRoute::Backup, backup, &frame);
            self.shared.frames_played.fetch_add(1, Ordering::Relaxed);
            self.shared.queue.lock().pool.recycle(frame);
        }
    }

    fn write(&self, route: OutputRoute, device: &mut dyn OutputDevice, frame: &[u8]) {
        if let Err(err) = device.write(frame) {
            self.shared.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(route = route.as_str(), %err, "output write failed");
        }
    }

    fn open_outputs(&self) -> Option<(Box<dyn OutputDevice>, Box<dyn OutputDevice>)> {
        let policy = self.config.open_retry;
        let attempts = policy.max_attempts.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            if !self.shared.is_current(self.generation) {
                return None;
            }
            match self.open_route(OutputRoute::Primary).and_then(|primary| {
                self.open_route(OutputRoute::Backup)
                    .map(|backup| (primary, backup))
            }) {
                Ok(pair) => {
                    debug!(attempt, "playback outputs ready");
                    return Some(pair);
                }
                Err(failure) => {
                    debug!(attempt, %failure, "playback outputs not ready");
                    reason = failure;
                }
            }
            idle(policy.retry_delay);
        }

        let err = PlaybackError::OutputUnavailable { attempts, reason };
        error!(%err, "giving up on playback outputs");
        self.shared.fail(self.generation, err);
        None
    }

    fn open_route(&self, route: OutputRoute) -> Result<Box<dyn OutputDevice>, String> {
        let spec = OutputSpec::for_route(
            route,
            self.format.sample_rate,
            self.format.channels,
            self.format.buffer_size,
        );
        let device = self
            .outputs
            .open(&spec)
            .map_err(|err| format!("{}: {err}", route.as_str()))?;
        if device.is_initialized() {
            Ok(device)
        } else {
            Err(format!("{} not initialized", route.as_str()))
        }
    }
}

fn idle(pause: Duration) {
    if pause.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(pause);
    }
}

fn close(route: OutputRoute, mut device: Box<dyn OutputDevice>) {
    if let Err(err) = device.stop() {
        warn!(route = route.as_str(), %err, "failed to stop output");
    }
}
