//! C ABI for hosts that drive a mix session from native audio callbacks.
//!
//! Handles are heap-allocated [`MixSession`]s. Local playback is routed through a
//! [`HostOutputCallbacks`] table so the host keeps ownership of its audio devices.

use std::collections::VecDeque;
use std::ffi::{CStr, CString, c_char, c_void};
use std::io;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::init_tracing;
use crate::output::{OutputDevice, OutputFactory, OutputSpec};
use crate::session::{MixSession, ProcessOutcome};
use crate::source::{FileTrack, MemoryTrack, TrackProvider};

const LOG_CAPACITY: usize = 256;
const DESTROY_TIMEOUT: Duration = Duration::from_millis(200);

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static LOG_CACHE: Lazy<Mutex<Option<CString>>> = Lazy::new(|| Mutex::new(None));

pub(crate) fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > LOG_CAPACITY {
        guard.pop_front();
    }
}

/// Open an output. Returns an opaque device pointer, or null when the route is not ready yet.
pub type OpenOutputFn = extern "C" fn(
    user_data: *mut c_void,
    route: u32,
    sample_rate: u32,
    channels: u32,
    buffer_size: u32,
) -> *mut c_void;

/// Write `len` bytes of PCM16 to a device. Returns bytes written or a negative error code.
pub type WriteOutputFn =
    extern "C" fn(user_data: *mut c_void, device: *mut c_void, data: *const u8, len: usize) -> isize;

/// Release a device returned by [`OpenOutputFn`].
pub type CloseOutputFn = extern "C" fn(user_data: *mut c_void, device: *mut c_void);

/// Start or halt a device. Returns `0` on success, any other value is an error code.
pub type DeviceControlFn = extern "C" fn(user_data: *mut c_void, device: *mut c_void) -> i32;

/// Host-provided playback outputs.
///
/// `route` is `0` for the primary output and `1` for the backup route. The callbacks are invoked
/// from the playback thread, so `user_data` must be safe to use from there.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostOutputCallbacks {
    /// Opaque pointer handed back to every callback.
    pub user_data: *mut c_void,
    /// Device open callback.
    pub open: Option<OpenOutputFn>,
    /// Device write callback.
    pub write: Option<WriteOutputFn>,
    /// Device close callback, optional.
    pub close: Option<CloseOutputFn>,
    /// Called once a device is open and about to receive frames, optional.
    pub play: Option<DeviceControlFn>,
    /// Called before a device is closed, optional.
    pub stop: Option<DeviceControlFn>,
}

// The host promises the callback table is usable from the playback thread.
unsafe impl Send for HostOutputCallbacks {}
unsafe impl Sync for HostOutputCallbacks {}

pub(crate) struct HostOutputs {
    pub(crate) callbacks: HostOutputCallbacks,
}

impl OutputFactory for HostOutputs {
    fn open(&self, spec: &OutputSpec) -> io::Result<Box<dyn OutputDevice>> {
        let open = self
            .callbacks
            .open
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "host open callback missing"))?;
        let buffer_size = u32::try_from(spec.buffer_size).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer size {} exceeds the host ABI", spec.buffer_size),
            )
        })?;
        let device = open(
            self.callbacks.user_data,
            spec.route.id(),
            spec.sample_rate,
            u32::from(spec.channels),
            buffer_size,
        );
        Ok(Box::new(HostDevice {
            callbacks: self.callbacks,
            device,
        }))
    }
}

struct HostDevice {
    callbacks: HostOutputCallbacks,
    device: *mut c_void,
}

unsafe impl Send for HostDevice {}

impl OutputDevice for HostDevice {
    fn is_initialized(&self) -> bool {
        !self.device.is_null()
    }

    fn play(&mut self) -> io::Result<()> {
        self.control(self.callbacks.play, "play")
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<usize> {
        let write = self
            .callbacks
            .write
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "host write callback missing"))?;
        let written = write(self.callbacks.user_data, self.device, frame.as_ptr(), frame.len());
        usize::try_from(written)
            .map_err(|_| io::Error::other(format!("host write failed with code {written}")))
    }

    fn stop(&mut self) -> io::Result<()> {
        self.control(self.callbacks.stop, "stop")
    }
}

impl HostDevice {
    fn control(&self, callback: Option<DeviceControlFn>, action: &str) -> io::Result<()> {
        let Some(callback) = callback else {
            return Ok(());
        };
        match callback(self.callbacks.user_data, self.device) {
            0 => Ok(()),
            code => Err(io::Error::other(format!("host {action} failed with code {code}"))),
        }
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        if self.device.is_null() {
            return;
        }
        if let Some(close) = self.callbacks.close {
            close(self.callbacks.user_data, self.device);
        }
        self.device = ptr::null_mut();
    }
}

fn create_session(
    provider: Arc<dyn TrackProvider>,
    looping: bool,
    outputs: *const HostOutputCallbacks,
) -> *mut MixSession {
    if outputs.is_null() {
        push_log("session_create rejected: null output callbacks");
        return ptr::null_mut();
    }
    let callbacks = unsafe { *outputs };
    if callbacks.open.is_none() || callbacks.write.is_none() {
        push_log("session_create rejected: incomplete output callbacks");
        return ptr::null_mut();
    }
    push_log(format!("session_create track={} looping={looping}", provider.name()));
    let session = MixSession::new(
        provider,
        Arc::new(HostOutputs { callbacks }),
        SessionConfig::default().with_looping(looping),
    );
    Box::into_raw(Box::new(session))
}

/// Create a session mixing an in-memory PCM16 track. The bytes are copied.
///
/// # Safety
/// `data` must point to `len` readable bytes and `outputs` to a valid callback table.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_create_memory(
    data: *const u8,
    len: usize,
    looping: bool,
    outputs: *const HostOutputCallbacks,
) -> *mut MixSession {
    init_tracing();
    if data.is_null() {
        push_log("session_create rejected: null track data");
        return ptr::null_mut();
    }
    let bytes = unsafe { std::slice::from_raw_parts(data, len) };
    let track = MemoryTrack::new("memory", bytes.to_vec());
    create_session(Arc::new(track), looping, outputs)
}

/// Create a session mixing a raw PCM16 file, memory-mapped on demand.
///
/// # Safety
/// `path` must be a NUL-terminated UTF-8 string and `outputs` a valid callback table.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_create_file(
    path: *const c_char,
    looping: bool,
    outputs: *const HostOutputCallbacks,
) -> *mut MixSession {
    init_tracing();
    if path.is_null() {
        push_log("session_create rejected: null path");
        return ptr::null_mut();
    }
    let Ok(path) = unsafe { CStr::from_ptr(path) }.to_str() else {
        push_log("session_create rejected: path is not UTF-8");
        return ptr::null_mut();
    };
    create_session(Arc::new(FileTrack::new(path)), looping, outputs)
}

/// Stop a session, wait briefly for its playback thread and free it.
///
/// # Safety
/// `handle` must come from a `bgm_kit_session_create_*` call and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_destroy(handle: *mut MixSession) {
    if handle.is_null() {
        return;
    }
    let session = unsafe { Box::from_raw(handle) };
    if let Err(err) = session.stop_and_wait(DESTROY_TIMEOUT) {
        warn!(%err, "destroying session with playback still running");
        push_log(format!("session_destroy: {err}"));
    } else {
        push_log("session_destroy");
    }
}

/// Arm the session and open its track. Returns whether the track is ready.
///
/// # Safety
/// `handle` must be a live session handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_start(handle: *mut MixSession) -> bool {
    if handle.is_null() {
        return false;
    }
    let session = unsafe { &*handle };
    let ready = session.start();
    push_log(format!("session_start ready={ready}"));
    ready
}

/// Stop the session without waiting for the playback thread.
///
/// # Safety
/// `handle` must be a live session handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_stop(handle: *mut MixSession) {
    if handle.is_null() {
        return;
    }
    unsafe { &*handle }.stop();
    push_log("session_stop");
}

/// Mix the background track into `len` bytes of PCM16 at `data`.
///
/// Returns `1` when the buffer now holds the mix, `0` when it was left as captured and `-1` for
/// invalid arguments. `audio_format` is accepted for host compatibility and assumed PCM16.
///
/// # Safety
/// `handle` must be a live session handle and `data` must point to `len` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_process(
    handle: *mut MixSession,
    audio_format: i32,
    channels: u32,
    sample_rate: u32,
    data: *mut u8,
    len: usize,
) -> i32 {
    if handle.is_null() || data.is_null() {
        return -1;
    }
    let Ok(channels) = u16::try_from(channels) else {
        push_log(format!("session_process rejected: {channels} channels"));
        return -1;
    };
    let session = unsafe { &*handle };
    let frame = unsafe { std::slice::from_raw_parts_mut(data, len) };
    match session.process(channels, sample_rate, frame) {
        ProcessOutcome::Mixed => 1,
        ProcessOutcome::PassThrough(reason) => {
            debug!(audio_format, ?reason, "process passed through");
            0
        }
    }
}

/// Set the background scale factor. Returns `false` for a null handle.
///
/// # Safety
/// `handle` must be a live session handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_set_background_level(
    handle: *mut MixSession,
    level: f32,
) -> bool {
    if handle.is_null() {
        return false;
    }
    unsafe { &*handle }.adjust_background_level(level);
    true
}

/// Set the microphone scale factor. Returns `false` for a null handle.
///
/// # Safety
/// `handle` must be a live session handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_set_local_level(
    handle: *mut MixSession,
    level: f32,
) -> bool {
    if handle.is_null() {
        return false;
    }
    unsafe { &*handle }.adjust_local_level(level);
    true
}

/// Whether local playback is running.
///
/// # Safety
/// `handle` must be a live session handle or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bgm_kit_session_is_playing(handle: *mut MixSession) -> bool {
    if handle.is_null() {
        return false;
    }
    unsafe { &*handle }.is_playing()
}

/// Pop the oldest buffered log line, or null when empty.
///
/// The returned string stays valid until the next call.
#[unsafe(no_mangle)]
pub extern "C" fn bgm_kit_pop_log() -> *const c_char {
    if let Some(message) = LOG_BUFFER.lock().pop_front() {
        let mut cache = LOG_CACHE.lock();
        *cache = Some(CString::new(message).unwrap_or_default());
        cache.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null())
    } else {
        ptr::null()
    }
}
