//! Physical output abstraction used by the playback thread.
//!
//! The playback thread opens two routes per run: the primary route at the session channel count
//! and a mono backup route. Writes are expected to block until the device accepted the data;
//! that blocking paces the playback thread.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Output routing class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputRoute {
    /// Media/speaker route carrying the session channel layout.
    Primary,
    /// Voice-call style mono route kept open alongside the primary one.
    Backup,
}

impl OutputRoute {
    /// Both routes in write order.
    pub const ALL: [OutputRoute; 2] = [OutputRoute::Primary, OutputRoute::Backup];

    /// Short lowercase route name.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputRoute::Primary => "primary",
            OutputRoute::Backup => "backup",
        }
    }

    /// Stable numeric identifier used across the C ABI.
    pub fn id(self) -> u32 {
        match self {
            OutputRoute::Primary => 0,
            OutputRoute::Backup => 1,
        }
    }
}

/// Parameters used to open one output route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    /// Route being opened.
    pub route: OutputRoute,
    /// Sample rate in Hertz.
    pub sample_rate: u32,
    /// Channel count for this route.
    pub channels: u16,
    /// Device buffer size in bytes.
    pub buffer_size: usize,
}

impl OutputSpec {
    /// Build the spec for `route` from the session layout.
    pub fn for_route(route: OutputRoute, sample_rate: u32, channels: u16, buffer_size: usize) -> Self {
        let channels = match route {
            OutputRoute::Primary => channels,
            OutputRoute::Backup => 1,
        };
        Self {
            route,
            sample_rate,
            channels,
            buffer_size,
        }
    }
}

/// An opened physical output. Dropping it releases the device.
pub trait OutputDevice: Send {
    /// Whether the device finished initialising and can accept `play`.
    fn is_initialized(&self) -> bool;
    /// Begin output.
    fn play(&mut self) -> io::Result<()>;
    /// Write PCM16 bytes, blocking until accepted. Returns bytes written.
    fn write(&mut self, pcm: &[u8]) -> io::Result<usize>;
    /// Halt output.
    fn stop(&mut self) -> io::Result<()>;
}

/// Opens output devices on behalf of the playback thread.
pub trait OutputFactory: Send + Sync {
    /// Open a device for `spec`. The device may report itself uninitialised, in which case the
    /// playback thread drops it and retries.
    fn open(&self, spec: &OutputSpec) -> io::Result<Box<dyn OutputDevice>>;
}

#[derive(Default)]
struct CaptureState {
    primary: Vec<u8>,
    backup: Vec<u8>,
    writes: Vec<(OutputRoute, usize)>,
    opened: Vec<OutputSpec>,
    live: usize,
    playing: usize,
}

/// Output factory that records every write in memory.
///
/// Clones share the same capture, so a test can keep one handle while the playback thread owns
/// the devices.
#[derive(Clone, Default)]
pub struct MemoryOutputs {
    state: Arc<Mutex<CaptureState>>,
    pacing: Option<Duration>,
}

impl MemoryOutputs {
    /// Create an unpaced capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `pacing` on every write, simulating a device that blocks for one buffer.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }

    /// Bytes written so far to `route`.
    pub fn captured(&self, route: OutputRoute) -> Vec<u8> {
        let state = self.state.lock();
        match route {
            OutputRoute::Primary => state.primary.clone(),
            OutputRoute::Backup => state.backup.clone(),
        }
    }

    /// Sequence of `(route, len)` writes in the order they happened.
    pub fn writes(&self) -> Vec<(OutputRoute, usize)> {
        self.state.lock().writes.clone()
    }

    /// Every spec passed to `open`, in order.
    pub fn opened(&self) -> Vec<OutputSpec> {
        self.state.lock().opened.clone()
    }

    /// Devices opened and not yet released.
    pub fn live_devices(&self) -> usize {
        self.state.lock().live
    }

    /// Devices currently between `play` and `stop`.
    pub fn playing_devices(&self) -> usize {
        self.state.lock().playing
    }
}

impl OutputFactory for MemoryOutputs {
    fn open(&self, spec: &OutputSpec) -> io::Result<Box<dyn OutputDevice>> {
        let mut state = self.state.lock();
        state.opened.push(*spec);
        state.live += 1;
        Ok(Box::new(MemoryDevice {
            route: spec.route,
            state: self.state.clone(),
            pacing: self.pacing,
            playing: false,
        }))
    }
}

struct MemoryDevice {
    route: OutputRoute,
    state: Arc<Mutex<CaptureState>>,
    pacing: Option<Duration>,
    playing: bool,
}

impl OutputDevice for MemoryDevice {
    fn is_initialized(&self) -> bool {
        true
    }

    fn play(&mut self) -> io::Result<()> {
        if !self.playing {
            self.playing = true;
            self.state.lock().playing += 1;
        }
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> io::Result<usize> {
        if let Some(pacing) = self.pacing {
            std::thread::sleep(pacing);
        }
        let mut state = self.state.lock();
        match self.route {
            OutputRoute::Primary => state.primary.extend_from_slice(pcm),
            OutputRoute::Backup => state.backup.extend_from_slice(pcm),
        }
        state.writes.push((self.route, pcm.len()));
        Ok(pcm.len())
    }

    fn stop(&mut self) -> io::Result<()> {
        if self.playing {
            self.playing = false;
            self.state.lock().playing -= 1;
        }
        Ok(())
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if self.playing {
            state.playing -= 1;
        }
        state.live -= 1;
    }
}

/// Output factory writing each route to `<dir>/<route>.pcm` as raw PCM16.
///
/// The first open of a route truncates its file; later opens, such as a playback restart after
/// the track looped, append. Clones share that bookkeeping.
#[derive(Debug, Clone)]
pub struct FileOutputs {
    dir: PathBuf,
    opened: Arc<Mutex<HashSet<OutputRoute>>>,
}

impl FileOutputs {
    /// Write route files under `dir`, creating it on first open.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            opened: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Path the given route is written to.
    pub fn path_for(&self, route: OutputRoute) -> PathBuf {
        self.dir.join(format!("{}.pcm", route.as_str()))
    }

    /// Directory holding the route files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl OutputFactory for FileOutputs {
    fn open(&self, spec: &OutputSpec) -> io::Result<Box<dyn OutputDevice>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(spec.route);
        {
            let mut opened = self.opened.lock();
            if !opened.contains(&spec.route) {
                File::create(&path)?;
                opened.insert(spec.route);
            }
        }
        // Append mode keeps a retiring device's final flush from overwriting its successor.
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), route = spec.route.as_str(), "opened file output");
        Ok(Box::new(FileDevice {
            writer: BufWriter::with_capacity(spec.buffer_size.max(4096), file),
        }))
    }
}

struct FileDevice {
    writer: BufWriter<File>,
}

impl OutputDevice for FileDevice {
    fn is_initialized(&self) -> bool {
        true
    }

    fn play(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> io::Result<usize> {
        self.writer.write_all(pcm)?;
        Ok(pcm.len())
    }

    fn stop(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
