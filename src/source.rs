//! Background track sources.
//!
//! A [`TrackProvider`] is the named, host-provided asset; every [`open`](TrackProvider::open)
//! yields an independent read cursor positioned at the start of the track. Track data is raw
//! PCM16 little-endian at a fixed rate and layout; a mismatch with the live session format is
//! audible but not detected.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::debug;

use crate::shared::{Lease, SharedResource};

/// Readable, rewindable cursor over a background track.
pub trait TrackSource: Send {
    /// Read up to `buf.len()` bytes, returning `Ok(0)` at end of track.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Move the cursor back to the start of the track.
    fn rewind(&mut self) -> io::Result<()>;
}

/// Opens cursors over a named background track.
pub trait TrackProvider: Send + Sync {
    /// Human readable name used in logs.
    fn name(&self) -> &str;
    /// Open a fresh cursor at the start of the track.
    fn open(&self) -> io::Result<Box<dyn TrackSource>>;
}

/// Fill `buf` from `source`, looping over short reads. Returns the bytes read, which is less
/// than `buf.len()` only at end of track.
pub fn read_full(source: &mut dyn TrackSource, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn copy_from(data: &[u8], position: &mut usize, buf: &mut [u8]) -> usize {
    let remaining = data.len().saturating_sub(*position);
    let n = remaining.min(buf.len());
    buf[..n].copy_from_slice(&data[*position..*position + n]);
    *position += n;
    n
}

/// Track held in memory, such as a packaged asset.
#[derive(Debug, Clone)]
pub struct MemoryTrack {
    name: String,
    data: Arc<[u8]>,
}

impl MemoryTrack {
    /// Wrap `data` under `name`.
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Track length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the track holds no audio.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl TrackProvider for MemoryTrack {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<Box<dyn TrackSource>> {
        Ok(Box::new(MemoryCursor {
            data: self.data.clone(),
            position: 0,
        }))
    }
}

struct MemoryCursor {
    data: Arc<[u8]>,
    position: usize,
}

impl TrackSource for MemoryCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from(&self.data, &mut self.position, buf))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.position = 0;
        Ok(())
    }
}

/// Raw PCM track file, memory-mapped once and shared by every open cursor.
///
/// The mapping is released when the last cursor is dropped and re-established on the next
/// open.
#[derive(Debug)]
pub struct FileTrack {
    name: String,
    path: PathBuf,
    mapping: SharedResource<Mmap>,
}

impl FileTrack {
    /// Track backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path,
            mapping: SharedResource::new(),
        }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of cursors currently holding the mapping.
    pub fn open_cursors(&self) -> usize {
        self.mapping.owners()
    }

    /// Whether the file is currently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_live()
    }
}

impl TrackProvider for FileTrack {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<Box<dyn TrackSource>> {
        let lease = self.mapping.acquire_with(|| {
            let file = File::open(&self.path)?;
            // SAFETY: the track file is treated as read-only for the lifetime of the mapping.
            let map = unsafe { Mmap::map(&file)? };
            debug!(path = %self.path.display(), bytes = map.len(), "mapped track file");
            Ok::<_, io::Error>(map)
        })?;
        Ok(Box::new(MappedCursor { map: lease, position: 0 }))
    }
}

struct MappedCursor {
    map: Lease<Mmap>,
    position: usize,
}

impl TrackSource for MappedCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from(&self.map[..], &mut self.position, buf))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.position = 0;
        Ok(())
    }
}
