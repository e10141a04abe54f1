use std::fs;
use std::io;
use std::path::PathBuf;

use crate::source::{FileTrack, MemoryTrack, TrackProvider, TrackSource, read_full};

fn scratch_file(name: &str, contents: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("bgm_kit_{}_{name}.pcm", std::process::id()));
    fs::write(&path, contents).expect("write scratch track");
    path
}

#[test]
fn memory_cursors_are_independent() {
    let track = MemoryTrack::new("bgm", (0u8..10).collect::<Vec<_>>());
    let mut a = track.open().expect("open a");
    let mut b = track.open().expect("open b");

    let mut buf = [0u8; 4];
    assert_eq!(read_full(&mut *a, &mut buf).expect("read"), 4);
    assert_eq!(buf, [0, 1, 2, 3]);
    assert_eq!(read_full(&mut *b, &mut buf).expect("read"), 4);
    assert_eq!(buf, [0, 1, 2, 3]);
    assert_eq!(read_full(&mut *a, &mut buf).expect("read"), 4);
    assert_eq!(buf, [4, 5, 6, 7]);
}

#[test]
fn short_read_marks_end_of_track_and_rewind_restarts() {
    let track = MemoryTrack::new("bgm", vec![1u8; 6]);
    let mut cursor = track.open().expect("open");
    let mut buf = [0u8; 4];

    assert_eq!(read_full(&mut *cursor, &mut buf).expect("read"), 4);
    assert_eq!(read_full(&mut *cursor, &mut buf).expect("read"), 2);
    assert_eq!(read_full(&mut *cursor, &mut buf).expect("read"), 0);

    cursor.rewind().expect("rewind");
    assert_eq!(read_full(&mut *cursor, &mut buf).expect("read"), 4);
}

struct Trickle {
    remaining: usize,
    interrupted: bool,
}

impl TrackSource for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.interrupted {
            self.interrupted = true;
            return Err(io::Error::new(io::ErrorKind::Interrupted, "signal"));
        }
        let n = buf.len().min(3).min(self.remaining);
        buf[..n].fill(0xAB);
        self.remaining -= n;
        Ok(n)
    }

    fn rewind(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn read_full_retries_interrupts_and_short_reads() {
    let mut source = Trickle {
        remaining: 100,
        interrupted: false,
    };
    let mut buf = [0u8; 10];
    assert_eq!(read_full(&mut source, &mut buf).expect("read"), 10);
    assert!(buf.iter().all(|&b| b == 0xAB));
}

#[test]
fn file_track_shares_one_mapping_between_cursors() {
    let path = scratch_file("shared", &[7u8; 32]);
    let track = FileTrack::new(&path);
    assert_eq!(track.name(), path.file_name().and_then(|n| n.to_str()).unwrap_or_default());
    assert!(!track.is_mapped());

    let mut a = track.open().expect("open a");
    let b = track.open().expect("open b");
    assert!(track.is_mapped());
    assert_eq!(track.open_cursors(), 2);

    let mut buf = [0u8; 16];
    assert_eq!(read_full(&mut *a, &mut buf).expect("read"), 16);
    assert_eq!(buf, [7u8; 16]);

    drop(a);
    assert!(track.is_mapped());
    drop(b);
    assert!(!track.is_mapped());
    assert_eq!(track.open_cursors(), 0);

    fs::remove_file(&path).expect("cleanup");
}

#[test]
fn missing_file_fails_to_open() {
    let track = FileTrack::new(std::env::temp_dir().join("bgm_kit_does_not_exist.pcm"));
    assert!(track.open().is_err());
    assert!(!track.is_mapped());
}
