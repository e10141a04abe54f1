use std::ffi::{CStr, CString, c_void};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use bgm_kit::ffi::{
    HostOutputCallbacks, bgm_kit_pop_log, bgm_kit_session_create_file,
    bgm_kit_session_create_memory, bgm_kit_session_destroy, bgm_kit_session_is_playing,
    bgm_kit_session_process, bgm_kit_session_set_background_level,
    bgm_kit_session_set_local_level, bgm_kit_session_start, bgm_kit_session_stop,
};
use bgm_kit::pcm::{decode_sample, encode_sample};

const PCM_16BIT: i32 = 2;
const FRAME_BYTES: usize = 160;

#[derive(Default)]
struct HostSink {
    opened: Mutex<Vec<(u32, u32, u32, u32)>>,
    written: Mutex<Vec<(usize, usize)>>,
    closed: AtomicUsize,
    played: AtomicUsize,
    stopped: AtomicUsize,
}

extern "C" fn open_output(
    user_data: *mut c_void,
    route: u32,
    sample_rate: u32,
    channels: u32,
    buffer_size: u32,
) -> *mut c_void {
    let sink = unsafe { &*(user_data as *const HostSink) };
    sink.opened
        .lock()
        .push((route, sample_rate, channels, buffer_size));
    (route as usize + 1) as *mut c_void
}

extern "C" fn write_output(
    user_data: *mut c_void,
    device: *mut c_void,
    _data: *const u8,
    len: usize,
) -> isize {
    let sink = unsafe { &*(user_data as *const HostSink) };
    sink.written.lock().push((device as usize, len));
    len as isize
}

extern "C" fn close_output(user_data: *mut c_void, _device: *mut c_void) {
    let sink = unsafe { &*(user_data as *const HostSink) };
    sink.closed.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn play_output(user_data: *mut c_void, _device: *mut c_void) -> i32 {
    let sink = unsafe { &*(user_data as *const HostSink) };
    sink.played.fetch_add(1, Ordering::SeqCst);
    0
}

extern "C" fn stop_output(user_data: *mut c_void, _device: *mut c_void) -> i32 {
    let sink = unsafe { &*(user_data as *const HostSink) };
    sink.stopped.fetch_add(1, Ordering::SeqCst);
    0
}

extern "C" fn refuse_play(user_data: *mut c_void, _device: *mut c_void) -> i32 {
    let sink = unsafe { &*(user_data as *const HostSink) };
    sink.played.fetch_add(1, Ordering::SeqCst);
    -1
}

fn callbacks(sink: &HostSink) -> HostOutputCallbacks {
    HostOutputCallbacks {
        user_data: sink as *const HostSink as *mut c_void,
        open: Some(open_output),
        write: Some(write_output),
        close: Some(close_output),
        play: Some(play_output),
        stop: Some(stop_output),
    }
}

fn constant(value: i16, samples: usize) -> Vec<u8> {
    (0..samples).flat_map(|_| encode_sample(value)).collect()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn null_arguments_are_rejected() {
    let sink = HostSink::default();
    let table = callbacks(&sink);
    let track = constant(100, 80);
    let mut frame = constant(0, 80);

    unsafe {
        assert!(bgm_kit_session_create_memory(ptr::null(), 0, false, &table).is_null());
        assert!(bgm_kit_session_create_memory(track.as_ptr(), track.len(), false, ptr::null()).is_null());
        assert!(bgm_kit_session_create_file(ptr::null(), false, &table).is_null());

        let incomplete = HostOutputCallbacks {
            write: None,
            ..table
        };
        assert!(bgm_kit_session_create_memory(track.as_ptr(), track.len(), false, &incomplete).is_null());

        assert_eq!(
            bgm_kit_session_process(ptr::null_mut(), PCM_16BIT, 1, 8_000, frame.as_mut_ptr(), frame.len()),
            -1
        );
        assert!(!bgm_kit_session_start(ptr::null_mut()));
        assert!(!bgm_kit_session_is_playing(ptr::null_mut()));
        assert!(!bgm_kit_session_set_background_level(ptr::null_mut(), 0.5));
        assert!(!bgm_kit_session_set_local_level(ptr::null_mut(), 0.5));
        bgm_kit_session_stop(ptr::null_mut());
        bgm_kit_session_destroy(ptr::null_mut());

        let handle = bgm_kit_session_create_memory(track.as_ptr(), track.len(), false, &table);
        assert!(!handle.is_null());
        assert_eq!(
            bgm_kit_session_process(handle, PCM_16BIT, 1, 8_000, ptr::null_mut(), FRAME_BYTES),
            -1
        );
        assert_eq!(
            bgm_kit_session_process(handle, PCM_16BIT, 70_000, 8_000, frame.as_mut_ptr(), frame.len()),
            -1
        );
        bgm_kit_session_destroy(handle);
    }
    assert!(sink.opened.lock().is_empty());
}

#[test]
fn process_mixes_and_plays_through_host_outputs() {
    let sink = HostSink::default();
    let table = callbacks(&sink);
    let track = constant(100, 80 * 8);

    unsafe {
        let handle = bgm_kit_session_create_memory(track.as_ptr(), track.len(), false, &table);
        assert!(!handle.is_null());
        assert!(bgm_kit_session_start(handle));

        let mut frame = constant(300, 80);
        let status =
            bgm_kit_session_process(handle, PCM_16BIT, 1, 8_000, frame.as_mut_ptr(), frame.len());
        assert_eq!(status, 1);
        assert!(frame.chunks_exact(2).all(|p| decode_sample(p[0], p[1]) == 200));
        assert!(bgm_kit_session_is_playing(handle));

        assert!(bgm_kit_session_set_background_level(handle, 0.0));
        let mut frame = constant(300, 80);
        bgm_kit_session_process(handle, PCM_16BIT, 1, 8_000, frame.as_mut_ptr(), frame.len());
        assert!(frame.chunks_exact(2).all(|p| decode_sample(p[0], p[1]) == 150));

        assert!(wait_for(|| sink.written.lock().len() >= 4));

        let mut short = constant(300, 10);
        let before = short.clone();
        let status =
            bgm_kit_session_process(handle, PCM_16BIT, 1, 8_000, short.as_mut_ptr(), short.len());
        assert_eq!(status, 0);
        assert_eq!(short, before);

        bgm_kit_session_stop(handle);
        assert!(!bgm_kit_session_is_playing(handle));
        bgm_kit_session_destroy(handle);
    }

    let opened = sink.opened.lock().clone();
    assert_eq!(opened[0], (0, 8_000, 1, FRAME_BYTES as u32));
    assert_eq!(opened[1], (1, 8_000, 1, FRAME_BYTES as u32));
    let written = sink.written.lock().clone();
    assert_eq!(written[0], (1, FRAME_BYTES));
    assert_eq!(written[1], (2, FRAME_BYTES));
    assert!(wait_for(|| sink.closed.load(Ordering::SeqCst) == 2));
    assert_eq!(sink.played.load(Ordering::SeqCst), 2);
    assert_eq!(sink.stopped.load(Ordering::SeqCst), 2);
}

#[test]
fn play_and_stop_callbacks_are_optional() {
    let sink = HostSink::default();
    let table = HostOutputCallbacks {
        play: None,
        stop: None,
        ..callbacks(&sink)
    };
    let track = constant(100, 80 * 4);

    unsafe {
        let handle = bgm_kit_session_create_memory(track.as_ptr(), track.len(), false, &table);
        assert!(!handle.is_null());
        let mut frame = constant(100, 80);
        assert_eq!(
            bgm_kit_session_process(handle, PCM_16BIT, 1, 8_000, frame.as_mut_ptr(), frame.len()),
            1
        );
        assert!(wait_for(|| sink.written.lock().len() >= 2));
        bgm_kit_session_destroy(handle);
    }

    assert!(wait_for(|| sink.closed.load(Ordering::SeqCst) == 2));
    assert_eq!(sink.played.load(Ordering::SeqCst), 0);
    assert_eq!(sink.stopped.load(Ordering::SeqCst), 0);
}

#[test]
fn refused_play_does_not_stop_playback() {
    let sink = HostSink::default();
    let table = HostOutputCallbacks {
        play: Some(refuse_play),
        ..callbacks(&sink)
    };
    let track = constant(100, 80 * 4);

    unsafe {
        let handle = bgm_kit_session_create_memory(track.as_ptr(), track.len(), false, &table);
        let mut frame = constant(100, 80);
        bgm_kit_session_process(handle, PCM_16BIT, 1, 8_000, frame.as_mut_ptr(), frame.len());
        assert!(wait_for(|| sink.written.lock().len() >= 2));
        assert!(bgm_kit_session_is_playing(handle));
        bgm_kit_session_destroy(handle);
    }

    assert_eq!(sink.played.load(Ordering::SeqCst), 2);
    assert!(wait_for(|| sink.stopped.load(Ordering::SeqCst) == 2));
}

#[test]
fn file_session_and_log_ring() {
    let sink = HostSink::default();
    let table = callbacks(&sink);
    let path = std::env::temp_dir().join(format!("bgm_kit_ffi_{}.pcm", std::process::id()));
    std::fs::write(&path, constant(-50, 80 * 4)).expect("write track");
    let c_path = CString::new(path.to_string_lossy().into_owned()).expect("path");

    unsafe {
        let handle = bgm_kit_session_create_file(c_path.as_ptr(), true, &table);
        assert!(!handle.is_null());
        let mut frame = constant(50, 80);
        assert_eq!(
            bgm_kit_session_process(handle, PCM_16BIT, 1, 8_000, frame.as_mut_ptr(), frame.len()),
            1
        );
        assert!(frame.iter().all(|&b| b == 0));
        bgm_kit_session_destroy(handle);
    }

    let mut lines = Vec::new();
    loop {
        let line = bgm_kit_pop_log();
        if line.is_null() {
            break;
        }
        lines.push(unsafe { CStr::from_ptr(line) }.to_string_lossy().into_owned());
    }
    assert!(lines.iter().any(|l| l.contains("session_create") && l.contains("looping=true")));
    assert!(lines.iter().any(|l| l.starts_with("session_destroy")));

    std::fs::remove_file(&path).expect("cleanup");
}
