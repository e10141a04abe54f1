use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ffi::{HostOutputCallbacks, HostOutputs};
use crate::output::{OutputFactory, OutputRoute, OutputSpec};

extern "C" fn count_open(
    user_data: *mut c_void,
    _route: u32,
    _sample_rate: u32,
    _channels: u32,
    _buffer_size: u32,
) -> *mut c_void {
    let opens = unsafe { &*(user_data as *const AtomicUsize) };
    opens.fetch_add(1, Ordering::SeqCst);
    std::ptr::null_mut()
}

extern "C" fn accept_write(_: *mut c_void, _: *mut c_void, _: *const u8, len: usize) -> isize {
    len as isize
}

fn outputs(opens: &AtomicUsize) -> HostOutputs {
    HostOutputs {
        callbacks: HostOutputCallbacks {
            user_data: opens as *const AtomicUsize as *mut c_void,
            open: Some(count_open),
            write: Some(accept_write),
            close: None,
            play: None,
            stop: None,
        },
    }
}

#[cfg(target_pointer_width = "64")]
#[test]
fn oversized_buffer_is_rejected_before_reaching_the_host() {
    let opens = AtomicUsize::new(0);
    let spec = OutputSpec::for_route(OutputRoute::Primary, 8_000, 1, u32::MAX as usize + 1);

    let err = outputs(&opens).open(&spec).err().expect("oversized open must fail");
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    assert_eq!(opens.load(Ordering::SeqCst), 0);
}

#[test]
fn null_host_device_reports_uninitialised() {
    let opens = AtomicUsize::new(0);
    let spec = OutputSpec::for_route(OutputRoute::Backup, 8_000, 2, 160);

    let device = outputs(&opens).open(&spec).expect("open");
    assert!(!device.is_initialized());
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}
