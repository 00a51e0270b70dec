//! C Bindings for VenomQueue
//!
//! Raw C API so workers and callers in other languages (C, Python via cffi,
//! Node, Java) can speak the queue protocol. Handles are opaque and owned by
//! the host: one per process per segment, released with
//! `venom_queue_detach` or `venom_queue_teardown`.
//!
//! Every fallible call returns a status: `0` on success, `1` for "no entry"
//! on reads, negative values as listed in [`crate::QueueError::status_code`].

use crate::config::SegmentConfig;
use crate::queue::Direction;
use crate::segment::Segment;
use crate::table::{Entry, MAX_KEY_LEN};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;

pub const VENOM_QUEUE_OK: c_int = 0;
pub const VENOM_QUEUE_EMPTY: c_int = 1;
pub const VENOM_QUEUE_INVALID_ARGUMENT: c_int = -8;
/// Caller buffer too small; the required size was written to `out_len`
pub const VENOM_QUEUE_BUFFER_TOO_SMALL: c_int = -11;

/// Buffer size that always fits a key plus its NUL terminator
pub const VENOM_QUEUE_KEY_BUF_LEN: usize = MAX_KEY_LEN + 1;

// Opaque handle
pub struct VenomQueueHandle(Segment);

#[repr(C)]
pub struct VenomQueueConfig {
    pub capacity: usize,
    pub max_payload: usize,
    pub stale_lock_timeout_ms: u64,
}

fn status(result: crate::Result<()>) -> c_int {
    match result {
        Ok(()) => VENOM_QUEUE_OK,
        Err(e) => {
            tracing::debug!(error = %e, "venom_queue call failed");
            e.status_code()
        }
    }
}

unsafe fn str_arg<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

unsafe fn segment<'a>(handle: *mut VenomQueueHandle) -> Option<&'a Segment> {
    handle.as_ref().map(|h| &h.0)
}

/// Copy an entry out to caller buffers
///
/// `key_buf` must hold [`VENOM_QUEUE_KEY_BUF_LEN`] bytes (or be null).
unsafe fn copy_entry(
    entry: &Entry,
    key_buf: *mut c_char,
    buf: *mut u8,
    max_len: usize,
    out_len: *mut usize,
) -> c_int {
    if !out_len.is_null() {
        *out_len = entry.payload.len();
    }
    if entry.payload.len() > max_len || (buf.is_null() && !entry.payload.is_empty()) {
        return VENOM_QUEUE_BUFFER_TOO_SMALL;
    }
    if !buf.is_null() {
        ptr::copy_nonoverlapping(entry.payload.as_ptr(), buf, entry.payload.len());
    }
    if !key_buf.is_null() {
        let key = entry.key.as_bytes();
        ptr::copy_nonoverlapping(key.as_ptr(), key_buf as *mut u8, key.len());
        *key_buf.add(key.len()) = 0;
    }
    VENOM_QUEUE_OK
}

/// Create a new segment
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn venom_queue_create(
    name: *const c_char,
    config: VenomQueueConfig,
) -> *mut VenomQueueHandle {
    let Some(name) = str_arg(name) else {
        return ptr::null_mut();
    };

    let rust_config = SegmentConfig {
        capacity: config.capacity,
        max_payload: config.max_payload,
        stale_lock_timeout_ms: config.stale_lock_timeout_ms,
    };

    match Segment::create(name, &rust_config) {
        Ok(segment) => Box::into_raw(Box::new(VenomQueueHandle(segment))),
        Err(e) => {
            tracing::warn!(name, error = %e, "segment creation failed");
            ptr::null_mut()
        }
    }
}

/// Attach to an existing segment
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn venom_queue_attach(name: *const c_char) -> *mut VenomQueueHandle {
    let Some(name) = str_arg(name) else {
        return ptr::null_mut();
    };

    match Segment::attach(name) {
        Ok(segment) => Box::into_raw(Box::new(VenomQueueHandle(segment))),
        Err(e) => {
            tracing::debug!(name, error = %e, "segment attach failed");
            ptr::null_mut()
        }
    }
}

/// Release a handle without unlinking the segment
#[no_mangle]
pub unsafe extern "C" fn venom_queue_detach(handle: *mut VenomQueueHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Release a handle and unlink the segment
#[no_mangle]
pub unsafe extern "C" fn venom_queue_teardown(handle: *mut VenomQueueHandle) -> c_int {
    if handle.is_null() {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    }
    let handle = Box::from_raw(handle);
    status(handle.0.teardown())
}

/// Write an entry
#[no_mangle]
pub unsafe extern "C" fn venom_queue_write(
    handle: *mut VenomQueueHandle,
    direction: u32,
    key: *const c_char,
    payload: *const u8,
    len: usize,
) -> c_int {
    let (Some(segment), Some(direction), Some(key)) =
        (segment(handle), Direction::from_raw(direction), str_arg(key))
    else {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    };
    if payload.is_null() && len > 0 {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    }
    let payload = if len == 0 { &[][..] } else { slice::from_raw_parts(payload, len) };
    status(segment.queue(direction).write(key, payload))
}

/// Peek the oldest entry
///
/// Returns `VENOM_QUEUE_EMPTY` when the queue has nothing to offer.
#[no_mangle]
pub unsafe extern "C" fn venom_queue_read_one(
    handle: *mut VenomQueueHandle,
    direction: u32,
    key_buf: *mut c_char,
    buf: *mut u8,
    max_len: usize,
    out_len: *mut usize,
) -> c_int {
    let (Some(segment), Some(direction)) = (segment(handle), Direction::from_raw(direction)) else {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    };
    match segment.queue(direction).read_one() {
        Some(entry) => copy_entry(&entry, key_buf, buf, max_len, out_len),
        None => VENOM_QUEUE_EMPTY,
    }
}

/// Peek the entry with `key`
///
/// Returns `VENOM_QUEUE_EMPTY` when no such entry exists.
#[no_mangle]
pub unsafe extern "C" fn venom_queue_read_by_key(
    handle: *mut VenomQueueHandle,
    direction: u32,
    key: *const c_char,
    buf: *mut u8,
    max_len: usize,
    out_len: *mut usize,
) -> c_int {
    let (Some(segment), Some(direction), Some(key)) =
        (segment(handle), Direction::from_raw(direction), str_arg(key))
    else {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    };
    match segment.queue(direction).try_read_by_key(key) {
        Some(entry) => copy_entry(&entry, ptr::null_mut(), buf, max_len, out_len),
        None => VENOM_QUEUE_EMPTY,
    }
}

/// Remove the entry with `key`
#[no_mangle]
pub unsafe extern "C" fn venom_queue_remove(
    handle: *mut VenomQueueHandle,
    direction: u32,
    key: *const c_char,
) -> c_int {
    let (Some(segment), Some(direction), Some(key)) =
        (segment(handle), Direction::from_raw(direction), str_arg(key))
    else {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    };
    status(segment.queue(direction).remove(key))
}

/// Claim an input entry for this process
#[no_mangle]
pub unsafe extern "C" fn venom_queue_claim(handle: *mut VenomQueueHandle, key: *const c_char) -> c_int {
    let (Some(segment), Some(key)) = (segment(handle), str_arg(key)) else {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    };
    status(segment.input().claim(key).map(|_| ()))
}

/// Give a claimed input entry back
#[no_mangle]
pub unsafe extern "C" fn venom_queue_release(handle: *mut VenomQueueHandle, key: *const c_char) -> c_int {
    let (Some(segment), Some(key)) = (segment(handle), str_arg(key)) else {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    };
    status(segment.input().release(key))
}

/// Dead-letter an input entry
#[no_mangle]
pub unsafe extern "C" fn venom_queue_dead_letter(
    handle: *mut VenomQueueHandle,
    key: *const c_char,
) -> c_int {
    let (Some(segment), Some(key)) = (segment(handle), str_arg(key)) else {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    };
    status(segment.input().dead_letter(key))
}

/// Write the response for `key` and remove the request atomically
#[no_mangle]
pub unsafe extern "C" fn venom_queue_commit_response(
    handle: *mut VenomQueueHandle,
    key: *const c_char,
    payload: *const u8,
    len: usize,
) -> c_int {
    let (Some(segment), Some(key)) = (segment(handle), str_arg(key)) else {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    };
    if payload.is_null() && len > 0 {
        return VENOM_QUEUE_INVALID_ARGUMENT;
    }
    let payload = if len == 0 { &[][..] } else { slice::from_raw_parts(payload, len) };
    status(segment.commit_response(key, payload))
}

/// Empty both queues
#[no_mangle]
pub unsafe extern "C" fn venom_queue_clear(handle: *mut VenomQueueHandle) -> c_int {
    match segment(handle) {
        Some(segment) => {
            segment.clear();
            VENOM_QUEUE_OK
        }
        None => VENOM_QUEUE_INVALID_ARGUMENT,
    }
}

/// Restart-time repair; returns the number of entries fixed, or a status
#[no_mangle]
pub unsafe extern "C" fn venom_queue_reconcile(handle: *mut VenomQueueHandle) -> c_int {
    match segment(handle) {
        Some(segment) => {
            let report = segment.reconcile();
            (report.completed_inputs.len() + report.released_claims.len()) as c_int
        }
        None => VENOM_QUEUE_INVALID_ARGUMENT,
    }
}

/// Human-readable name for a status code; static, never freed
#[no_mangle]
pub extern "C" fn venom_queue_status_name(code: c_int) -> *const c_char {
    let name: &'static CStr = match code {
        VENOM_QUEUE_OK => c"ok",
        VENOM_QUEUE_EMPTY => c"empty",
        -1 => c"allocation failed",
        -2 => c"not found",
        -3 => c"duplicate key",
        -4 => c"queue full",
        -5 => c"timeout",
        -6 => c"malformed payload",
        -7 => c"invalid entry state",
        VENOM_QUEUE_INVALID_ARGUMENT => c"invalid argument",
        -9 => c"worker failed",
        -10 => c"segment error",
        VENOM_QUEUE_BUFFER_TOO_SMALL => c"buffer too small",
        _ => c"unknown",
    };
    name.as_ptr()
}
