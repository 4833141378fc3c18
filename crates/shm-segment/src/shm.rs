//! Raw POSIX shared memory primitives.
//!
//! # Lifetime
//!
//! 1. Allocator creates the object with `shm_open(O_CREAT | O_EXCL)`.
//! 2. Allocator `ftruncate`s to the start size and `mmap`s read/write shared.
//! 3. Allocator zeroes the mapping and writes the control header.
//! 4. On teardown, `shm_unlink` removes the name from the OS namespace; the
//!    mapping itself must already be `munmap`ped by then.
//!
//! # Naming
//!
//! Shared memory objects are named `/{segment_key}`, where `segment_key` is
//! a short CSPRNG-derived string (see [`crate::key`]). The leading `/` is
//! required by POSIX; names are kept under the platform's shm-name limit by
//! construction of the key itself, not by truncation here.

use std::ffi::CString;
use std::ptr;

use libc::{
    c_int, c_uint, c_void, close, ftruncate, mmap, munmap, off_t, shm_open, shm_unlink,
    MAP_FAILED, MAP_SHARED, O_CREAT, O_EXCL, O_RDWR, PROT_READ, PROT_WRITE, S_IRUSR, S_IWUSR,
};

use crate::error::{SegmentError, SegmentResult};
use crate::page::{ControlHeader, HEADER_SIZE};

/// Create and map a new shared memory region with create-exclusive semantics.
///
/// # Safety
///
/// Returns a raw pointer to mapped memory. The caller must not use it after
/// [`close_shm`] and must coordinate all concurrent access through the
/// control header's atomics.
pub(crate) fn create_shm(name: &str, size: usize) -> SegmentResult<(*mut u8, c_int)> {
    let c_name = CString::new(name).map_err(|e| SegmentError::SharedMemory(e.to_string()))?;

    unsafe {
        let fd = shm_open(
            c_name.as_ptr(),
            O_CREAT | O_EXCL | O_RDWR,
            (S_IRUSR | S_IWUSR) as c_uint,
        );

        if fd == -1 {
            let err = std::io::Error::last_os_error();
            return Err(SegmentError::SharedMemory(format!(
                "shm_open failed for '{}': {}",
                name, err
            )));
        }

        if ftruncate(fd, size as off_t) == -1 {
            let err = std::io::Error::last_os_error();
            close(fd);
            let _ = shm_unlink(c_name.as_ptr());
            return Err(SegmentError::SharedMemory(format!(
                "ftruncate failed: {}",
                err
            )));
        }

        let ptr = mmap(ptr::null_mut(), size, PROT_READ | PROT_WRITE, MAP_SHARED, fd, 0);

        if ptr == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            close(fd);
            let _ = shm_unlink(c_name.as_ptr());
            return Err(SegmentError::Mmap(format!("mmap failed: {}", err)));
        }

        Ok((ptr as *mut u8, fd))
    }
}

/// Open and map an existing shared memory region, validating its header.
///
/// # Safety
///
/// Returns a raw pointer to mapped memory; same obligations as [`create_shm`].
pub(crate) fn open_shm(name: &str) -> SegmentResult<(*mut u8, c_int, usize)> {
    let c_name = CString::new(name).map_err(|e| SegmentError::SharedMemory(e.to_string()))?;

    unsafe {
        let fd = shm_open(c_name.as_ptr(), O_RDWR, 0);
        if fd == -1 {
            let err = std::io::Error::last_os_error();
            return Err(SegmentError::SharedMemory(format!(
                "shm_open failed for '{}': {}",
                name, err
            )));
        }

        let header_ptr = mmap(ptr::null_mut(), HEADER_SIZE, PROT_READ, MAP_SHARED, fd, 0);
        if header_ptr == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(SegmentError::Mmap(format!("mmap header failed: {}", err)));
        }

        let header = &*(header_ptr as *const ControlHeader);
        if !header.validate() {
            munmap(header_ptr, HEADER_SIZE);
            close(fd);
            return Err(SegmentError::InvalidHeader(format!(
                "cookie/version mismatch (version {}.{})",
                header.version_major, header.version_minor
            )));
        }

        let total_size = header.segment_size.load(std::sync::atomic::Ordering::Acquire) as usize;
        munmap(header_ptr, HEADER_SIZE);

        let ptr = mmap(
            ptr::null_mut(),
            total_size,
            PROT_READ | PROT_WRITE,
            MAP_SHARED,
            fd,
            0,
        );

        if ptr == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(SegmentError::Mmap(format!("mmap full failed: {}", err)));
        }

        Ok((ptr as *mut u8, fd, total_size))
    }
}

/// Unmap and close the file descriptor. Must be called exactly once per mapping.
///
/// # Safety
///
/// `ptr`/`size`/`fd` must come from a single successful [`create_shm`] or
/// [`open_shm`] call that has not already been torn down.
pub(crate) unsafe fn close_shm(ptr: *mut u8, size: usize, fd: c_int) {
    if !ptr.is_null() {
        munmap(ptr as *mut c_void, size);
    }
    if fd >= 0 {
        close(fd);
    }
}

/// Remove the shared memory object from the OS namespace.
///
/// `ENOENT` is treated as success: the object is already gone, which is the
/// desired end state either way.
pub(crate) fn unlink_shm(name: &str) -> SegmentResult<()> {
    let c_name = CString::new(name).map_err(|e| SegmentError::SharedMemory(e.to_string()))?;

    unsafe {
        if shm_unlink(c_name.as_ptr()) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(SegmentError::SharedMemory(format!(
                    "shm_unlink failed: {}",
                    err
                )));
            }
        }
    }
    Ok(())
}

/// `ftruncate` an already-open shared memory object to a new size, for resize.
pub(crate) fn truncate_shm(fd: c_int, size: usize) -> SegmentResult<()> {
    unsafe {
        if ftruncate(fd, size as off_t) == -1 {
            let err = std::io::Error::last_os_error();
            return Err(SegmentError::RemapFailed(format!("ftruncate: {}", err)));
        }
    }
    Ok(())
}

/// Remap an existing descriptor to a new size after `truncate_shm`.
///
/// # Safety
///
/// The previous mapping at `old_ptr`/`old_size` must already be unmapped by
/// the caller (via [`close_shm`]-style `munmap`, not a full close) before the
/// remap, matching the control header snapshot/restore dance in the resize
/// negotiator.
pub(crate) unsafe fn remap_shm(fd: c_int, size: usize) -> SegmentResult<*mut u8> {
    let ptr = mmap(ptr::null_mut(), size, PROT_READ | PROT_WRITE, MAP_SHARED, fd, 0);
    if ptr == MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return Err(SegmentError::RemapFailed(format!("mmap: {}", err)));
    }
    Ok(ptr as *mut u8)
}

/// Wake the consumer side waiting on the event semaphore's futex word.
#[cfg(target_os = "linux")]
pub(crate) fn wake_waiters(word: &std::sync::atomic::AtomicU32) {
    use std::sync::atomic::Ordering;

    word.fetch_add(1, Ordering::Release);

    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const _ as *const c_int,
            libc::FUTEX_WAKE,
            1,
            ptr::null::<libc::timespec>(),
            ptr::null::<c_int>(),
            0,
        );
    }
}

#[cfg(target_os = "macos")]
pub(crate) fn wake_waiters(word: &std::sync::atomic::AtomicU32) {
    use std::sync::atomic::Ordering;
    // No real futex on macOS; bump the word so pollers observe the change.
    word.fetch_add(1, Ordering::Release);
}

/// Block until `word` changes from `expect`, or `timeout_ms` elapses.
#[cfg(target_os = "linux")]
pub(crate) fn wait_for_change(
    word: &std::sync::atomic::AtomicU32,
    expect: u32,
    timeout_ms: Option<u32>,
) {
    let timeout = timeout_ms.map(|ms| libc::timespec {
        tv_sec: (ms / 1000) as i64,
        tv_nsec: ((ms % 1000) * 1_000_000) as i64,
    });

    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const _ as *const c_int,
            libc::FUTEX_WAIT,
            expect as c_int,
            timeout.as_ref().map_or(ptr::null(), |t| t as *const _),
            ptr::null::<c_int>(),
            0,
        );
    }
}

#[cfg(target_os = "macos")]
pub(crate) fn wait_for_change(
    _word: &std::sync::atomic::AtomicU32,
    _expect: u32,
    timeout_ms: Option<u32>,
) {
    let sleep_ms = timeout_ms.unwrap_or(1).min(10);
    std::thread::sleep(std::time::Duration::from_millis(sleep_ms as u64));
}
