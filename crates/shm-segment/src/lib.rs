//! Shared Segment Allocator: creates and destroys a shared memory page keyed
//! by a process-unique name, with its three associated counting semaphores.
//!
//! # Layout
//!
//! See [`page`] for the control header and the size/offset function of
//! `(w, h)`. See [`queue`] for the event-queue pair layered on top of the
//! header's synchronisation word. See [`semaphore`] for the named semaphore
//! triple and [`shm`] for the raw POSIX primitives backing all of it.
//!
//! # Platform support
//!
//! Unix only (`shm_open`/`mmap`/`sem_open`). A Windows backend is not
//! provided; callers on unsupported platforms get a compile error via the
//! `cfg(unix)` gate on the `libc` dependency.

pub mod error;
pub mod key;
pub mod page;
pub mod queue;
pub mod semaphore;
mod shm;

pub use error::{SegmentError, SegmentResult};
pub use key::{SharedSegmentKey, MAX_KEY_LEN};
pub use page::{clamp_hint, ControlHeader, Layout, DEFAULT_H, DEFAULT_W, MAX_H, MAX_SZ, MAX_W, MIN_SZ};
pub use queue::{Event, EventQueuePair};
pub use semaphore::SemaphoreTriple;

/// A freshly allocated shared segment: the mapping, its key and its
/// semaphore triple, ready to be wrapped by a `ProducerRecord`.
pub struct Segment {
    pub key: SharedSegmentKey,
    pub semaphores: SemaphoreTriple,
    ptr: *mut u8,
    fd: libc::c_int,
    size: usize,
}

// SAFETY: the mapping is coordinated exclusively through the control
// header's atomics and the semaphore triple; no interior mutability here
// is reached without going through one of those.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocate a new shared segment per the SSA algorithm (spec §4.1):
    /// draw CSPRNG key attempts until a create-exclusive `shm_open`
    /// succeeds, open the semaphore triple, truncate/map to the requested
    /// size, zero the mapping and fill the control header.
    ///
    /// Any failure after the shared-memory object is created rolls back
    /// both the shm object and any semaphores already opened.
    pub fn create(parent_pid: u32, w: u32, h: u32, with_audio: bool) -> SegmentResult<Segment> {
        let layout = Layout::compute(w, h, with_audio);
        if layout.total_size > MAX_SZ {
            return Err(SegmentError::ResourceExhausted {
                requested: layout.total_size,
                max: MAX_SZ,
            });
        }
        let size = layout.total_size.max(MIN_SZ);

        let (key, ptr, fd) = SharedSegmentKey::allocate_unique(size)?;

        let semaphores = match SemaphoreTriple::create(&key.shm_name()) {
            Ok(s) => s,
            Err(e) => {
                unsafe { shm::close_shm(ptr, size, fd) };
                let _ = shm::unlink_shm(&key.shm_name());
                return Err(e);
            }
        };

        unsafe {
            std::ptr::write_bytes(ptr, 0, size);
            let header = &mut *(ptr as *mut ControlHeader);
            header.init(parent_pid, w, h, size);
        }

        Ok(Segment {
            key,
            semaphores,
            ptr,
            fd,
            size,
        })
    }

    /// Open an existing segment by key, validating the control header.
    pub fn open(key: SharedSegmentKey) -> SegmentResult<Segment> {
        let (ptr, fd, size) = shm::open_shm(&key.shm_name())?;
        let semaphores = SemaphoreTriple::open_existing(&key.shm_name())?;
        Ok(Segment {
            key,
            semaphores,
            ptr,
            fd,
            size,
        })
    }

    pub fn header(&self) -> &ControlHeader {
        unsafe { &*(self.ptr as *const ControlHeader) }
    }

    pub fn header_mut(&mut self) -> &mut ControlHeader {
        unsafe { &mut *(self.ptr as *mut ControlHeader) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn fd(&self) -> libc::c_int {
        self.fd
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Grow or shrink this segment's mapping to `new_size`, preserving the
    /// control header across the remap. Used by the resize negotiator;
    /// exposed here because the remap is inseparable from the raw mapping
    /// it operates on.
    ///
    /// On failure the segment is left with a null pointer and must be
    /// treated as dead by the caller's next poll.
    pub fn remap(&mut self, new_size: usize) -> SegmentResult<()> {
        if new_size > MAX_SZ {
            return Err(SegmentError::ResourceExhausted {
                requested: new_size,
                max: MAX_SZ,
            });
        }

        let mut saved_header = unsafe { std::mem::zeroed::<ControlHeader>() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr as *const ControlHeader,
                &mut saved_header as *mut ControlHeader,
                1,
            );
        }

        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        self.ptr = std::ptr::null_mut();

        shm::truncate_shm(self.fd, new_size)?;

        let new_ptr = match unsafe { shm::remap_shm(self.fd, new_size) } {
            Ok(ptr) => ptr,
            Err(e) => return Err(e),
        };

        self.ptr = new_ptr;
        self.size = new_size;

        unsafe {
            std::ptr::copy_nonoverlapping(
                &saved_header as *const ControlHeader,
                self.ptr as *mut ControlHeader,
                1,
            );
        }
        self.header_mut()
            .segment_size
            .store(new_size as u64, std::sync::atomic::Ordering::Release);

        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        !self.ptr.is_null() && self.header().is_alive()
    }

    /// The video buffer region, read-only, laid out per the current
    /// `(w, h)`. Bytes are opaque here (pixel format is out of scope);
    /// callers that forward frames across the network bridge treat this as
    /// a raw byte span.
    pub fn video_bytes(&self, with_audio: bool) -> &[u8] {
        let layout = self.header().layout(with_audio);
        unsafe {
            std::slice::from_raw_parts(self.ptr.add(layout.video_offset), layout.video_size)
        }
    }

    /// The audio buffer region, read-only. Empty when `with_audio` is
    /// false (input/encoder subsegments are audio-silent).
    pub fn audio_bytes(&self, with_audio: bool) -> &[u8] {
        let layout = self.header().layout(with_audio);
        unsafe {
            std::slice::from_raw_parts(self.ptr.add(layout.audio_offset), layout.audio_size)
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.header_mut().mark_dead();
        if !self.ptr.is_null() {
            unsafe { shm::close_shm(self.ptr, self.size, self.fd) };
        }
        if let Err(e) = shm::unlink_shm(&self.key.shm_name()) {
            tracing::warn!(error = %e, key = %self.key, "failed to unlink shared memory on drop");
        }
        if let Err(e) = self.semaphores.unlink_all() {
            tracing::warn!(error = %e, key = %self.key, "failed to unlink semaphore triple on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_validate_header() {
        let segment = Segment::create(std::process::id(), 64, 64, true).expect("create");
        assert!(segment.header().validate());
        assert_eq!(segment.header().w, 64);
        assert_eq!(segment.header().h, 64);
        assert!(segment.is_alive());
    }

    #[test]
    fn resource_exhausted_when_over_ceiling() {
        let err = Segment::create(std::process::id(), MAX_W, MAX_H, true).unwrap_err();
        assert!(matches!(err, SegmentError::ResourceExhausted { .. }));
    }

    #[test]
    fn video_and_audio_bytes_match_layout_sizes() {
        let segment = Segment::create(std::process::id(), 64, 48, true).expect("create");
        let layout = segment.header().layout(true);
        assert_eq!(segment.video_bytes(true).len(), layout.video_size);
        assert_eq!(segment.audio_bytes(true).len(), layout.audio_size);
        assert_eq!(segment.audio_bytes(false).len(), 0);
    }

    #[test]
    fn remap_preserves_header_and_updates_segment_size() {
        let mut segment = Segment::create(std::process::id(), 64, 64, true).expect("create");
        let original_pid = segment.header().parent_pid;
        let new_size = segment.size() * 2;

        segment.remap(new_size).expect("remap");

        assert_eq!(segment.size(), new_size);
        assert_eq!(segment.header().parent_pid, original_pid);
        assert_eq!(
            segment
                .header()
                .segment_size
                .load(std::sync::atomic::Ordering::Acquire) as usize,
            new_size
        );
    }
}
