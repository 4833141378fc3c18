//! Control header layout and the size/offset function of a shared page.
//!
//! # Memory layout
//!
//! ```text
//! +------------------------------------------------------+
//! | ControlHeader (64 bytes, cache-line aligned)          |
//! +------------------------------------------------------+
//! | Event queue block (fixed size)                        |
//! +------------------------------------------------------+
//! | Video buffer (w * h * BYTES_PER_PIXEL)                 |
//! +------------------------------------------------------+
//! | Audio buffer (fixed size, omitted for input segments) |
//! +------------------------------------------------------+
//! ```
//!
//! The control header is always at offset 0. `segment_size` in the header
//! always equals the mapped length; video/audio offsets are recomputed from
//! the current `(w, h)` by [`Layout::compute`] after every resize.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Cookie identifying this build's ABI. Producers must present a matching
/// value or the header is rejected as incompatible.
pub const ABI_COOKIE: u64 = 0x4152_4342_5249_4447; // "ARCBRIDG"

pub const VERSION_MAJOR: u16 = 0;
pub const VERSION_MINOR: u16 = 1;

/// Size of the control header (cache-line aligned).
pub const HEADER_SIZE: usize = 64;

/// Size of the fixed event-queue block following the header.
pub const EVENT_QUEUE_SIZE: usize = 4096;

/// Bytes per pixel assumed by the video buffer layout (RGBA8888).
pub const BYTES_PER_PIXEL: usize = 4;

/// Fixed audio ring buffer size, present on every non-input segment.
pub const AUDIO_BUF_SIZE: usize = 65_536;

/// Floor: the smallest segment this allocator will ever create.
pub const MIN_SZ: usize = HEADER_SIZE + EVENT_QUEUE_SIZE + 32 * 32 * BYTES_PER_PIXEL;

/// Ceiling: no segment may exceed this size, mirroring `ARCAN_SHMPAGE_MAX_SZ`.
pub const MAX_SZ: usize = 64 * 1024 * 1024;

/// Inclusive bound on width/height accepted by the layout function.
pub const MAX_W: u32 = 8192;
pub const MAX_H: u32 = 8192;

/// Default dimensions used when a hint is out of range.
pub const DEFAULT_W: u32 = 32;
pub const DEFAULT_H: u32 = 32;

/// Clamp a (width, height) hint pair to `[1, MAX_W/MAX_H]`, falling back to
/// the default 32x32 when out of range.
pub fn clamp_hint(hint_w: i64, hint_h: i64) -> (u32, u32) {
    let w = if hint_w < 1 || hint_w > MAX_W as i64 {
        DEFAULT_W
    } else {
        hint_w as u32
    };
    let h = if hint_h < 1 || hint_h > MAX_H as i64 {
        DEFAULT_H
    } else {
        hint_h as u32
    };
    (w, h)
}

/// Byte offsets and total size for a given `(w, h)`, audio-bearing or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub event_queue_offset: usize,
    pub video_offset: usize,
    pub video_size: usize,
    pub audio_offset: usize,
    pub audio_size: usize,
    pub total_size: usize,
}

impl Layout {
    /// Compute the layout for `(w, h)`. `with_audio` is false for input
    /// subsegments (encoders), which are audio-silent by default.
    pub fn compute(w: u32, h: u32, with_audio: bool) -> Layout {
        let event_queue_offset = HEADER_SIZE;
        let video_offset = event_queue_offset + EVENT_QUEUE_SIZE;
        let video_size = w as usize * h as usize * BYTES_PER_PIXEL;
        let audio_offset = video_offset + video_size;
        let audio_size = if with_audio { AUDIO_BUF_SIZE } else { 0 };
        let total_size = audio_offset + audio_size;

        Layout {
            event_queue_offset,
            video_offset,
            video_size,
            audio_offset,
            audio_size,
            total_size,
        }
    }
}

/// The fixed-layout control header at offset 0 of every shared page.
#[repr(C, align(64))]
pub struct ControlHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub parent_pid: u32,
    pub cookie: u64,
    /// Dead-man flag: non-zero means the producer side considers the
    /// segment alive. Stored as `u32` rather than `bool` for a stable FFI
    /// width.
    pub dms: AtomicU32,
    pub w: u32,
    pub h: u32,
    pub segment_size: AtomicU64,
    /// Synchronisation word shared with the event semaphore / futex wait.
    pub wake_word: AtomicU32,
    _reserved: [u8; 20],
}

impl ControlHeader {
    /// Zero the header, then fill in the fields the allocator is
    /// responsible for. `w`/`h` must already be clamped by the caller.
    pub fn init(&mut self, parent_pid: u32, w: u32, h: u32, segment_size: usize) {
        self.version_major = VERSION_MAJOR;
        self.version_minor = VERSION_MINOR;
        self.parent_pid = parent_pid;
        self.cookie = ABI_COOKIE;
        self.dms = AtomicU32::new(1);
        self.w = w;
        self.h = h;
        self.segment_size = AtomicU64::new(segment_size as u64);
        self.wake_word = AtomicU32::new(0);
        self._reserved = [0u8; 20];
    }

    /// A header is valid only if the ABI cookie and version match exactly.
    pub fn validate(&self) -> bool {
        self.cookie == ABI_COOKIE
            && self.version_major == VERSION_MAJOR
            && self.version_minor == VERSION_MINOR
    }

    pub fn is_alive(&self) -> bool {
        self.dms.load(Ordering::Acquire) != 0
    }

    pub fn mark_dead(&self) {
        self.dms.store(0, Ordering::Release);
    }

    pub fn layout(&self, with_audio: bool) -> Layout {
        Layout::compute(self.w, self.h, with_audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_and_alignment() {
        assert_eq!(std::mem::size_of::<ControlHeader>(), HEADER_SIZE);
        assert_eq!(std::mem::align_of::<ControlHeader>(), 64);
    }

    #[test]
    fn clamp_hint_in_range_is_unchanged() {
        assert_eq!(clamp_hint(640, 480), (640, 480));
    }

    #[test]
    fn clamp_hint_out_of_range_falls_back_to_default() {
        assert_eq!(clamp_hint(0, 480), (DEFAULT_W, 480));
        assert_eq!(clamp_hint(640, -1), (640, DEFAULT_H));
        assert_eq!(clamp_hint(MAX_W as i64 + 1, MAX_H as i64 + 1), (DEFAULT_W, DEFAULT_H));
    }

    #[test]
    fn layout_offsets_follow_header_then_queue_then_video_then_audio() {
        let layout = Layout::compute(64, 64, true);
        assert_eq!(layout.event_queue_offset, HEADER_SIZE);
        assert_eq!(layout.video_offset, HEADER_SIZE + EVENT_QUEUE_SIZE);
        assert_eq!(layout.video_size, 64 * 64 * BYTES_PER_PIXEL);
        assert_eq!(layout.audio_offset, layout.video_offset + layout.video_size);
        assert_eq!(layout.audio_size, AUDIO_BUF_SIZE);
        assert_eq!(layout.total_size, layout.audio_offset + AUDIO_BUF_SIZE);
    }

    #[test]
    fn layout_without_audio_has_no_audio_buffer() {
        let layout = Layout::compute(32, 32, false);
        assert_eq!(layout.audio_size, 0);
        assert_eq!(layout.total_size, layout.audio_offset);
    }

    #[test]
    fn header_init_sets_cookie_and_liveness() {
        let mut header = unsafe { std::mem::zeroed::<ControlHeader>() };
        header.init(1234, 640, 480, 1 << 20);
        assert!(header.validate());
        assert!(header.is_alive());
        assert_eq!(header.parent_pid, 1234);
        assert_eq!(header.segment_size.load(Ordering::Relaxed), 1 << 20);

        header.mark_dead();
        assert!(!header.is_alive());
    }
}
