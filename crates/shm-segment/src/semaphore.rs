//! POSIX named counting semaphores: the "semaphore triple" associated with
//! every shared segment.
//!
//! Producer/consumer wakeups elsewhere in this workspace go through a futex
//! word embedded in the header instead of named semaphores; this module
//! follows the same FFI-wrapper idiom as [`crate::shm`]: `CString` name
//! construction, create-exclusive paired with open-existing, and
//! ENOENT-is-ok on unlink.

use std::ffi::CString;

use libc::{sem_t, O_CREAT, O_EXCL};

use crate::error::{SegmentError, SegmentResult};

/// One of the three roles in a segment's semaphore triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    Video,
    Audio,
    Event,
}

impl SemaphoreKind {
    fn suffix(self) -> char {
        match self {
            SemaphoreKind::Video => 'v',
            SemaphoreKind::Audio => 'a',
            SemaphoreKind::Event => 'e',
        }
    }

    /// Initial count mandated by the control protocol: video/audio start
    /// empty, the event semaphore starts with one permit.
    fn initial_count(self) -> u32 {
        match self {
            SemaphoreKind::Video | SemaphoreKind::Audio => 0,
            SemaphoreKind::Event => 1,
        }
    }
}

/// A single named semaphore, owned by the side that created it.
pub struct NamedSemaphore {
    name: String,
    handle: *mut sem_t,
}

// SAFETY: all access goes through sem_wait/sem_post, which are documented
// as safe for concurrent use across processes and threads.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a new named semaphore with create-exclusive semantics.
    pub fn create(name: &str, kind: SemaphoreKind) -> SegmentResult<NamedSemaphore> {
        let c_name = CString::new(name).map_err(|e| SegmentError::Semaphore(e.to_string()))?;

        let handle = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                O_CREAT | O_EXCL,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                kind.initial_count(),
            )
        };

        if handle == libc::SEM_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(SegmentError::Semaphore(format!(
                "sem_open(create) failed for '{}': {}",
                name, err
            )));
        }

        Ok(NamedSemaphore {
            name: name.to_string(),
            handle,
        })
    }

    /// Open an existing named semaphore created by the segment's owner.
    pub fn open_existing(name: &str) -> SegmentResult<NamedSemaphore> {
        let c_name = CString::new(name).map_err(|e| SegmentError::Semaphore(e.to_string()))?;

        let handle = unsafe { libc::sem_open(c_name.as_ptr(), 0) };

        if handle == libc::SEM_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(SegmentError::Semaphore(format!(
                "sem_open(existing) failed for '{}': {}",
                name, err
            )));
        }

        Ok(NamedSemaphore {
            name: name.to_string(),
            handle,
        })
    }

    pub fn post(&self) -> SegmentResult<()> {
        if unsafe { libc::sem_post(self.handle) } == -1 {
            let err = std::io::Error::last_os_error();
            return Err(SegmentError::Semaphore(format!("sem_post: {}", err)));
        }
        Ok(())
    }

    pub fn wait(&self) -> SegmentResult<()> {
        if unsafe { libc::sem_wait(self.handle) } == -1 {
            let err = std::io::Error::last_os_error();
            return Err(SegmentError::Semaphore(format!("sem_wait: {}", err)));
        }
        Ok(())
    }

    pub fn try_wait(&self) -> SegmentResult<bool> {
        if unsafe { libc::sem_trywait(self.handle) } == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(false);
            }
            return Err(SegmentError::Semaphore(format!("sem_trywait: {}", err)));
        }
        Ok(true)
    }

    /// Unlink this semaphore's name from the OS namespace. `ENOENT` is
    /// treated as success.
    pub fn unlink(&self) -> SegmentResult<()> {
        let c_name = CString::new(self.name.clone())
            .map_err(|e| SegmentError::Semaphore(e.to_string()))?;

        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(SegmentError::Semaphore(format!("sem_unlink: {}", err)));
            }
        }
        Ok(())
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe {
                libc::sem_close(self.handle);
            }
        }
    }
}

/// The three named semaphores associated with one segment key, suffixed
/// `v`/`a`/`e`. Lifetime equals the owning segment's.
pub struct SemaphoreTriple {
    pub video: NamedSemaphore,
    pub audio: NamedSemaphore,
    pub event: NamedSemaphore,
}

impl SemaphoreTriple {
    /// Create all three semaphores, rolling back any already-opened ones on
    /// partial failure so no semaphore name outlives its segment.
    pub fn create(base_name: &str) -> SegmentResult<SemaphoreTriple> {
        let video = NamedSemaphore::create(
            &format!("{}v", base_name),
            SemaphoreKind::Video,
        )?;

        let audio = match NamedSemaphore::create(&format!("{}a", base_name), SemaphoreKind::Audio)
        {
            Ok(sem) => sem,
            Err(e) => {
                let _ = video.unlink();
                return Err(e);
            }
        };

        let event = match NamedSemaphore::create(&format!("{}e", base_name), SemaphoreKind::Event)
        {
            Ok(sem) => sem,
            Err(e) => {
                let _ = video.unlink();
                let _ = audio.unlink();
                return Err(e);
            }
        };

        Ok(SemaphoreTriple { video, audio, event })
    }

    pub fn open_existing(base_name: &str) -> SegmentResult<SemaphoreTriple> {
        Ok(SemaphoreTriple {
            video: NamedSemaphore::open_existing(&format!("{}v", base_name))?,
            audio: NamedSemaphore::open_existing(&format!("{}a", base_name))?,
            event: NamedSemaphore::open_existing(&format!("{}e", base_name))?,
        })
    }

    /// Unlink all three names, ignoring `ENOENT` on each.
    pub fn unlink_all(&self) -> SegmentResult<()> {
        self.video.unlink()?;
        self.audio.unlink()?;
        self.event.unlink()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_base() -> String {
        format!("/sst_{}", std::process::id())
    }

    #[test]
    fn create_then_open_existing_roundtrips() {
        let base = unique_base();
        let created = SemaphoreTriple::create(&base).expect("create");
        created.event.post().unwrap();
        let opened = SemaphoreTriple::open_existing(&base).expect("open");
        assert!(opened.event.try_wait().unwrap());
        created.unlink_all().unwrap();
    }

    #[test]
    fn video_and_audio_start_at_zero_event_starts_at_one() {
        let base = format!("{}_counts", unique_base());
        let triple = SemaphoreTriple::create(&base).expect("create");
        assert!(!triple.video.try_wait().unwrap());
        assert!(!triple.audio.try_wait().unwrap());
        assert!(triple.event.try_wait().unwrap());
        triple.unlink_all().unwrap();
    }

    #[test]
    fn unlink_twice_is_ok() {
        let base = format!("{}_twice", unique_base());
        let triple = SemaphoreTriple::create(&base).expect("create");
        triple.unlink_all().unwrap();
        triple.unlink_all().unwrap();
    }
}
