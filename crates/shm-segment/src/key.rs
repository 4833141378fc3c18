//! Segment key generation: a short, process-unique name probed against the
//! OS shared-memory namespace.

use rand::Rng;

use crate::error::{SegmentError, SegmentResult};
use crate::shm;

/// Maximum graphical-character length of a segment key, excluding the
/// leading `/` the POSIX shm namespace requires.
pub const MAX_KEY_LEN: usize = 31;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KEY_LEN: usize = 12;
const CREATE_RETRY_CAP: u32 = 16;

/// A short process-unique string naming a shared memory object and its
/// three semaphores. Immutable once allocated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedSegmentKey(String);

impl SharedSegmentKey {
    /// Draw a random candidate from the CSPRNG. Does not touch the OS.
    fn random() -> SharedSegmentKey {
        let mut rng = rand::thread_rng();
        let body: String = (0..KEY_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        SharedSegmentKey(body)
    }

    /// Draw random keys and attempt `shm_open(O_CREAT | O_EXCL)` against each
    /// until one succeeds or the retry cap is exhausted, returning the key
    /// and the open fd/pointer triple from the winning attempt.
    pub(crate) fn allocate_unique(
        size: usize,
    ) -> SegmentResult<(SharedSegmentKey, *mut u8, libc::c_int)> {
        for _attempt in 0..CREATE_RETRY_CAP {
            let key = SharedSegmentKey::random();
            match shm::create_shm(&key.shm_name(), size) {
                Ok((ptr, fd)) => return Ok((key, ptr, fd)),
                Err(SegmentError::SharedMemory(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(SegmentError::KeyExhausted {
            attempts: CREATE_RETRY_CAP,
        })
    }

    /// The shared-memory object name: `/` followed by the key body.
    pub fn shm_name(&self) -> String {
        format!("/{}", self.0)
    }

    /// The semaphore name for one of the three suffixes (`v`, `a`, `e`).
    pub fn semaphore_name(&self, suffix: char) -> String {
        format!("/{}{}", self.0, suffix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SharedSegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
