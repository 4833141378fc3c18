//! Error types for shared-segment allocation.

use thiserror::Error;

/// Errors that can occur while allocating or manipulating a shared segment.
#[derive(Error, Debug)]
pub enum SegmentError {
    /// Failed to create, open or unlink the shared memory object.
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// Failed to map or remap the shared memory region.
    #[error("memory mapping error: {0}")]
    Mmap(String),

    /// Header magic/version/cookie did not validate.
    #[error("invalid control header: {0}")]
    InvalidHeader(String),

    /// A named connection-point path exceeded the platform limit.
    #[error("connection point path too long: {len} bytes, max {max} bytes")]
    PathTooLong { len: usize, max: usize },

    /// Binding the named listener socket failed.
    #[error("bind failed for '{path}': {source}")]
    BindFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A semaphore operation (open/wait/post/unlink) failed.
    #[error("semaphore error: {0}")]
    Semaphore(String),

    /// The requested size exceeds the configured ceiling (`MAX_SZ`).
    #[error("requested size {requested} exceeds ceiling {max}")]
    ResourceExhausted { requested: usize, max: usize },

    /// Remapping the segment to a new size failed; the PR must be treated as dead.
    #[error("remap failed: {0}")]
    RemapFailed(String),

    /// CSPRNG could not produce a unique key within the retry budget.
    #[error("could not allocate a unique segment key after {attempts} attempts")]
    KeyExhausted { attempts: u32 },

    /// IO error not otherwise classified above.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for shared-segment operations.
pub type SegmentResult<T> = Result<T, SegmentError>;
