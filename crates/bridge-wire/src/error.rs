//! Error types for the bridge wire framing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("frame size mismatch: got {got} bytes, expected {expected}")]
    SizeMismatch { got: usize, expected: usize },

    #[error("malformed tag string: {0}")]
    MalformedTag(String),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type WireResult<T> = Result<T, WireError>;
