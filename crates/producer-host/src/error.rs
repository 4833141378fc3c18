//! Error types for the producer-record and connection-listener machinery.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("segment error: {0}")]
    Segment(#[from] shm_segment::SegmentError),

    #[error("the accepted client key did not match")]
    KeyMismatch,

    #[error("client key exceeded the verification cap")]
    KeyTooLong,

    #[error("producer control socket hung up")]
    ProducerHangup,

    #[error("producer process died")]
    ProducerDied,

    #[error("write to control socket exhausted its retry budget")]
    WriteRetryExhausted,

    #[error("operation attempted on a producer that is not alive")]
    NotAlive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProducerResult<T> = Result<T, ProducerError>;
