//! Bridge-level and keystore errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("keystore entry not found for tag {0:?}")]
    NotFound(String),

    #[error("malformed keystore entry for tag {0:?}: {1}")]
    InvalidEntry(String, String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type KeystoreResult<T> = Result<T, KeystoreError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),

    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept lost: connection dropped before dispatch")]
    AcceptLost,

    #[error("authentication failed")]
    AuthFailed,

    #[error("outbound connect retries exhausted after {attempts} attempts")]
    ConnectRetryExhausted { attempts: u32 },

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Config(#[from] host_config::ConfigError),

    #[error(transparent)]
    Wire(#[from] bridge_wire::WireError),

    #[error(transparent)]
    Producer(#[from] producer_host::ProducerError),

    #[error(transparent)]
    Segment(#[from] shm_segment::SegmentError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Exit codes surfaced by `main` for each propagated [`BridgeError`]
/// variant, per the CLI surface's documented non-zero conditions.
impl BridgeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::ArgumentInvalid(_) => 64,
            BridgeError::BindFailed { .. } => 65,
            BridgeError::ConnectRetryExhausted { .. } => 66,
            BridgeError::AuthFailed => 67,
            BridgeError::Keystore(_) => 68,
            _ => 1,
        }
    }
}
