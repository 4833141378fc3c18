//! Configuration-layer errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine a home directory to resolve state paths")]
    NoHomeDir,

    #[error("invalid trace group in -d selector: {0}")]
    InvalidTraceGroup(String),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
