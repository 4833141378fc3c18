//! Layered configuration and logging bootstrap shared by the host and
//! network-bridge binaries. No other crate in this workspace reads
//! `std::env::var` directly — everything flows through the `Config` value
//! built here once, at process start.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, Paths, DEFAULT_PORT, DEFAULT_RETRY};
pub use error::{ConfigError, ConfigResult};
