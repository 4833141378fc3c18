//! Network bridge dispatcher: connection modes, per-connection process
//! isolation, the keystore facade and outbound retry policy.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod isolator;
pub mod keystore;
pub mod retry;

pub use dispatcher::{BridgeMode, bridge_session};
pub use error::{BridgeError, BridgeResult};
pub use isolator::{DispatchOutcome, Isolator, IsolationPolicy};
pub use keystore::{Keystore, KeystoreEntry, split_tag};
pub use retry::retry_with_backoff;
