//! Producer Record: the in-process handle to one connected producer, its
//! connection-verify handshake, subsegment spawning, resize negotiation and
//! child supervision.

pub mod error;
pub mod feed_state;
pub mod record;
pub mod resize;
pub mod subsegment;
pub mod supervisor;
pub mod verify;

pub use error::{ProducerError, ProducerResult};
pub use feed_state::{Command, FeedState, TickOutcome};
pub use record::{ControlSocket, ProducerRecord};
pub use subsegment::spawn_subsegment;
