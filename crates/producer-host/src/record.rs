//! The in-process handle to one connected producer.

use std::os::unix::io::RawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Instant;

use shm_segment::{Event, EventQueuePair, Segment, SharedSegmentKey};

use crate::error::{ProducerError, ProducerResult};
use crate::feed_state::FeedState;

/// Sentinel marking an externally-launched producer the host must never
/// signal directly.
pub const NONE_PID: Option<u32> = None;

/// Either side of the control socket, depending on feed state: still
/// listening, or an accepted connection.
pub enum ControlSocket {
    Listening(UnixListener),
    Connected(UnixStream),
}

/// The in-process handle to one connected producer: owns the shared page,
/// the control socket, the event queues, the supervision state and the
/// feed-state machine driving it.
///
/// The feed-state machine is stored as a tagged variant (`feed_state`)
/// directly inside this struct rather than as a callback holding a
/// back-pointer into it, resolving the cyclic-ownership design note: state
/// transitions replace the variant instead of following a pointer back in.
pub struct ProducerRecord {
    pub segment_key: SharedSegmentKey,
    pub shared_page: Segment,
    pub control_socket: Option<ControlSocket>,
    /// Set only for named listeners; unlinked exactly once, on the first
    /// destructive transition.
    pub socket_path: Option<PathBuf>,
    pub child_pid: Option<u32>,
    pub alive: bool,
    pub is_subsegment: bool,
    pub feed_state: FeedState,
    /// May be empty, meaning accept-first (skip verification).
    pub expected_client_key: Vec<u8>,
    pub socket_inbuf: Vec<u8>,
    pub inbuf_offset: usize,
    pub source_descriptor: Option<RawFd>,
    pub launched_time: Instant,
    pub segid: String,
    /// Pending-buffer-outstanding flag (a write is in flight and has not
    /// yet been fully flushed).
    pub pbo: bool,
    /// Socket-signal flag (a pending hangup/error observed on the control
    /// socket but not yet acted on by the driver).
    pub socksig: bool,
    pub audio_offset: usize,
    pub audio_size: usize,
    pub queues: EventQueuePair,
}

impl ProducerRecord {
    /// Build a `ProducerRecord` for a freshly bound named listener
    /// (non-authoritative producer).
    pub fn new_listener(
        segment: Segment,
        listener: UnixListener,
        socket_path: PathBuf,
        expected_client_key: Vec<u8>,
        segid: String,
    ) -> ProducerRecord {
        let audio_size = segment.header().layout(true).audio_size;
        let audio_offset = segment.header().layout(true).audio_offset;
        ProducerRecord {
            segment_key: segment.key.clone(),
            shared_page: segment,
            control_socket: Some(ControlSocket::Listening(listener)),
            socket_path: Some(socket_path),
            child_pid: None,
            alive: true,
            is_subsegment: false,
            feed_state: FeedState::SocketListening,
            expected_client_key,
            socket_inbuf: Vec::new(),
            inbuf_offset: 0,
            source_descriptor: None,
            launched_time: Instant::now(),
            segid,
            pbo: false,
            socksig: false,
            audio_offset,
            audio_size,
            queues: EventQueuePair::new(),
        }
    }

    /// Build a `ProducerRecord` around an already-connected socket (e.g. a
    /// descriptor inherited from the caller rather than obtained from an
    /// `accept()` on a listener owned by this record). Enters
    /// `SocketVerifying` directly, same as a freshly-accepted connection,
    /// so the usual key-verify handshake still runs.
    pub fn new_connected(
        segment: Segment,
        socket: UnixStream,
        expected_client_key: Vec<u8>,
        segid: String,
    ) -> ProducerRecord {
        let audio_size = segment.header().layout(true).audio_size;
        let audio_offset = segment.header().layout(true).audio_offset;
        ProducerRecord {
            segment_key: segment.key.clone(),
            shared_page: segment,
            control_socket: Some(ControlSocket::Connected(socket)),
            socket_path: None,
            child_pid: None,
            alive: true,
            is_subsegment: false,
            feed_state: FeedState::SocketVerifying,
            expected_client_key,
            socket_inbuf: Vec::new(),
            inbuf_offset: 0,
            source_descriptor: None,
            launched_time: Instant::now(),
            segid,
            pbo: false,
            socksig: false,
            audio_offset,
            audio_size,
            queues: EventQueuePair::new(),
        }
    }

    /// Build a `ProducerRecord` for a subsegment spawned off an existing
    /// parent (authoritative: shares the parent's `child_pid`).
    pub fn new_subsegment(
        segment: Segment,
        socket: UnixStream,
        parent_child_pid: Option<u32>,
        with_audio: bool,
        segid: String,
    ) -> ProducerRecord {
        let layout = segment.header().layout(with_audio);
        ProducerRecord {
            segment_key: segment.key.clone(),
            shared_page: segment,
            control_socket: Some(ControlSocket::Connected(socket)),
            socket_path: None,
            child_pid: parent_child_pid,
            alive: true,
            is_subsegment: true,
            feed_state: FeedState::Ready,
            expected_client_key: Vec::new(),
            socket_inbuf: Vec::new(),
            inbuf_offset: 0,
            source_descriptor: None,
            launched_time: Instant::now(),
            segid,
            pbo: false,
            socksig: false,
            audio_offset: layout.audio_offset,
            audio_size: layout.audio_size,
            queues: EventQueuePair::new(),
        }
    }

    /// A PR is alive iff its shared page is mapped and its feed-state is
    /// not `Destroyed`.
    pub fn is_alive(&self) -> bool {
        self.alive && self.shared_page.is_alive() && !matches!(self.feed_state, FeedState::Destroyed)
    }

    /// Enqueue an opaque external event and return the assigned sequence
    /// number.
    pub fn enqueue_external(&self, payload: Vec<u8>) -> ProducerResult<u64> {
        self.queues
            .outbound
            .push(Event::External(payload))
            .map_err(ProducerError::from)
    }

    /// Destruction order per the data model: stop the feed, unlink socket
    /// path, unmap/unlink the page (handled by `Segment`'s `Drop`), and mark
    /// not-alive. The caller is responsible for handing `child_pid` to the
    /// child supervisor when this PR was authoritative and still live.
    pub fn destroy(&mut self) {
        if matches!(self.feed_state, FeedState::Destroyed) {
            return;
        }

        self.feed_state = FeedState::Destroyed;
        self.control_socket = None;

        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(&path);
        }

        self.shared_page.header_mut().mark_dead();
        self.alive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shm_segment::Segment;
    use std::os::unix::net::UnixListener;

    fn make_listener_record() -> (ProducerRecord, PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connpoint.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let segment = Segment::create(std::process::id(), 32, 32, false).unwrap();
        let pr = ProducerRecord::new_listener(
            segment,
            listener,
            path.clone(),
            Vec::new(),
            "tag".into(),
        );
        (pr, path, dir)
    }

    #[test]
    fn alive_iff_page_mapped_and_feed_not_destroyed() {
        let (mut pr, _path, _dir) = make_listener_record();
        assert!(pr.is_alive());
        pr.destroy();
        assert!(!pr.is_alive());
    }

    #[test]
    fn destroy_unlinks_socket_path_exactly_once() {
        let (mut pr, path, _dir) = make_listener_record();
        assert!(path.exists());
        pr.destroy();
        assert!(!path.exists());
        // Second call must not panic or attempt to unlink again.
        pr.destroy();
    }
}
