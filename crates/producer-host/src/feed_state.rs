//! The non-authoritative producer handshake: `socket-listening` ->
//! `socket-verifying` -> `ready`, plus the terminal `destroyed` state.
//!
//! The driver is invoked with a command (`poll` or `destroy`) and advances
//! the state machine. Stored as a tagged variant directly inside
//! `ProducerRecord` rather than as a callback with a back-pointer into it.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use crate::error::ProducerResult;
use crate::record::{ControlSocket, ProducerRecord};
use crate::verify::constant_time_eq;

/// Cap on the key-verify buffer; exceeding it without a newline destroys
/// the PR.
pub const KEY_VERIFY_CAP: usize = 32;

/// Bounded retry count for `EAGAIN`/`EWOULDBLOCK`/`EINTR` while writing the
/// segment key back to the client.
const SEND_KEY_RETRY_CAP: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    SocketListening,
    SocketVerifying,
    Ready,
    Destroyed,
}

/// The command the driver is invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Poll,
    Destroy,
}

/// What the driver observed on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No state change of note; the PR is still alive.
    NoFrame,
    /// The PR reached `Ready` this tick.
    ReachedReady,
    /// The PR was destroyed this tick.
    Destroyed,
}

impl ProducerRecord {
    /// Drive the feed-state machine once with `command`.
    pub fn drive(&mut self, command: Command) -> ProducerResult<TickOutcome> {
        if let Command::Destroy = command {
            self.destroy();
            return Ok(TickOutcome::Destroyed);
        }

        match self.feed_state {
            FeedState::SocketListening => self.poll_listening(),
            FeedState::SocketVerifying => self.poll_verifying(),
            FeedState::Ready => Ok(TickOutcome::NoFrame),
            FeedState::Destroyed => Ok(TickOutcome::Destroyed),
        }
    }

    fn poll_listening(&mut self) -> ProducerResult<TickOutcome> {
        let accepted = match &self.control_socket {
            Some(ControlSocket::Listening(listener)) => {
                listener.set_nonblocking(true)?;
                match listener.accept() {
                    Ok((stream, _addr)) => Some(stream),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(e) => return Err(e.into()),
                }
            }
            _ => None,
        };

        let Some(stream) = accepted else {
            return Ok(TickOutcome::NoFrame);
        };

        // A connection has been consumed; unlink the filesystem path so a
        // late racer cannot impersonate this listener.
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(&path);
        }

        self.control_socket = Some(ControlSocket::Connected(stream));
        self.feed_state = FeedState::SocketVerifying;

        // Re-enter immediately with the same poll command.
        self.poll_verifying()
    }

    fn poll_verifying(&mut self) -> ProducerResult<TickOutcome> {
        if self.expected_client_key.is_empty() {
            return self.send_key();
        }

        let stream = match &self.control_socket {
            Some(ControlSocket::Connected(stream)) => stream,
            _ => {
                self.destroy();
                return Ok(TickOutcome::Destroyed);
            }
        };

        stream.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        loop {
            let stream = match &self.control_socket {
                Some(ControlSocket::Connected(stream)) => stream,
                _ => unreachable!(),
            };
            match (&*stream).read(&mut byte) {
                Ok(0) => {
                    // Hangup.
                    self.destroy();
                    return Ok(TickOutcome::Destroyed);
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        return self.finish_verify();
                    }
                    if self.socket_inbuf.len() >= KEY_VERIFY_CAP {
                        // Overflow without newline.
                        self.destroy();
                        return Ok(TickOutcome::Destroyed);
                    }
                    self.socket_inbuf.push(byte[0]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(TickOutcome::NoFrame);
                }
                Err(_) => {
                    self.destroy();
                    return Ok(TickOutcome::Destroyed);
                }
            }
        }
    }

    fn finish_verify(&mut self) -> ProducerResult<TickOutcome> {
        let cap = self.expected_client_key.len().max(KEY_VERIFY_CAP);
        let mut padded_input = self.socket_inbuf.clone();
        padded_input.resize(cap, 0);
        let mut padded_expected = self.expected_client_key.clone();
        padded_expected.resize(cap, 0);

        if constant_time_eq(&padded_input, &padded_expected) {
            self.send_key()
        } else {
            self.destroy();
            Ok(TickOutcome::Destroyed)
        }
    }

    fn send_key(&mut self) -> ProducerResult<TickOutcome> {
        let key_line = format!("{}\n", self.segment_key);

        let stream = match &self.control_socket {
            Some(ControlSocket::Connected(stream)) => stream,
            _ => {
                self.destroy();
                return Ok(TickOutcome::Destroyed);
            }
        };
        stream.set_nonblocking(true)?;

        let mut written = 0usize;
        let bytes = key_line.as_bytes();
        for _ in 0..SEND_KEY_RETRY_CAP {
            let stream = match &self.control_socket {
                Some(ControlSocket::Connected(stream)) => stream,
                _ => unreachable!(),
            };
            match (&*stream).write(&bytes[written..]) {
                Ok(n) => {
                    written += n;
                    if written == bytes.len() {
                        self.feed_state = FeedState::Ready;
                        return Ok(TickOutcome::ReachedReady);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(_) => {
                    self.destroy();
                    return Ok(TickOutcome::Destroyed);
                }
            }
        }

        self.destroy();
        Ok(TickOutcome::Destroyed)
    }
}

/// Helper used by tests and by the subsegment spawner: connect a plain
/// blocking client `UnixStream` to a bound listener's path.
pub fn connect_client(path: &std::path::Path) -> std::io::Result<UnixStream> {
    UnixStream::connect(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ProducerRecord;
    use shm_segment::Segment;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::time::Duration;

    fn make_pr(path: &std::path::Path, expected_key: &[u8]) -> ProducerRecord {
        let listener = UnixListener::bind(path).unwrap();
        let segment = Segment::create(std::process::id(), 32, 32, false).unwrap();
        ProducerRecord::new_listener(
            segment,
            listener,
            path.to_path_buf(),
            expected_key.to_vec(),
            "tag".into(),
        )
    }

    fn drive_until<F: Fn(&ProducerRecord) -> bool>(pr: &mut ProducerRecord, pred: F, max_ticks: u32) {
        for _ in 0..max_ticks {
            if pred(pr) {
                return;
            }
            pr.drive(Command::Poll).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("predicate never became true within {} ticks", max_ticks);
    }

    #[test]
    fn happy_verify_sends_key_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.sock");
        let mut pr = make_pr(&path, b"ABCDEF");

        let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
        stream.write_all(b"ABCDEF\n").unwrap();

        drive_until(&mut pr, |pr| pr.feed_state == FeedState::Ready, 200);

        let mut response = String::new();
        stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        stream.read_to_string(&mut response).unwrap();
        assert_eq!(response.trim_end(), pr.segment_key.as_str());
        assert!(!path.exists());
    }

    #[test]
    fn wrong_key_destroys_pr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.sock");
        let mut pr = make_pr(&path, b"ABCDEF");

        let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
        stream.write_all(b"AXCDEF\n").unwrap();

        drive_until(&mut pr, |pr| pr.feed_state == FeedState::Destroyed, 200);
        assert!(!path.exists());
    }

    #[test]
    fn overflow_without_newline_destroys_pr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.sock");
        let mut pr = make_pr(&path, b"ABCDEF");

        let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
        stream.write_all(&[b'x'; 40]).unwrap();

        drive_until(&mut pr, |pr| pr.feed_state == FeedState::Destroyed, 400);
    }

    #[test]
    fn empty_expected_key_skips_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.sock");
        let mut pr = make_pr(&path, b"");

        let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();

        drive_until(&mut pr, |pr| pr.feed_state == FeedState::Ready, 200);

        let mut response = String::new();
        stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        stream.read_to_string(&mut response).unwrap();
        assert_eq!(response.trim_end(), pr.segment_key.as_str());
    }
}
