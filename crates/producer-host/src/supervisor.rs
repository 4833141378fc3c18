//! Child Supervisor: tracks the producer OS process, performs non-blocking
//! liveness checks, and guarantees reap via a bounded-wait-then-kill
//! watcher.

use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

use crate::record::{ControlSocket, ProducerRecord};

const REAP_ATTEMPTS: u32 = 10;
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// `check_alive(PR) -> bool`.
///
/// For `child_pid == None`, the only liveness signal is the control socket:
/// a short non-blocking poll for `ERR|HUP|NVAL`. Otherwise, a non-blocking
/// `waitpid`: only a return equal to `child_pid` declares death — any other
/// result (including "not yet") reports alive, since the producer is free
/// to `exec` and change identity.
pub fn check_alive(pr: &ProducerRecord) -> bool {
    match pr.child_pid {
        None => check_alive_via_socket(pr),
        Some(pid) => check_alive_via_waitpid(pid),
    }
}

fn check_alive_via_socket(pr: &ProducerRecord) -> bool {
    let fd = match &pr.control_socket {
        Some(ControlSocket::Connected(stream)) => stream.as_raw_fd(),
        Some(ControlSocket::Listening(listener)) => listener.as_raw_fd(),
        None => return false,
    };

    let mut pfd = libc::pollfd {
        fd,
        events: 0,
        revents: 0,
    };

    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return true; // poll() itself failing is not evidence of producer death
    }

    let death_mask = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
    pfd.revents & death_mask == 0
}

fn check_alive_via_waitpid(pid: u32) -> bool {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    rc != pid as libc::pid_t
}

/// `reap(pid)`: loop up to 10 times with 1-second sleeps, calling
/// non-blocking `waitpid`; on the last iteration, send `KILL`
/// unconditionally. `reaper_enabled` is threaded in by the caller from the
/// one-time configuration load (the `ARCAN_DEBUG_NONANNY` toggle), never
/// read from the environment here.
pub fn reap(pid: u32, reaper_enabled: bool) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if !reaper_enabled {
            return;
        }

        for attempt in 0..REAP_ATTEMPTS {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
            if rc == pid as libc::pid_t {
                return;
            }

            if attempt + 1 == REAP_ATTEMPTS {
                tracing::warn!(pid, "reaper exhausted wait attempts, sending SIGKILL");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
                return;
            }

            thread::sleep(REAP_INTERVAL);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ProducerRecord;
    use shm_segment::Segment;
    use std::os::unix::net::UnixListener;

    fn make_pr() -> (ProducerRecord, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cs.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let segment = Segment::create(std::process::id(), 32, 32, false).unwrap();
        let pr = ProducerRecord::new_listener(segment, listener, path, Vec::new(), "tag".into());
        (pr, dir)
    }

    #[test]
    fn none_child_pid_reports_alive_via_listening_socket() {
        let (pr, _dir) = make_pr();
        assert!(check_alive(&pr));
    }

    #[test]
    fn reap_disabled_by_toggle_exits_immediately() {
        let handle = reap(999_999, false);
        handle.join().unwrap();
    }

    #[test]
    fn reap_kills_unconditionally_after_exhausting_attempts() {
        // A pid that will never appear as our own child: waitpid never
        // matches, so the watcher should run to exhaustion and send KILL
        // (which, for a non-existent pid, simply fails silently).
        let handle = reap(999_999, true);
        // Don't block the test suite for ~10s; just confirm it doesn't
        // panic when spawned and can be detached.
        drop(handle);
    }
}
