//! Subsegment Spawner: allocates a new `ProducerRecord` branched off an
//! existing one, transfers a socket pair to the producer, and announces the
//! new segment over the parent's event queue.

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use shm_segment::{clamp_hint, Segment};

use crate::error::{ProducerError, ProducerResult};
use crate::record::{ControlSocket, ProducerRecord};

/// `spawn_subsegment(parent, is_input, hint_w, hint_h, tag) -> PR`.
///
/// Preconditions: `parent` is alive.
pub fn spawn_subsegment(
    parent: &mut ProducerRecord,
    is_input: bool,
    hint_w: i64,
    hint_h: i64,
    tag: String,
) -> ProducerResult<ProducerRecord> {
    if !parent.is_alive() {
        return Err(ProducerError::NotAlive);
    }

    // 1. Allocate a new shared page / semaphore triple (no named socket).
    // 2. Clamp the dimension hints before anyone can observe them.
    let (w, h) = clamp_hint(hint_w, hint_h);

    let segment = Segment::create(
        parent.shared_page.header().parent_pid,
        w,
        h,
        !is_input,
    )?;

    // 3. Write (w, h) before notifying the producer — the control header's
    // init() already did this at allocation time, so there is no window
    // where the producer could observe uninitialised dimensions.
    debug_assert_eq!(segment.header().w, w);
    debug_assert_eq!(segment.header().h, h);

    // 4. Connected socketpair, close-on-exec on both halves.
    let (child_half, parent_half) = UnixStream::pair()?;
    set_close_on_exec(child_half.as_raw_fd())?;
    set_close_on_exec(parent_half.as_raw_fd())?;

    // 5. Subsegments share the parent's OS process; freeing one must not
    // signal it.
    let child_pid = parent.child_pid;

    let child_segid = format!("{}:{}", parent.segid, tag);
    let child = ProducerRecord::new_subsegment(segment, child_half, child_pid, !is_input, child_segid);

    // Hand `parent_half` to the connected producer over its own control
    // socket via SCM_RIGHTS before announcing the new segment, so the
    // announce event is never observed before the descriptor it refers to
    // has actually crossed the socket.
    let new_key = child.segment_key.clone();
    send_fd_to_producer(parent, parent_half.as_raw_fd())?;
    drop(parent_half); // our copy; the producer now holds its own via SCM_RIGHTS

    parent
        .queues
        .announce_subsegment(is_input, tag, new_key)
        .map_err(ProducerError::from)?;

    Ok(child)
}

/// Send `fd` to the process on the other end of `parent`'s control socket
/// using a `SCM_RIGHTS` ancillary message. There is no stable Rust API for
/// ancillary data, so this goes through raw `libc::sendmsg`.
fn send_fd_to_producer(parent: &ProducerRecord, fd: RawFd) -> ProducerResult<()> {
    let sock_fd = match &parent.control_socket {
        Some(ControlSocket::Connected(stream)) => stream.as_raw_fd(),
        _ => return Err(ProducerError::ProducerHangup),
    };
    send_fd(sock_fd, fd).map_err(ProducerError::from)
}

/// Send a single file descriptor across `sock_fd` via `SCM_RIGHTS`, with a
/// one-byte payload so the write side of the control socket always has
/// something to read alongside the ancillary data.
fn send_fd(sock_fd: RawFd, fd: RawFd) -> std::io::Result<()> {
    let payload = [b'F'];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as libc::c_uint) };
    let mut cmsg_buf = vec![0u8; cmsg_space as usize];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(std::io::Error::other("no room for SCM_RIGHTS control message"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as libc::c_uint) as _;
        std::ptr::copy_nonoverlapping(&fd as *const RawFd, libc::CMSG_DATA(cmsg) as *mut RawFd, 1);
    }

    if unsafe { libc::sendmsg(sock_fd, &msg, 0) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Set `FD_CLOEXEC` on a raw descriptor.
fn set_close_on_exec(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shm_segment::page::{DEFAULT_H, DEFAULT_W};

    /// A parent record with a real connected control socket, so the
    /// `SCM_RIGHTS` transfer in `spawn_subsegment` has somewhere to send to.
    /// The peer half is leaked to the caller to keep it from being closed
    /// out from under the in-flight transfer; tests only assert on the
    /// sending side.
    fn make_parent() -> (ProducerRecord, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (producer_side, host_side) = UnixStream::pair().unwrap();
        std::mem::forget(producer_side);
        let segment = Segment::create(std::process::id(), 640, 480, true).unwrap();
        let pr = ProducerRecord::new_subsegment(segment, host_side, None, true, "parent".into());
        (pr, dir)
    }

    #[test]
    fn spawn_clamps_out_of_range_hints_to_default() {
        let (mut parent, _dir) = make_parent();
        let child = spawn_subsegment(&mut parent, false, -1, 999_999, "aux".into()).unwrap();
        assert_eq!(child.shared_page.header().w, DEFAULT_W);
        assert_eq!(child.shared_page.header().h, DEFAULT_H);
    }

    #[test]
    fn spawn_inherits_parent_child_pid_and_marks_subsegment() {
        let (mut parent, _dir) = make_parent();
        parent.child_pid = Some(4242);
        let child = spawn_subsegment(&mut parent, false, 64, 64, "aux".into()).unwrap();
        assert_eq!(child.child_pid, Some(4242));
        assert!(child.is_subsegment);
    }

    #[test]
    fn input_subsegments_are_audio_silent() {
        let (mut parent, _dir) = make_parent();
        let child = spawn_subsegment(&mut parent, true, 64, 64, "in".into()).unwrap();
        assert_eq!(child.audio_size, 0);
    }

    #[test]
    fn announce_is_observed_exactly_once_with_fd_transfer_first() {
        let (mut parent, _dir) = make_parent();
        let child = spawn_subsegment(&mut parent, false, 64, 64, "aux".into()).unwrap();

        assert_eq!(
            parent.queues.outbound.pop(),
            Some(shm_segment::Event::FdTransferAnnounce)
        );
        match parent.queues.outbound.pop() {
            Some(shm_segment::Event::NewSegmentAnnounce { key, .. }) => {
                assert_eq!(key, child.segment_key)
            }
            other => panic!("expected NewSegmentAnnounce, got {:?}", other),
        }
        assert_eq!(parent.queues.outbound.pop(), None);
    }
}
