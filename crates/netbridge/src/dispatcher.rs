//! Network Bridge Dispatcher: four operating modes multiplexing between
//! local producer IPC and an authenticated remote channel. Grounded on
//! `daemon-relay`'s connection-state/event-driven client shape and
//! `falco`'s courier accept/process loop, generalized from one fixed
//! direction to the four modes of SPEC_FULL §4.6.
//!
//! The wire protocol establishing an authenticated session (CSPRNG, key
//! exchange) is out of scope (§1): this module treats a connected
//! [`tokio::net::TcpStream`] as that opaque, already-authenticated byte
//! stream and only frames *its own* traffic (events, buffer chunks) on top
//! via `bridge-wire`.

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use bridge_wire::{BufferFrame, BufferKind, EventFrame};
use host_config::Config;
use producer_host::{Command as FeedCommand, ProducerRecord, TickOutcome};
use shm_segment::{Event, Segment, DEFAULT_H, DEFAULT_W};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::isolator::{DispatchOutcome, Isolator, IsolationPolicy};
use crate::keystore::{split_tag, Keystore};
use crate::retry::retry_with_backoff;

/// The four operating modes selected at startup (SPEC_FULL §4.6 table).
#[derive(Debug)]
pub enum BridgeMode {
    ForwardLocal { connpoint: String, host: String, port: u16 },
    InheritedSocket { fd: RawFd, host: String, port: u16 },
    Listen { port: u16, bind_host: String, exec: Option<Vec<String>> },
    Outbound { target: String, port: Option<u16> },
}

fn one_event_as_json(event: &Event) -> serde_json::Value {
    match event {
        Event::FdTransferAnnounce => serde_json::json!({ "kind": "fd-transfer-announce" }),
        Event::NewSegmentAnnounce { is_input, tag, key } => serde_json::json!({
            "kind": "new-segment-announce",
            "is_input": is_input,
            "tag": tag,
            "key": key.as_str(),
        }),
        Event::External(payload) => serde_json::json!({
            "kind": "external",
            "payload": payload,
        }),
    }
}

/// Drain every currently-queued outbound event from `pr` and forward each
/// as one [`EventFrame`] over `session`, in enqueue order (SPEC_FULL §5's
/// ordering guarantee).
pub async fn pump_outbound_events(
    pr: &ProducerRecord,
    segment_tag: &str,
    session: &mut TcpStream,
) -> BridgeResult<()> {
    while let Some(event) = pr.queues.outbound.pop() {
        let frame = EventFrame {
            segment_tag: segment_tag.to_string(),
            body: one_event_as_json(&event),
        };
        session.write_all(&frame.encode()?).await?;
    }
    Ok(())
}

/// Snapshot the current video buffer and send it as one [`BufferFrame`].
/// Pixel format is out of scope; this forwards the raw bytes the shared
/// page layout guarantees.
pub async fn push_video_frame(
    pr: &ProducerRecord,
    segment_tag: &str,
    with_audio: bool,
    session: &mut TcpStream,
) -> BridgeResult<()> {
    let frame = BufferFrame {
        segment_tag: segment_tag.to_string(),
        kind: BufferKind::Video,
        data: pr.shared_page.video_bytes(with_audio).to_vec(),
    };
    session.write_all(&frame.encode()?).await?;
    Ok(())
}

/// Resolve the outbound positional form `[tag@]host[:port]` via the
/// keystore when a tag is present, otherwise a literal host with the
/// given or default port.
pub fn resolve_outbound_target(
    target: &str,
    explicit_port: Option<u16>,
    config: &Config,
    keystore_root: &std::path::Path,
) -> BridgeResult<(String, u16)> {
    let (tag, host_part) = split_tag(target);

    if let Some(tag) = tag {
        let ks = Keystore::open(keystore_root)?;
        let entry = ks
            .lookup(tag)?
            .ok_or_else(|| BridgeError::ArgumentInvalid(format!("unknown keystore tag {tag:?}")))?;
        return Ok((entry.host, entry.port));
    }

    let port = explicit_port.unwrap_or(config.default_port);
    Ok((host_part.to_string(), port))
}

/// Establish the outbound authenticated session with bounded retries and
/// linear backoff (SPEC_FULL §4.6 forward-local / outbound-client path).
pub async fn connect_outbound(host: &str, port: u16, max_attempts: u32) -> BridgeResult<TcpStream> {
    let addr = format!("{host}:{port}");
    retry_with_backoff(max_attempts, |attempt| {
        let addr = addr.clone();
        async move {
            info!(attempt, %addr, "attempting outbound connect");
            TcpStream::connect(&addr).await
        }
    })
    .await
}

/// **inherited-socket** mode: adopt a caller-supplied descriptor that must
/// `fstat` as a socket and is connected to a local producer (not the remote
/// session — that is dialed separately via [`connect_outbound`]).
pub fn adopt_inherited_socket(fd: RawFd) -> BridgeResult<UnixStream> {
    let stream = unsafe { UnixStream::from_raw_fd(fd) };
    if !fstat_is_socket(stream.as_raw_fd())? {
        // The descriptor is still owned by `stream`'s Drop; leak it back to
        // the OS rather than double-closing an fd we don't actually own.
        std::mem::forget(stream);
        return Err(BridgeError::ArgumentInvalid(format!(
            "fd {fd} is not a socket"
        )));
    }
    Ok(stream)
}

/// Adopt a descriptor inherited across a `FORK`-policy re-exec as the
/// already-established remote session (a connected TCP socket handed down
/// by the parent's `accept()`).
fn adopt_inherited_tcp_session(fd: RawFd) -> BridgeResult<TcpStream> {
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    if !fstat_is_socket(std_stream.as_raw_fd())? {
        std::mem::forget(std_stream);
        return Err(BridgeError::ArgumentInvalid(format!(
            "fd {fd} is not a socket"
        )));
    }
    std_stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(std_stream)?)
}

fn fstat_is_socket(fd: RawFd) -> BridgeResult<bool> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc != 0 {
        return Err(BridgeError::Io(std::io::Error::last_os_error()));
    }
    Ok(stat.st_mode & libc::S_IFMT == libc::S_IFSOCK)
}

/// Drive a freshly constructed `ProducerRecord` through its accept/verify
/// handshake until it reaches `Ready`, polling with a short sleep between
/// ticks. Blocking: callers run this on a blocking thread.
fn drive_to_ready(pr: &mut ProducerRecord) -> BridgeResult<()> {
    loop {
        match pr.drive(FeedCommand::Poll)? {
            TickOutcome::ReachedReady => return Ok(()),
            TickOutcome::Destroyed => {
                return Err(BridgeError::ArgumentInvalid(
                    "local producer connection closed before completing handshake".into(),
                ))
            }
            TickOutcome::NoFrame => std::thread::sleep(Duration::from_millis(5)),
        }
    }
}

/// Bind `connpoint` as a named listener, allocate its shared segment, and
/// block until a local producer has connected and completed the verify
/// handshake (SPEC_FULL §4.6 forward-local / bridge-outbound local side).
pub async fn establish_local_listener(connpoint: String) -> BridgeResult<ProducerRecord> {
    tokio::task::spawn_blocking(move || {
        let path = std::path::PathBuf::from(&connpoint);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        let segment = Segment::create(std::process::id(), DEFAULT_W, DEFAULT_H, true)?;
        let mut pr = ProducerRecord::new_listener(segment, listener, path, Vec::new(), connpoint);
        drive_to_ready(&mut pr)?;
        Ok(pr)
    })
    .await
    .map_err(|e| BridgeError::ArgumentInvalid(format!("local listener task panicked: {e}")))?
}

/// Build a `ProducerRecord` around an already-connected local producer
/// descriptor (the `-S` inherited-socket form) and drive it to `Ready`.
pub async fn establish_local_inherited(socket: UnixStream, segid: String) -> BridgeResult<ProducerRecord> {
    tokio::task::spawn_blocking(move || {
        let segment = Segment::create(std::process::id(), DEFAULT_W, DEFAULT_H, true)?;
        let mut pr = ProducerRecord::new_connected(segment, socket, Vec::new(), segid);
        drive_to_ready(&mut pr)?;
        Ok(pr)
    })
    .await
    .map_err(|e| BridgeError::ArgumentInvalid(format!("local inherited task panicked: {e}")))?
}

/// Run the per-connection accept loop for **listen** mode: ignore
/// `SIGPIPE`/reap via ignored `SIGCHLD`, bind, and dispatch each accepted
/// connection through the isolator. Stops after one connection under
/// `IsolationPolicy::Single`, bridging it in-process first.
pub async fn run_listen(
    bind_host: &str,
    port: u16,
    policy: IsolationPolicy,
    exec: Option<&[String]>,
    config: &Config,
) -> BridgeResult<()> {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    if policy == IsolationPolicy::Fork {
        Isolator::ignore_sigchld();
    }
    let isolator = Isolator::new(policy)?;

    let addr = format!("{bind_host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| BridgeError::BindFailed { addr: addr.clone(), source })?;
    info!(%addr, "listening for remote authenticated connections");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "accepted remote connection");

        if let Some(argv) = exec {
            let fd = stream.as_raw_fd();
            std::mem::forget(stream);
            isolator.dispatch_exec(fd, argv)?;
            continue;
        }

        match policy {
            IsolationPolicy::Fork => {
                let fd = stream.as_raw_fd();
                // Keep the std socket alive across the fork boundary:
                // `TcpStream` would close it on drop before the child
                // re-execs.
                std::mem::forget(stream);
                isolator.dispatch_fork(fd)?;
            }
            IsolationPolicy::Single => {
                let mut session = stream;
                if let Err(e) = serve_pulled_session(&mut session, config).await {
                    warn!(error = %e, "single-connection session ended with error");
                }
                debug_assert_eq!(isolator.dispatch_single(), DispatchOutcome::StopAccepting);
                return Ok(());
            }
        }
    }
}

/// The re-exec'd `FORK` child's entry point: adopt the inherited remote
/// session fd, bridge it to whatever local producer connects at
/// `config.connpath` (or the default connpoint if unset).
pub async fn serve_inherited_remote_session(fd: RawFd, config: &Config) -> BridgeResult<()> {
    let mut session = adopt_inherited_tcp_session(fd)?;
    serve_pulled_session(&mut session, config).await
}

/// The local connpoint **listen**/**outbound** pull directions bind when no
/// explicit connpoint is given: `config.connpath` (the `ARCAN_CONNPATH`
/// equivalent) if set, else a fixed path under the state directory.
pub fn default_connpoint(config: &Config) -> String {
    config
        .connpath
        .clone()
        .unwrap_or_else(|| config.paths().state_dir().join("netbridge.sock").to_string_lossy().into_owned())
}

/// "Pull" direction shared by **listen** mode's single-connection path and
/// the `FORK` child: an already-established remote session is bridged to a
/// local producer that connects at the configured connpoint.
async fn serve_pulled_session(session: &mut TcpStream, config: &Config) -> BridgeResult<()> {
    let connpoint = default_connpoint(config);
    let mut pr = establish_local_listener(connpoint.clone()).await?;
    bridge_session(&mut pr, &connpoint, true, session).await
}

/// Bridge one producer record to one established session until either side
/// hangs up, pumping outbound events continuously. This is the steady-state
/// loop every mode eventually hands its `(PR, session)` pair to.
pub async fn bridge_session(
    pr: &mut ProducerRecord,
    segment_tag: &str,
    with_audio: bool,
    session: &mut TcpStream,
) -> BridgeResult<()> {
    let mut read_buf = [0u8; 4096];
    loop {
        if !pr.is_alive() {
            return Ok(());
        }

        pump_outbound_events(pr, segment_tag, session).await?;
        push_video_frame(pr, segment_tag, with_audio, session).await?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(16)) => {}
            read_result = session.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => {
                        warn!(segment_tag, "remote session hung up");
                        return Ok(());
                    }
                    Ok(n) => {
                        let _ = pr.enqueue_external(read_buf[..n].to_vec());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_outbound_target_without_tag_uses_literal_host_and_default_port() {
        let config = Config::defaults().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (host, port) = resolve_outbound_target("example.com", None, &config, dir.path()).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, config.default_port);
    }

    #[test]
    fn resolve_outbound_target_with_explicit_port_overrides_default() {
        let config = Config::defaults().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (_, port) = resolve_outbound_target("example.com", Some(9000), &config, dir.path()).unwrap();
        assert_eq!(port, 9000);
    }

    #[test]
    fn resolve_outbound_target_with_tag_looks_up_keystore() {
        let config = Config::defaults().unwrap();
        let dir = tempfile::tempdir().unwrap();
        {
            let ks = Keystore::open(dir.path()).unwrap();
            ks.register("alice", "alice.example.com", 7000, vec![]).unwrap();
        }
        let (host, port) =
            resolve_outbound_target("alice@ignored", None, &config, dir.path()).unwrap();
        assert_eq!(host, "alice.example.com");
        assert_eq!(port, 7000);
    }

    #[test]
    fn resolve_outbound_target_with_unknown_tag_errors() {
        let config = Config::defaults().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = resolve_outbound_target("ghost@ignored", None, &config, dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn event_to_json_round_trips_the_shape() {
        let event = Event::External(vec![1, 2, 3]);
        let json = one_event_as_json(&event);
        assert_eq!(json["kind"], "external");
        assert_eq!(json["payload"], serde_json::json!([1, 2, 3]));
    }
}
