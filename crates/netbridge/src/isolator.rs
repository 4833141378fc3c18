//! Per-Connection Isolator: `SINGLE` (in-process, debug-only, one producer
//! at a time) and `FORK` (one child per connection) policies.
//!
//! Long-running per-connection workers are isolated via `std::process::
//! Command` re-exec rather than a bare `libc::fork()`, which is unsound to
//! call directly inside a multi-threaded async runtime. The connected
//! socket crosses the re-exec via
//! descriptor inheritance (clearing close-on-exec) plus an environment
//! variable carrying the descriptor number, mirroring the `-S fd`
//! inherited-socket CLI form this same crate already accepts.

use std::env;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::{Child, Command};

use crate::error::BridgeResult;

/// Environment variable the re-exec'd child reads to find its inherited
/// connection descriptor.
pub const CHILD_FD_VAR: &str = "NETBRIDGE_CHILD_FD";
/// Marker environment variable distinguishing a re-exec'd per-connection
/// child from the top-level dispatcher process.
pub const CHILD_MODE_VAR: &str = "NETBRIDGE_CHILD_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationPolicy {
    Single,
    Fork,
}

impl IsolationPolicy {
    pub fn from_single_flag(single: bool) -> Self {
        if single {
            IsolationPolicy::Single
        } else {
            IsolationPolicy::Fork
        }
    }
}

/// Whether the dispatcher should keep accepting after handling one
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    KeepAccepting,
    StopAccepting,
}

pub struct Isolator {
    policy: IsolationPolicy,
    exe_path: PathBuf,
}

impl Isolator {
    pub fn new(policy: IsolationPolicy) -> std::io::Result<Self> {
        Ok(Self {
            policy,
            exe_path: env::current_exe()?,
        })
    }

    pub fn policy(&self) -> IsolationPolicy {
        self.policy
    }

    /// Ignore `SIGCHLD` so forked children are reaped by the kernel without
    /// an explicit `waitpid`. Must be called once, before the first
    /// `dispatch_fork`.
    pub fn ignore_sigchld() {
        unsafe {
            libc::signal(libc::SIGCHLD, libc::SIG_IGN);
        }
    }

    /// `FORK` policy: re-exec the current binary, handing it `conn_fd` by
    /// descriptor inheritance. The parent does not wait on the child; with
    /// `SIGCHLD` ignored the kernel reaps it directly. Returns
    /// `DispatchOutcome::KeepAccepting`.
    pub fn dispatch_fork(&self, conn_fd: RawFd) -> BridgeResult<DispatchOutcome> {
        clear_close_on_exec(conn_fd)?;

        let child = Command::new(&self.exe_path)
            .env(CHILD_MODE_VAR, "1")
            .env(CHILD_FD_VAR, conn_fd.to_string())
            .spawn()?;

        // Detach: we don't wait() on it, SIGCHLD is ignored, the kernel
        // reaps it when it exits.
        forget_child(child);

        Ok(DispatchOutcome::KeepAccepting)
    }

    /// `SINGLE` policy: the caller runs the bridge in-process against
    /// `conn_fd` directly (no re-exec) and then stops accepting further
    /// connections.
    pub fn dispatch_single(&self) -> DispatchOutcome {
        DispatchOutcome::StopAccepting
    }

    /// Exec-on-connect: run `argv[0]` (with the rest of `argv` as its
    /// arguments) against the inherited connection instead of re-execing
    /// this binary. Always forks (the exec target, not this process, owns
    /// the connection from here on), regardless of `self.policy`.
    pub fn dispatch_exec(&self, conn_fd: RawFd, argv: &[String]) -> BridgeResult<DispatchOutcome> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| crate::error::BridgeError::ArgumentInvalid("-exec needs a binary".into()))?;

        clear_close_on_exec(conn_fd)?;

        let child = Command::new(program)
            .args(args)
            .env(CHILD_FD_VAR, conn_fd.to_string())
            .spawn()?;

        forget_child(child);
        Ok(DispatchOutcome::KeepAccepting)
    }
}

fn forget_child(child: Child) {
    std::mem::drop(child);
}

fn clear_close_on_exec(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// True when this process was re-exec'd as a per-connection FORK child
/// (`NETBRIDGE_CHILD_MODE=1`), and the descriptor it should serve.
pub fn child_mode_fd() -> Option<RawFd> {
    if env::var(CHILD_MODE_VAR).ok().as_deref() != Some("1") {
        return None;
    }
    env::var(CHILD_FD_VAR).ok()?.parse().ok()
}
