//! Error kinds for the injection engine and socket c/r engine (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tracee {0} no longer exists")]
    VictimGone(libc::pid_t),

    #[error("ptrace not authorised for pid {0}")]
    PtraceDenied(libc::pid_t),

    #[error("waitpid returned a pid other than the one we are tracking")]
    Busy,

    #[error("injection syscall failed: {0}")]
    InjectionFailed(&'static str),

    #[error("unexpected stop while signals were blocked: {0:?}")]
    UnexpectedStop(crate::ptrace::StopKind),

    #[error("netlink protocol error: {0}")]
    NetlinkProtocol(String),

    #[error("socket inode {0} was not collected before dump")]
    UncollectedSocket(u32),

    #[error("TCP listener has pending in-flight connections, unsupported")]
    InFlightOnListen,

    #[error("UNIX established socket {0} has no icons entry for its peer")]
    DanglingInflight(u32),

    #[error("unsupported socket state: {0}")]
    UnsupportedState(&'static str),

    #[error("short read/write on image stream: wanted {want}, got {got}")]
    Truncated { want: usize, got: usize },

    #[error("rendezvous connect did not succeed after {0} attempts")]
    RendezvousTimeout(u32),

    #[error("failed to switch network namespace: {0}")]
    NamespaceSwitch(String),

    #[error("cure encountered {0} failure(s) tearing down the parasite: {1}")]
    CureFailed(usize, String),

    #[error(transparent)]
    Nix(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
