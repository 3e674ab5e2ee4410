//! Parasite injection engine and socket checkpoint/restore core.
//!
//! Two tightly coupled subsystems: a ptrace-based parasite injector that
//! extracts in-process victim state (`ptrace`, `registers`, `remote_ptr`,
//! `remote_syscall`, `victim`, `parasite`, `page_dump`), and a socket state
//! engine that collects and reconstructs UNIX/IPv4 sockets via netlink
//! sock-diag (`netlink`, `sockets`).

pub mod config;
pub mod error;
pub mod image;
pub mod loglevel;
pub mod netlink;
pub mod netns;
pub mod page_dump;
pub mod page_xfer;
pub mod parasite;
pub mod ptrace;
pub mod registers;
pub mod remote_ptr;
pub mod remote_syscall;
pub mod reopen;
pub mod sockets;
pub mod victim;

pub use error::{Error, Result};
