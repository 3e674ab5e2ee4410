//! Namespace switcher (spec §6 collaborator): `switch_ns`/`restore_ns`
//! around `setns(2)`, used when the victim's tsock must be created inside
//! the victim's own network namespace (spec §4.5).

use crate::error::{Error, Result};
use libc::pid_t;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::unix::io::AsRawFd;

pub struct SavedNs {
    original: File,
}

/// Switch the calling thread into `pid`'s network namespace, returning a
/// handle that can restore the original one.
pub fn switch_ns(pid: pid_t) -> Result<SavedNs> {
    let original = File::open("/proc/self/ns/net")?;
    let target = File::open(format!("/proc/{}/ns/net", pid))?;
    setns(target.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::NamespaceSwitch(format!("setns into pid {}: {}", pid, e)))?;
    Ok(SavedNs { original })
}

pub fn restore_ns(saved: SavedNs) -> Result<()> {
    setns(saved.original.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::NamespaceSwitch(format!("restoring original netns: {}", e)))
}

pub fn same_net_ns(pid: pid_t) -> Result<bool> {
    let mine = std::fs::read_link("/proc/self/ns/net")?;
    let theirs = std::fs::read_link(format!("/proc/{}/ns/net", pid))?;
    Ok(mine == theirs)
}
