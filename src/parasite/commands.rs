//! The parasite command set (spec §4.5) and the tagged union living at
//! `addr_args` (design note "Command argument union"): one discriminator
//! (`CommandCode`, mirrored by `*addr_cmd`) and one header struct per
//! command, each `#[repr(C)]` so its layout matches what the injected blob
//! expects. Commands whose payload has a variable-length tail (group
//! vectors, iovec arrays, fd lists) write/read that tail directly after
//! the fixed header within the same buffer.

use crate::config::SIGNAL_MAX;

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandCode {
    Init = 0,
    InitThread = 1,
    FiniThread = 2,
    Fini = 3,
    CfgLog = 4,
    DumpSigacts = 5,
    DumpItimers = 6,
    DumpCreds = 7,
    DumpTty = 8,
    DumpMisc = 9,
    DumpThread = 10,
    DumpPages = 11,
    DrainFds = 12,
    GetProcFd = 13,
}

/// Abstract-namespace UNIX socket address, sized for `sockaddr_un::sun_path`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct AbstractAddr {
    pub path: [u8; 108],
    pub len: u32,
}

impl AbstractAddr {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut path = [0u8; 108];
        let n = bytes.len().min(path.len());
        path[..n].copy_from_slice(&bytes[..n]);
        AbstractAddr { path, len: n as u32 }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct InitArgs {
    pub h_addr: AbstractAddr,
    pub p_addr: AbstractAddr,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct CfgLogArgs {
    pub level: u8,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct DumpItimersArgs {
    pub real: libc::itimerval,
    pub virt: libc::itimerval,
    pub prof: libc::itimerval,
}

/// One dumped `sigaction` entry. We don't use `libc::sigaction` directly:
/// its `sa_sigaction` field is a function pointer union that isn't
/// meaningfully `Copy`-safe to zero-init across the wire in the same way a
/// plain record is, so we carry the fields the image format actually wants.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct SigactionRecord {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct DumpSigactsArgs {
    pub actions: [SigactionRecord; SIGNAL_MAX],
}

impl Default for DumpSigactsArgs {
    fn default() -> Self {
        DumpSigactsArgs {
            actions: [SigactionRecord::default(); SIGNAL_MAX],
        }
    }
}

/// Fixed header of `DUMP_CREDS`; the supplementary-group vector
/// (`ngroups` entries of `u32`) follows immediately in the same buffer, and
/// the controller may read it straight out of `addr_args` without copying
/// provided no further command runs first (spec §4.5).
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct DumpCredsArgs {
    pub securebits: u32,
    pub ngroups: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct DumpThreadArgs {
    pub blocked_sigmask: u64,
    pub tid: i32,
    pub tid_address: u64,
    /// x86_64 TLS: fs_base, gs_base.
    pub fs_base: u64,
    pub gs_base: u64,
}

/// Fixed header of `DUMPPAGES`; `nr` `libc::iovec` entries follow. `off`
/// is the number of iovec segments already consumed by a prior call in the
/// same dump, used by the parasite to index into its view of the shared
/// iovec array (spec §4.6).
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct DumpPagesArgs {
    pub nr: u32,
    pub off: u32,
}

/// Fixed header of `DRAIN_FDS`; `nr` `i32` fds follow.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct DrainFdsArgs {
    pub nr: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abstract_addr_truncates_to_sun_path() {
        let a = AbstractAddr::from_bytes(&[0u8; 200]);
        assert_eq!(a.len, 108);
    }

    #[test]
    fn sigacts_args_default_is_zeroed() {
        let a = DumpSigactsArgs::default();
        assert_eq!(a.actions.len(), SIGNAL_MAX);
        assert_eq!(a.actions[0].handler, 0);
    }
}
