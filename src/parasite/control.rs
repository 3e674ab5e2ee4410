//! Parasite control channel (spec §4.5): command dispatch, the transport
//! socket ("tsock") used for fd/log passing, and thread enrolment.

use crate::error::{Error, Result};
use crate::loglevel::LogLevel;
use crate::parasite::commands::{AbstractAddr, CfgLogArgs, CommandCode, InitArgs};
use crate::ptrace;
use crate::remote_syscall;
use crate::victim::control_block::VictimControlBlock;
use lazy_static::lazy_static;
use libc::pid_t;
use log::{debug, warn};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// Build a `sockaddr_un` for an abstract-namespace address whose bytes
/// (including the leading NUL) are `addr`.
fn abstract_sockaddr_un(addr: &[u8]) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let n = addr.len().min(sun.sun_path.len());
    for (slot, byte) in sun.sun_path.iter_mut().zip(addr[..n].iter()) {
        *slot = *byte as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + n) as libc::socklen_t;
    (sun, len)
}

fn bind_abstract(fd: RawFd, addr: &[u8]) -> Result<()> {
    let (sun, len) = abstract_sockaddr_un(addr);
    let ret = unsafe { libc::bind(fd, &sun as *const _ as *const libc::sockaddr, len) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn connect_abstract(fd: RawFd, addr: &[u8]) -> Result<()> {
    let (sun, len) = abstract_sockaddr_un(addr);
    let ret = unsafe { libc::connect(fd, &sun as *const _ as *const libc::sockaddr, len) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

lazy_static! {
    /// The process-wide tsock, reused across victims (spec §4.5 "Static
    /// tsock"). Modelled as an explicit owned slot rather than a hidden
    /// module global precisely because it must be disconnected on every
    /// reacquisition (design note "Static tsock").
    static ref GLOBAL_TSOCK: Mutex<Option<RawFd>> = Mutex::new(None);
}

/// Derive the abstract-namespace tsock address bytes for one side
/// ("h" controller, "p" parasite) of a given pid (spec §4.5, §6).
pub fn tsock_addr(prefix: &str, side: char, pid: pid_t) -> Vec<u8> {
    // Leading NUL marks the abstract namespace (spec §6).
    let mut v = vec![0u8];
    v.extend_from_slice(format!("{}{}-{}", prefix, side, pid).as_bytes());
    v
}

fn disconnect(fd: RawFd) -> Result<()> {
    // Linux leaves a connected datagram socket rejecting once its peer
    // dies; reconnecting to AF_UNSPEC clears that (spec §4.5).
    let sa = libc::sockaddr {
        sa_family: libc::AF_UNSPEC as libc::sa_family_t,
        sa_data: [0; 14],
    };
    let ret = unsafe {
        libc::connect(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr>() as libc::socklen_t,
        )
    };
    // ENOTCONN/EINVAL here just mean there was nothing to disconnect.
    if ret != 0 {
        debug!("tsock disconnect returned {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Acquire the process-wide tsock, creating it the first time and
/// disconnecting it on every subsequent reuse.
fn acquire_tsock() -> Result<RawFd> {
    let mut slot = GLOBAL_TSOCK.lock().expect("tsock mutex poisoned");
    if let Some(fd) = *slot {
        disconnect(fd)?;
        return Ok(fd);
    }
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    *slot = Some(fd);
    Ok(fd)
}

/// `PARASITE_CMD_INIT`: create/reuse the tsock, bind the controller side,
/// send INIT with both abstract addresses, then connect to the parasite
/// side (spec §4.5).
pub fn init(vcb: &mut VictimControlBlock, tsock_prefix: &str, same_netns: bool) -> Result<()> {
    let fd = if same_netns {
        acquire_tsock()?
    } else {
        let saved = crate::netns::switch_ns(vcb.pid)?;
        let result = acquire_tsock();
        crate::netns::restore_ns(saved)?;
        result?
    };

    let h_bytes = tsock_addr(tsock_prefix, 'h', vcb.pid);
    let p_bytes = tsock_addr(tsock_prefix, 'p', vcb.pid);

    bind_abstract(fd, &h_bytes)?;

    let args = InitArgs {
        h_addr: AbstractAddr::from_bytes(&h_bytes),
        p_addr: AbstractAddr::from_bytes(&p_bytes),
    };
    dispatch(vcb, CommandCode::Init, Some(&args))?;

    connect_abstract(fd, &p_bytes)?;

    vcb.tsock = Some(fd);
    Ok(())
}

pub fn cfg_log(vcb: &mut VictimControlBlock, level: LogLevel) -> Result<()> {
    if let Some(fd) = vcb.tsock {
        send_fd(fd, libc::STDERR_FILENO)?;
    }
    let args = CfgLogArgs {
        level: level.as_wire(),
    };
    dispatch(vcb, CommandCode::CfgLog, Some(&args)).map(|_| ())
}

/// `PARASITE_CMD_INIT_THREAD` for one non-leader thread (spec §4.5
/// "Thread enrolment").
pub fn init_thread(vcb: &mut VictimControlBlock, tid: pid_t) -> Result<()> {
    dispatch_for_tid(vcb, tid, CommandCode::InitThread, None::<&()>).map(|_| ())
}

/// `PARASITE_CMD_FINI_THREAD`, best-effort on rollback: "no such thread"
/// (`ESRCH`) is expected if init aborted partway and must not stop the
/// fini loop (spec §4.5).
pub fn fini_thread(vcb: &mut VictimControlBlock, tid: pid_t) {
    match dispatch_for_tid(vcb, tid, CommandCode::FiniThread, None::<&()>) {
        Ok(_) => {}
        Err(Error::VictimGone(_)) => {
            debug!("fini_thread({}) found no such thread, tolerating", tid);
        }
        Err(e) => warn!("fini_thread({}) failed: {}", tid, e),
    }
}

pub fn fini(vcb: &mut VictimControlBlock) -> Result<()> {
    dispatch(vcb, CommandCode::Fini, None::<&()>).map(|_| ())
}

/// Dispatch one command on the thread the control block was built for
/// (spec §4.5): write the code, optionally populate args, resume at the
/// parasite entry point, and run to the terminating `int3`.
pub fn dispatch<A>(vcb: &mut VictimControlBlock, code: CommandCode, args: Option<&A>) -> Result<i64> {
    dispatch_for_tid(vcb, vcb.pid, code, args)
}

pub fn dispatch_for_tid<A>(
    vcb: &mut VictimControlBlock,
    tid: pid_t,
    code: CommandCode,
    args: Option<&A>,
) -> Result<i64> {
    let addr_cmd = vcb
        .addr_cmd()
        .ok_or(Error::InjectionFailed("parasite not mapped: no addr_cmd"))?;
    let addr_args = vcb
        .addr_args()
        .ok_or(Error::InjectionFailed("parasite not mapped: no addr_args"))?;

    unsafe {
        std::ptr::write(addr_cmd, code as u32);
        if let Some(a) = args {
            std::ptr::write(addr_args as *mut A, std::ptr::read(a as *const A));
        }
    }

    // Resume the thread at the parasite entry point and run to its
    // terminating int3; signal-rewind is handled transparently by the
    // shared wait loop.
    let mut regs = vcb.orig_regs;
    regs.set_ip(vcb.parasite_ip.addr());
    ptrace::setregs(tid, &regs)?;
    remote_syscall::drive_to_completion(tid, &mut vcb.orig_regs, vcb.signals_blocked)
}

/// Dispatch a command whose payload is a fixed header followed by a
/// variable-length tail living in the same buffer (spec §4.5: `DRAIN_FDS`'s
/// fd list, `DUMPPAGES`'s iovec array). `tail` is written immediately after
/// `header` and must fit within `vcb.args_buf_size`.
pub fn dispatch_with_tail<H>(
    vcb: &mut VictimControlBlock,
    tid: pid_t,
    code: CommandCode,
    header: &H,
    tail: &[u8],
) -> Result<i64> {
    let addr_cmd = vcb
        .addr_cmd()
        .ok_or(Error::InjectionFailed("parasite not mapped: no addr_cmd"))?;
    let addr_args = vcb
        .addr_args()
        .ok_or(Error::InjectionFailed("parasite not mapped: no addr_args"))?;

    let header_size = std::mem::size_of::<H>();
    if header_size + tail.len() > vcb.args_buf_size {
        return Err(Error::InjectionFailed("command payload exceeds args buffer"));
    }

    unsafe {
        std::ptr::write(addr_cmd, code as u32);
        std::ptr::write(addr_args as *mut H, std::ptr::read(header as *const H));
        if !tail.is_empty() {
            std::ptr::copy_nonoverlapping(tail.as_ptr(), addr_args.add(header_size), tail.len());
        }
    }

    let mut regs = vcb.orig_regs;
    regs.set_ip(vcb.parasite_ip.addr());
    ptrace::setregs(tid, &regs)?;
    remote_syscall::drive_to_completion(tid, &mut vcb.orig_regs, vcb.signals_blocked)
}

/// `cmsghdr` space for exactly one `RawFd`, rounded up the way
/// `CMSG_SPACE` does, sized by hand rather than via a nix-version-specific
/// `cmsg_space!` macro (same fallback-to-`libc` posture as elsewhere in
/// this module).
const CMSG_FD_SPACE: usize = {
    let len = std::mem::size_of::<libc::cmsghdr>() + std::mem::size_of::<RawFd>();
    let align = std::mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
};

/// Send an fd to the parasite over tsock via `SCM_RIGHTS` (spec §4.5).
pub fn send_fd(tsock: RawFd, fd: RawFd) -> Result<()> {
    let mut iobuf = [0u8];
    let mut iov = libc::iovec {
        iov_base: iobuf.as_mut_ptr() as *mut libc::c_void,
        iov_len: iobuf.len(),
    };
    let mut cmsgbuf = [0u8; CMSG_FD_SPACE];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsgbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsgbuf.len();

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as libc::size_t;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
        msg.msg_controllen = libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) as libc::size_t;
    }

    let ret = unsafe { libc::sendmsg(tsock, &msg, 0) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Receive a single fd sent by the parasite (`DRAIN_FDS`/`GET_PROC_FD`,
/// spec §4.5).
pub fn recv_fd(tsock: RawFd) -> Result<RawFd> {
    let mut iobuf = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: iobuf.as_mut_ptr() as *mut libc::c_void,
        iov_len: iobuf.len(),
    };
    let mut cmsgbuf = [0u8; CMSG_FD_SPACE];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsgbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsgbuf.len();

    let ret = unsafe { libc::recvmsg(tsock, &mut msg, 0) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if !cmsg.is_null() && (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let fd = std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd);
            return Ok(fd);
        }
    }
    Err(Error::InjectionFailed("no fd received over tsock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsock_addr_has_leading_nul() {
        let a = tsock_addr("crtools-pr-", 'h', 42);
        assert_eq!(a[0], 0);
        assert_eq!(&a[1..], b"crtools-pr-h-42");
    }
}
