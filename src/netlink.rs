//! Low-level `NETLINK_SOCK_DIAG` wire helpers (spec §4.7, §6): socket
//! creation, a DUMP-request send, and an attribute-parsing iterator shared
//! by the UNIX and INET collectors.

use crate::error::{Error, Result};
use std::mem::size_of;
use std::os::unix::io::RawFd;

/// `NETLINK_SOCK_DIAG`, falling back to `NETLINK_INET_DIAG`'s numeric value
/// on kernels whose headers predate the generic sock-diag family (spec §6).
pub const NETLINK_SOCK_DIAG: i32 = 4;
/// Numeric value used when the OS headers don't expose the constant
/// (spec §6).
pub const SOCK_DIAG_BY_FAMILY: u16 = 20;

const NLM_F_REQUEST: u16 = 1;
const NLM_F_DUMP: u16 = 0x300;
const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;
const NLMSG_ALIGNTO: usize = 4;

fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

#[repr(C)]
#[derive(Copy, Clone)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

/// One parsed rtattr: its type and the raw payload bytes.
pub struct RtAttr<'a> {
    pub kind: u16,
    pub payload: &'a [u8],
}

pub fn open_sock_diag() -> Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_SOCK_DIAG) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(fd)
}

/// Send a `SOCK_DIAG_BY_FAMILY` DUMP request whose payload is the raw,
/// already-encoded family-specific request struct (`unix_diag_req` or
/// `inet_diag_req_v2`, spec §4.7).
pub fn send_dump_request(fd: RawFd, payload: &[u8]) -> Result<()> {
    let total_len = size_of::<NlMsgHdr>() + payload.len();
    let mut buf = vec![0u8; nlmsg_align(total_len)];

    let hdr = NlMsgHdr {
        nlmsg_len: total_len as u32,
        nlmsg_type: SOCK_DIAG_BY_FAMILY,
        nlmsg_flags: NLM_F_REQUEST | NLM_F_DUMP,
        nlmsg_seq: 1,
        nlmsg_pid: 0,
    };
    unsafe {
        std::ptr::copy_nonoverlapping(
            &hdr as *const NlMsgHdr as *const u8,
            buf.as_mut_ptr(),
            size_of::<NlMsgHdr>(),
        );
    }
    buf[size_of::<NlMsgHdr>()..size_of::<NlMsgHdr>() + payload.len()].copy_from_slice(payload);

    let ret = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// One dump message: the type-specific payload (everything after the
/// `nlmsghdr`, minus its own fixed-size header handled by the caller).
pub struct DumpMessage {
    pub body: Vec<u8>,
}

/// Read netlink messages from `fd` until `NLMSG_DONE`, retrying on `EINTR`
/// (spec §7 "Locally recovered"), and calling `on_message` with each
/// message's body (the bytes after the `nlmsghdr`).
pub fn drain_dump(fd: RawFd, mut on_message: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = loop {
            let ret = unsafe {
                libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            break ret as usize;
        };
        if n == 0 {
            return Ok(());
        }

        let mut offset = 0;
        let mut done = false;
        while offset + size_of::<NlMsgHdr>() <= n {
            let hdr = unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const NlMsgHdr) };
            let msg_len = hdr.nlmsg_len as usize;
            if msg_len < size_of::<NlMsgHdr>() || offset + msg_len > n {
                return Err(Error::NetlinkProtocol("truncated netlink message".into()));
            }

            if hdr.nlmsg_type == NLMSG_DONE {
                done = true;
                break;
            }
            if hdr.nlmsg_type == NLMSG_ERROR {
                return Err(Error::NetlinkProtocol("netlink NLMSG_ERROR".into()));
            }

            let body = &buf[offset + size_of::<NlMsgHdr>()..offset + msg_len];
            on_message(body)?;

            offset += nlmsg_align(msg_len);
        }
        if done {
            return Ok(());
        }
    }
}

/// Parse a sequence of `rtattr` records following a fixed-size message
/// header (spec §4.7).
pub fn parse_rtattrs(mut data: &[u8]) -> Vec<RtAttr<'_>> {
    const RTA_HDR_LEN: usize = 4;
    let mut out = Vec::new();
    while data.len() >= RTA_HDR_LEN {
        let rta_len = u16::from_ne_bytes([data[0], data[1]]) as usize;
        let rta_type = u16::from_ne_bytes([data[2], data[3]]);
        if rta_len < RTA_HDR_LEN || rta_len > data.len() {
            break;
        }
        out.push(RtAttr {
            kind: rta_type,
            payload: &data[RTA_HDR_LEN..rta_len],
        });
        let aligned = nlmsg_align(rta_len);
        if aligned >= data.len() {
            break;
        }
        data = &data[aligned..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtattr_bytes(kind: u16, payload: &[u8]) -> Vec<u8> {
        let len = 4 + payload.len();
        let mut v = Vec::new();
        v.extend_from_slice(&(len as u16).to_ne_bytes());
        v.extend_from_slice(&kind.to_ne_bytes());
        v.extend_from_slice(payload);
        while v.len() % NLMSG_ALIGNTO != 0 {
            v.push(0);
        }
        v
    }

    #[test]
    fn parses_two_consecutive_rtattrs() {
        let mut buf = rtattr_bytes(1, &[0xAA, 0xBB]);
        buf.extend(rtattr_bytes(2, &[1, 2, 3, 4]));
        let attrs = parse_rtattrs(&buf);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].kind, 1);
        assert_eq!(attrs[0].payload, &[0xAA, 0xBB]);
        assert_eq!(attrs[1].kind, 2);
        assert_eq!(attrs[1].payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn nlmsg_align_rounds_to_four() {
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(4), 4);
        assert_eq!(nlmsg_align(5), 8);
    }
}
