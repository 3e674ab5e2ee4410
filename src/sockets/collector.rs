//! Socket collector (spec §4.7): three `SOCK_DIAG_BY_FAMILY` dump requests
//! (UNIX all-states, INET TCP LISTEN, INET UDP all-states), each drained to
//! completion before the next, feeding the inode-keyed `SocketTables`.

use crate::error::Result;
use crate::netlink::{self, parse_rtattrs};
use crate::sockets::model::{
    InetProto, InetSkDesc, InetState, InetType, SocketTables, UnixSkDesc, UnixState, UnixType,
};
use log::warn;
use std::mem::size_of;
use std::os::unix::io::RawFd;

const UNIX_DIAG_NAME: u16 = 0;
const UNIX_DIAG_VFS: u16 = 1;
const UNIX_DIAG_PEER: u16 = 2;
const UNIX_DIAG_ICONS: u16 = 3;
const UNIX_DIAG_RQLEN: u16 = 4;

const UDIAG_SHOW_NAME: u32 = 1 << 0;
const UDIAG_SHOW_VFS: u32 = 1 << 1;
const UDIAG_SHOW_PEER: u32 = 1 << 2;
const UDIAG_SHOW_ICONS: u32 = 1 << 3;
const UDIAG_SHOW_RQLEN: u32 = 1 << 4;

const SS_UNCONNECTED: u8 = 1;
const SS_CONNECTING: u8 = 2;
const SS_CONNECTED: u8 = 3;
const SS_DISCONNECTING: u8 = 4;

const TCP_LISTEN: u8 = 10;

#[repr(C)]
#[derive(Copy, Clone)]
struct UnixDiagReq {
    sdiag_family: u8,
    sdiag_protocol: u8,
    pad: u16,
    udiag_states: u32,
    udiag_ino: u32,
    udiag_cookie: [u32; 2],
    udiag_show: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct UnixDiagMsg {
    udiag_family: u8,
    udiag_type: u8,
    udiag_state: u8,
    pad: u8,
    udiag_ino: u32,
    udiag_cookie: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone)]
struct UnixDiagVfs {
    udiag_vfs_ino: u32,
    udiag_vfs_dev: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct InetDiagSockId {
    idiag_sport: u16,
    idiag_dport: u16,
    idiag_src: [u32; 4],
    idiag_dst: [u32; 4],
    idiag_if: u32,
    idiag_cookie: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone)]
struct InetDiagReqV2 {
    sdiag_family: u8,
    sdiag_protocol: u8,
    idiag_ext: u8,
    pad: u8,
    idiag_states: u32,
    id: InetDiagSockId,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct InetDiagMsg {
    idiag_family: u8,
    idiag_state: u8,
    idiag_timer: u8,
    idiag_retrans: u8,
    id: InetDiagSockId,
    idiag_expires: u32,
    idiag_rqueue: u32,
    idiag_wqueue: u32,
    idiag_uid: u32,
    idiag_inode: u32,
}

unsafe fn as_bytes<T: Copy>(v: &T) -> &[u8] {
    std::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>())
}

fn unix_diag_msg(body: &[u8]) -> Option<(&UnixDiagMsg, &[u8])> {
    if body.len() < size_of::<UnixDiagMsg>() {
        return None;
    }
    let msg = unsafe { &*(body.as_ptr() as *const UnixDiagMsg) };
    Some((msg, &body[size_of::<UnixDiagMsg>()..]))
}

fn inet_diag_msg(body: &[u8]) -> Option<(&InetDiagMsg, &[u8])> {
    if body.len() < size_of::<InetDiagMsg>() {
        return None;
    }
    let msg = unsafe { &*(body.as_ptr() as *const InetDiagMsg) };
    Some((msg, &body[size_of::<InetDiagMsg>()..]))
}

fn unix_state(ss_state: u8) -> UnixState {
    match ss_state {
        SS_UNCONNECTED => UnixState::Unconnected,
        SS_CONNECTING | SS_CONNECTED => UnixState::Established,
        SS_DISCONNECTING => UnixState::Closing,
        10 => UnixState::Listen, // SS_LISTENING isn't in the SS_* enum; diag reports TCP_LISTEN(10) for listeners
        _ => UnixState::Unconnected,
    }
}

/// Relative bind paths are unsupported and silently skipped (spec §4.7,
/// grounded on `sockets.c`'s `unix_collect_one`, which checks the first
/// byte of `udiag_name` against `/`). An abstract name (leading NUL) is
/// also not a filesystem path and is kept as-is.
fn parse_unix_name(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.is_empty() {
        return None;
    }
    if raw[0] == 0 {
        return Some(raw.to_vec());
    }
    if raw[0] != b'/' {
        warn!("relative UNIX bind path, skipping name");
        return None;
    }
    Some(raw.to_vec())
}

/// `stat()`s a listening socket's bound path and compares `(dev, ino)`
/// against `udiag_vfs`; a mismatch means the file was unlinked/superseded
/// and the name is dropped while the socket descriptor is kept (spec §4.7).
fn validate_name_against_vfs(name: &[u8], vfs: &UnixDiagVfs) -> bool {
    if name.first() == Some(&0) {
        return true; // abstract names have no backing inode to validate
    }
    let path = match std::ffi::CString::new(name.to_vec()) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::stat(path.as_ptr(), &mut st) };
    if ret != 0 {
        return false;
    }
    st.st_ino == vfs.udiag_vfs_ino as u64 && st.st_dev == vfs.udiag_vfs_dev as u64
}

fn parse_unix_message(body: &[u8], tables: &mut SocketTables) {
    let (msg, rest) = match unix_diag_msg(body) {
        Some(v) => v,
        None => return,
    };
    let attrs = parse_rtattrs(rest);

    let mut name: Option<Vec<u8>> = None;
    let mut vfs: Option<UnixDiagVfs> = None;
    let mut peer_ino = None;
    let mut icons = Vec::new();
    let mut rqlen = 0u32;
    let mut wqlen = 0u32;

    for attr in &attrs {
        match attr.kind {
            UNIX_DIAG_NAME => name = parse_unix_name(attr.payload),
            UNIX_DIAG_VFS if attr.payload.len() >= size_of::<UnixDiagVfs>() => {
                vfs = Some(unsafe { *(attr.payload.as_ptr() as *const UnixDiagVfs) });
            }
            UNIX_DIAG_PEER if attr.payload.len() >= 4 => {
                peer_ino = Some(u32::from_ne_bytes(attr.payload[..4].try_into().unwrap()));
            }
            UNIX_DIAG_ICONS => {
                icons = attr
                    .payload
                    .chunks_exact(4)
                    .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
                    .collect();
            }
            UNIX_DIAG_RQLEN if attr.payload.len() >= 8 => {
                rqlen = u32::from_ne_bytes(attr.payload[0..4].try_into().unwrap());
                wqlen = u32::from_ne_bytes(attr.payload[4..8].try_into().unwrap());
            }
            _ => {}
        }
    }

    let state = unix_state(msg.udiag_state);

    if let (Some(n), UnixState::Listen) = (&name, state) {
        if let Some(v) = &vfs {
            if !validate_name_against_vfs(n, v) {
                name = None;
            }
        } else if n.first() != Some(&0) {
            // No VFS attribute reported for a named listener: nothing to
            // validate against, keep the name (spec §7 "missing
            // UNIX_DIAG_VFS on a listener with no name is silently
            // skipped" covers the absent-name case; a present name with
            // no VFS attr is left untouched here).
        }
    }

    let sk_type = match msg.udiag_type as i32 {
        libc::SOCK_STREAM => UnixType::Stream,
        libc::SOCK_DGRAM => UnixType::Dgram,
        libc::SOCK_SEQPACKET => UnixType::SeqPacket,
        _ => UnixType::Stream,
    };

    tables.insert_unix(UnixSkDesc {
        ino: msg.udiag_ino,
        sk_type,
        state,
        peer_ino,
        rqlen,
        wqlen,
        name,
        icons,
    });
}

fn parse_inet_message(body: &[u8], proto: InetProto, tables: &mut SocketTables) {
    let (msg, _rest) = match inet_diag_msg(body) {
        Some(v) => v,
        None => return,
    };

    let state = if msg.idiag_state == TCP_LISTEN {
        InetState::Listen
    } else if msg.idiag_rqueue == 0 && msg.idiag_wqueue == 0 && proto == InetProto::Udp {
        InetState::Established
    } else {
        InetState::Established
    };

    let sk_type = match proto {
        InetProto::Tcp => InetType::Stream,
        InetProto::Udp => InetType::Dgram,
    };

    tables.insert_inet(InetSkDesc {
        ino: msg.idiag_inode,
        sk_type,
        proto,
        src_port: u16::from_be(msg.id.idiag_sport),
        dst_port: u16::from_be(msg.id.idiag_dport),
        state,
        rqlen: msg.idiag_rqueue,
        wqlen: msg.idiag_wqueue,
        src_addr: msg.id.idiag_src,
        dst_addr: msg.id.idiag_dst,
    });
}

fn dump_unix(fd: RawFd, tables: &mut SocketTables) -> Result<()> {
    let req = UnixDiagReq {
        sdiag_family: libc::AF_UNIX as u8,
        sdiag_protocol: 0,
        pad: 0,
        udiag_states: u32::MAX,
        udiag_ino: 0,
        udiag_cookie: [u32::MAX; 2],
        udiag_show: UDIAG_SHOW_NAME | UDIAG_SHOW_VFS | UDIAG_SHOW_PEER | UDIAG_SHOW_ICONS | UDIAG_SHOW_RQLEN,
    };
    netlink::send_dump_request(fd, unsafe { as_bytes(&req) })?;
    netlink::drain_dump(fd, |body| {
        parse_unix_message(body, tables);
        Ok(())
    })
}

fn dump_inet(fd: RawFd, protocol: i32, states: u32, proto: InetProto, tables: &mut SocketTables) -> Result<()> {
    let req = InetDiagReqV2 {
        sdiag_family: libc::AF_INET as u8,
        sdiag_protocol: protocol as u8,
        idiag_ext: 0,
        pad: 0,
        idiag_states: states,
        id: InetDiagSockId {
            idiag_sport: 0,
            idiag_dport: 0,
            idiag_src: [0; 4],
            idiag_dst: [0; 4],
            idiag_if: 0,
            idiag_cookie: [u32::MAX; 2],
        },
    };
    netlink::send_dump_request(fd, unsafe { as_bytes(&req) })?;
    netlink::drain_dump(fd, |body| {
        parse_inet_message(body, proto, tables);
        Ok(())
    })
}

/// Run all three dump queries in order, each drained to completion before
/// the next (spec §4.7).
pub fn collect_all() -> Result<SocketTables> {
    let fd = netlink::open_sock_diag()?;
    let mut tables = SocketTables::default();

    dump_unix(fd, &mut tables)?;
    dump_inet(fd, libc::IPPROTO_TCP, 1 << TCP_LISTEN, InetProto::Tcp, &mut tables)?;
    dump_inet(fd, libc::IPPROTO_UDP, u32::MAX, InetProto::Udp, &mut tables)?;

    unsafe {
        libc::close(fd);
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_bind_paths_are_skipped() {
        assert!(parse_unix_name(b"relative/path").is_none());
    }

    #[test]
    fn absolute_bind_paths_are_kept() {
        assert_eq!(parse_unix_name(b"/tmp/s").unwrap(), b"/tmp/s");
    }

    #[test]
    fn abstract_names_are_kept() {
        let name = b"\0crtools-sk-abc";
        assert_eq!(parse_unix_name(name).unwrap(), name);
    }
}
