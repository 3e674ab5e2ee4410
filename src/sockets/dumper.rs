//! Socket dumper (spec §4.8): classify an fd encountered during the
//! generic fd-walk, look up its inode in the collected table, and apply the
//! per-family dump policy.

use crate::error::{Error, Result};
use crate::sockets::model::{
    InetSkEntry, InetState, InetType, SocketDesc, SocketTables, UnixSkEntry, UnixState, UnixType,
};
use std::os::unix::io::RawFd;

const SOCKFS_MAGIC: i64 = 0x534F_434B;

/// `statfs`s `/proc/<pid>/fd/<fd>`; `Ok(None)` means "not a socket, try the
/// next fd handler" (spec §4.8), grounded on `sockets.c`'s per-fd magic
/// check happening during the generic fd-walk rather than up front.
pub fn classify_fd(pid: libc::pid_t, fd: RawFd) -> Result<Option<u32>> {
    let path = std::ffi::CString::new(format!("/proc/{}/fd/{}", pid, fd)).expect("no NUL in path");
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statfs(path.as_ptr(), &mut st) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if st.f_type != SOCKFS_MAGIC {
        return Ok(None);
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(Some(stat.st_ino as u32))
}

/// Dump one UNIX fd already classified and looked up in `tables` (spec
/// §4.8). Returns `None` if the socket's type/state combination is out of
/// scope (e.g. SEQPACKET — only STREAM and DGRAM are supported).
pub fn dump_unix_fd(
    fd: RawFd,
    ino: u32,
    tables: &SocketTables,
    queued_data: &mut Vec<RawFd>,
) -> Result<Option<UnixSkEntry>> {
    let desc = match tables.by_ino.get(&ino) {
        Some(SocketDesc::Unix(d)) => d,
        Some(SocketDesc::Inet(_)) => {
            return Err(Error::NetlinkProtocol(format!("inode {} is INET, expected UNIX", ino)))
        }
        None => return Err(Error::UncollectedSocket(ino)),
    };

    if !matches!(desc.sk_type, UnixType::Stream | UnixType::Dgram) {
        return Ok(None);
    }
    let scoped_state = matches!(
        (desc.sk_type, desc.state),
        (_, UnixState::Listen) | (_, UnixState::Established) | (UnixType::Dgram, UnixState::Closing)
    );
    if !scoped_state {
        return Ok(None);
    }

    let (peer, inflight) = match (desc.peer_ino, desc.state) {
        (Some(p), _) => (Some(p), false),
        (None, UnixState::Established) => match tables.listener_of_icon(ino) {
            Some(listener) => (Some(listener), true),
            None => return Err(Error::DanglingInflight(ino)),
        },
        (None, _) => (None, false),
    };

    let is_listening_stream = desc.sk_type == UnixType::Stream && desc.state == UnixState::Listen;
    if desc.rqlen != 0 && !is_listening_stream {
        queued_data.push(fd);
    }

    Ok(Some(UnixSkEntry {
        id: ino,
        fd,
        sk_type: desc.sk_type,
        state: desc.state,
        name: desc.name.clone(),
        backlog: desc.wqlen,
        inflight,
        peer,
    }))
}

/// Dump one INET fd (spec §4.8): stream listeners with no in-flight
/// backlog, and all datagram. IPv6 is unsupported and filtered upstream by
/// the collector never producing an AF_INET6 entry.
pub fn dump_inet_fd(fd: RawFd, ino: u32, tables: &SocketTables) -> Result<Option<InetSkEntry>> {
    let desc = match tables.by_ino.get(&ino) {
        Some(SocketDesc::Inet(d)) => d,
        Some(SocketDesc::Unix(_)) => {
            return Err(Error::NetlinkProtocol(format!("inode {} is UNIX, expected INET", ino)))
        }
        None => return Err(Error::UncollectedSocket(ino)),
    };

    match (desc.sk_type, desc.state) {
        (InetType::Stream, InetState::Listen) => {
            if desc.rqlen != 0 {
                return Err(Error::InFlightOnListen);
            }
        }
        (InetType::Dgram, _) => {}
        _ => return Ok(None),
    }

    Ok(Some(InetSkEntry {
        id: ino,
        fd,
        sk_type: desc.sk_type,
        proto: desc.proto,
        state: desc.state,
        src_port: desc.src_port,
        dst_port: desc.dst_port,
        backlog: desc.wqlen,
        src_addr: desc.src_addr,
        dst_addr: desc.dst_addr,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockets::model::{InetProto, UnixSkDesc};

    fn tables_with_listener_and_inflight_child() -> SocketTables {
        let mut t = SocketTables::default();
        t.insert_unix(UnixSkDesc {
            ino: 20,
            sk_type: UnixType::Stream,
            state: UnixState::Listen,
            peer_ino: None,
            rqlen: 0,
            wqlen: 0,
            name: Some(b"/tmp/s".to_vec()),
            icons: vec![21],
        });
        t.insert_unix(UnixSkDesc {
            ino: 21,
            sk_type: UnixType::Stream,
            state: UnixState::Established,
            peer_ino: None,
            rqlen: 0,
            wqlen: 0,
            name: None,
            icons: vec![],
        });
        t
    }

    #[test]
    fn inflight_child_resolves_peer_via_icons_and_flags_inflight() {
        let tables = tables_with_listener_and_inflight_child();
        let mut queued = Vec::new();
        let entry = dump_unix_fd(5, 21, &tables, &mut queued).unwrap().unwrap();
        assert!(entry.inflight);
        assert_eq!(entry.peer, Some(20));
    }

    #[test]
    fn uncollected_inode_is_fatal() {
        let tables = SocketTables::default();
        let mut queued = Vec::new();
        assert!(matches!(
            dump_unix_fd(5, 99, &tables, &mut queued),
            Err(Error::UncollectedSocket(99))
        ));
    }

    #[test]
    fn tcp_listener_with_backlog_is_fatal() {
        let mut tables = SocketTables::default();
        tables.insert_inet(crate::sockets::model::InetSkDesc {
            ino: 30,
            sk_type: InetType::Stream,
            proto: InetProto::Tcp,
            src_port: 5000,
            dst_port: 0,
            state: InetState::Listen,
            rqlen: 1,
            wqlen: 0,
            src_addr: [0; 4],
            dst_addr: [0; 4],
        });
        assert!(matches!(dump_inet_fd(5, 30, &tables), Err(Error::InFlightOnListen)));
    }

    #[test]
    fn inet_listener_backlog_comes_from_wqlen_not_rqlen() {
        let mut tables = SocketTables::default();
        tables.insert_inet(crate::sockets::model::InetSkDesc {
            ino: 31,
            sk_type: InetType::Stream,
            proto: InetProto::Tcp,
            src_port: 5000,
            dst_port: 0,
            state: InetState::Listen,
            rqlen: 0,
            wqlen: 128,
            src_addr: [0; 4],
            dst_addr: [0; 4],
        });
        let entry = dump_inet_fd(5, 31, &tables).unwrap().unwrap();
        assert_eq!(entry.backlog, 128);
    }

    #[test]
    fn unix_listener_backlog_comes_from_wqlen_not_rqlen() {
        let mut tables = SocketTables::default();
        tables.insert_unix(UnixSkDesc {
            ino: 40,
            sk_type: UnixType::Stream,
            state: UnixState::Listen,
            peer_ino: None,
            rqlen: 0,
            wqlen: 64,
            name: Some(b"/tmp/s2".to_vec()),
            icons: vec![],
        });
        let mut queued = Vec::new();
        let entry = dump_unix_fd(5, 40, &tables, &mut queued).unwrap().unwrap();
        assert_eq!(entry.backlog, 64);
    }
}
