//! Socket restorer (spec §4.9): abstract rendezvous addresses, the
//! two-phase connect/accept job construction, and queue replay. Job
//! construction (`plan_unix_restore`) is kept pure and syscall-free so it
//! can be tested without a kernel; the `execute_*` functions below it do
//! the actual `bind`/`listen`/`connect`/`accept`/`sendfile` work.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::image::FileImage;
use crate::sockets::model::{
    AcceptJob, ConnectJob, ConnectJobKind, Inode, InetProto, InetSkEntry, InetState, InetType,
    PacketPool, UnixListenEntry, UnixSkEntry, UnixState, UnixType,
};
use std::os::unix::io::RawFd;
use std::thread::sleep;

/// Derive the abstract-namespace rendezvous address for a UNIX stream
/// socket's inode id (spec §6: `"\0crtools-sk-%10d"`, length =
/// `sizeof(sun_family) + sizeof("crtools-sk-") + 10`). Dump and restore
/// must agree on these bytes bit-for-bit (spec §8 "Abstract-address
/// determinism").
pub fn rendezvous_addr(prefix: &str, id: Inode) -> Vec<u8> {
    let mut v = vec![0u8];
    v.extend_from_slice(prefix.as_bytes());
    v.extend_from_slice(format!("{:>10}", id).as_bytes());
    v
}

#[derive(Clone, Debug)]
pub enum BindTarget {
    Name(Vec<u8>),
    Rendezvous(Inode),
}

#[derive(Clone, Debug)]
pub struct BindAction {
    pub fd: i32,
    pub target: BindTarget,
    pub listen_backlog: Option<u32>,
}

#[derive(Default)]
pub struct UnixRestorePlan {
    pub binds: Vec<BindAction>,
    pub connect_jobs: Vec<ConnectJob>,
    pub accept_jobs: Vec<AcceptJob>,
    pub listen_table: Vec<(Inode, UnixListenEntry)>,
}

/// Build the bind/connect/accept plan for a set of dumped UNIX entries
/// (spec §4.9 "Per-socket actions on restore read"). Pure: performs no I/O.
pub fn plan_unix_restore(entries: &[UnixSkEntry], cfg: &Config) -> UnixRestorePlan {
    let mut plan = UnixRestorePlan::default();

    for e in entries {
        match (e.sk_type, e.state) {
            (UnixType::Dgram, _) => {
                if let Some(name) = &e.name {
                    plan.binds.push(BindAction {
                        fd: e.fd,
                        target: BindTarget::Name(name.clone()),
                        listen_backlog: None,
                    });
                    plan.listen_table.push((
                        e.id,
                        UnixListenEntry { addr: name.clone(), sk_type: e.sk_type },
                    ));
                } else if e.peer.is_some() {
                    plan.binds.push(BindAction {
                        fd: e.fd,
                        target: BindTarget::Rendezvous(e.id),
                        listen_backlog: None,
                    });
                    plan.listen_table.push((
                        e.id,
                        UnixListenEntry { addr: rendezvous_addr(cfg.rendezvous_prefix, e.id), sk_type: e.sk_type },
                    ));
                }
                if let Some(peer) = e.peer {
                    plan.connect_jobs.push(ConnectJob {
                        fd: e.fd,
                        kind: ConnectJobKind::Dgram,
                        peer,
                        self_id: e.id,
                    });
                }
            }
            (UnixType::Stream, UnixState::Listen) | (UnixType::SeqPacket, UnixState::Listen) => {
                let name = e.name.clone().unwrap_or_default();
                plan.binds.push(BindAction {
                    fd: e.fd,
                    target: BindTarget::Name(name.clone()),
                    listen_backlog: Some(e.backlog.max(1)),
                });
                plan.listen_table.push((
                    e.id,
                    UnixListenEntry { addr: name, sk_type: e.sk_type },
                ));
            }
            (UnixType::Stream, UnixState::Established) | (UnixType::SeqPacket, UnixState::Established) => {
                let peer = e.peer.expect("established socket must have a resolved peer");
                if peer < e.id && !e.inflight {
                    plan.binds.push(BindAction {
                        fd: e.fd,
                        target: BindTarget::Rendezvous(e.id),
                        listen_backlog: Some(1),
                    });
                    plan.accept_jobs.push(AcceptJob { server_fd: e.fd, peer });
                } else {
                    let kind = if e.inflight {
                        ConnectJobKind::StreamInflight
                    } else {
                        ConnectJobKind::Stream
                    };
                    plan.connect_jobs.push(ConnectJob { fd: e.fd, kind, peer, self_id: e.id });
                }
            }
            _ => {}
        }
    }

    plan
}

fn bind_unix(fd: RawFd, target: &BindTarget, cfg: &Config) -> Result<Vec<u8>> {
    let bytes = match target {
        BindTarget::Name(name) => {
            if !name.is_empty() && name[0] != 0 {
                let cpath = std::ffi::CString::new(name.clone()).expect("no interior NUL");
                unsafe {
                    libc::unlink(cpath.as_ptr());
                }
            }
            name.clone()
        }
        BindTarget::Rendezvous(id) => rendezvous_addr(cfg.rendezvous_prefix, *id),
    };

    let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let n = bytes.len().min(sun.sun_path.len());
    for (slot, byte) in sun.sun_path.iter_mut().zip(bytes[..n].iter()) {
        *slot = *byte as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + n) as libc::socklen_t;
    let ret = unsafe { libc::bind(fd, &sun as *const _ as *const libc::sockaddr, len) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(bytes)
}

fn connect_unix(fd: RawFd, addr: &[u8]) -> Result<()> {
    let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let n = addr.len().min(sun.sun_path.len());
    for (slot, byte) in sun.sun_path.iter_mut().zip(addr[..n].iter()) {
        *slot = *byte as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + n) as libc::socklen_t;
    let ret = unsafe { libc::connect(fd, &sun as *const _ as *const libc::sockaddr, len) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Execute every bind (and listen, where applicable), returning the
/// populated `unix_listen` table (spec §4.9).
pub fn execute_binds(plan: &UnixRestorePlan, cfg: &Config) -> Result<Vec<(Inode, UnixListenEntry)>> {
    for b in &plan.binds {
        bind_unix(b.fd, &b.target, cfg)?;
        if let Some(backlog) = b.listen_backlog {
            if unsafe { libc::listen(b.fd, backlog as i32) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
    }
    Ok(plan.listen_table.clone())
}

/// Replay every packet-pool entry destined for `peer` via `sendfile`,
/// in enqueue order; a short write is fatal (spec §4.9).
pub fn restore_socket_queue(fd: RawFd, peer: Inode, pool: &mut PacketPool, img: &mut FileImage) -> Result<()> {
    for entry in pool.drain_for(peer) {
        img.seek_to(entry.image_offset)?;
        let img_fd = img.as_raw_fd();
        let mut remaining = entry.length as i64;
        let mut offset = entry.image_offset as libc::off_t;
        while remaining > 0 {
            let n = unsafe { libc::sendfile(fd, img_fd, &mut offset, remaining as usize) };
            if n <= 0 {
                return Err(Error::Truncated {
                    want: entry.length as usize,
                    got: (entry.length as i64 - remaining) as usize,
                });
            }
            remaining -= n as i64;
        }
    }
    Ok(())
}

/// Connect phase (spec §4.9): walk the connect-job list, retrying with
/// backoff since the peer may not yet have reached its `listen()`.
pub fn run_connect_phase(
    jobs: &[ConnectJob],
    listen_table: &std::collections::HashMap<Inode, UnixListenEntry>,
    cfg: &Config,
) -> Result<()> {
    for job in jobs {
        let dest = match job.kind {
            ConnectJobKind::Stream => rendezvous_addr(cfg.rendezvous_prefix, job.peer),
            ConnectJobKind::Dgram | ConnectJobKind::StreamInflight => listen_table
                .get(&job.peer)
                .map(|e| e.addr.clone())
                .ok_or_else(|| Error::DanglingInflight(job.peer))?,
        };

        let mut attempt = 0;
        loop {
            match connect_unix(job.fd, &dest) {
                Ok(()) => break,
                Err(_) if attempt + 1 < cfg.rendezvous_connect_attempts => {
                    attempt += 1;
                    sleep(cfg.rendezvous_connect_backoff);
                }
                Err(_) => return Err(Error::RendezvousTimeout(cfg.rendezvous_connect_attempts)),
            }
        }
    }
    Ok(())
}

/// Accept phase (spec §4.9): `accept` on each server slot and install the
/// resulting fd onto the server's target fd via the fd-reopen primitive.
pub fn run_accept_phase(jobs: &[AcceptJob]) -> Result<Vec<RawFd>> {
    let mut installed = Vec::with_capacity(jobs.len());
    for job in jobs {
        let accepted = unsafe { libc::accept(job.server_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if accepted < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        crate::reopen::reopen_fd_as(job.server_fd, accepted)?;
        installed.push(job.server_fd);
    }
    Ok(installed)
}

/// Restore one INET socket entry (spec §4.9 "INET restore"): straightforward,
/// no job indirection needed.
pub fn restore_inet(entry: &InetSkEntry) -> Result<RawFd> {
    let sock_type = match entry.sk_type {
        InetType::Stream => libc::SOCK_STREAM,
        InetType::Dgram => libc::SOCK_DGRAM,
    };
    let proto = match entry.proto {
        InetProto::Tcp => libc::IPPROTO_TCP,
        InetProto::Udp => libc::IPPROTO_UDP,
    };
    let fd = unsafe { libc::socket(libc::AF_INET, sock_type, proto) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = entry.src_port.to_be();
    sin.sin_addr.s_addr = entry.src_addr[0];
    if unsafe {
        libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    } != 0
    {
        return Err(std::io::Error::last_os_error().into());
    }

    match (entry.state, entry.proto) {
        (InetState::Listen, InetProto::Tcp) => {
            if unsafe { libc::listen(fd, entry.backlog.max(1) as i32) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        (InetState::Established, InetProto::Udp) => {
            let mut dst: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            dst.sin_family = libc::AF_INET as libc::sa_family_t;
            dst.sin_port = entry.dst_port.to_be();
            dst.sin_addr.s_addr = entry.dst_addr[0];
            if unsafe {
                libc::connect(
                    fd,
                    &dst as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            } != 0
            {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        _ => return Err(Error::UnsupportedState("unexpected INET state/proto combination")),
    }

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::default()
    }

    #[test]
    fn rendezvous_addr_is_deterministic_for_same_id() {
        let a = rendezvous_addr("crtools-sk-", 10);
        let b = rendezvous_addr("crtools-sk-", 10);
        assert_eq!(a, b);
        assert_eq!(a[0], 0);
    }

    #[test]
    fn rendezvous_addr_matches_spec_example() {
        let a = rendezvous_addr("crtools-sk-", 10);
        let expected = format!("crtools-sk-{:>10}", 10);
        assert_eq!(&a[1..], expected.as_bytes());
        assert_eq!(expected.len(), "crtools-sk-".len() + 10);
    }

    #[test]
    fn dgram_socketpair_enqueues_two_connect_jobs() {
        let entries = vec![
            UnixSkEntry {
                id: 10,
                fd: 100,
                sk_type: UnixType::Dgram,
                state: UnixState::Unconnected,
                name: None,
                backlog: 0,
                inflight: false,
                peer: Some(11),
            },
            UnixSkEntry {
                id: 11,
                fd: 101,
                sk_type: UnixType::Dgram,
                state: UnixState::Unconnected,
                name: None,
                backlog: 0,
                inflight: false,
                peer: Some(10),
            },
        ];
        let plan = plan_unix_restore(&entries, &cfg());
        assert_eq!(plan.connect_jobs.len(), 2);
        assert_eq!(plan.binds.len(), 2);
        assert!(plan.connect_jobs.iter().all(|j| j.kind == ConnectJobKind::Dgram));
    }

    #[test]
    fn established_stream_lower_id_becomes_server() {
        let entries = vec![
            UnixSkEntry {
                id: 5,
                fd: 50,
                sk_type: UnixType::Stream,
                state: UnixState::Established,
                name: None,
                backlog: 0,
                inflight: false,
                peer: Some(9),
            },
            UnixSkEntry {
                id: 9,
                fd: 90,
                sk_type: UnixType::Stream,
                state: UnixState::Established,
                name: None,
                backlog: 0,
                inflight: false,
                peer: Some(5),
            },
        ];
        let plan = plan_unix_restore(&entries, &cfg());
        assert_eq!(plan.accept_jobs.len(), 1);
        assert_eq!(plan.accept_jobs[0].server_fd, 50);
        assert_eq!(plan.connect_jobs.len(), 1);
        assert_eq!(plan.connect_jobs[0].fd, 90);
        assert_eq!(plan.connect_jobs[0].kind, ConnectJobKind::Stream);
    }

    #[test]
    fn inflight_established_stream_always_connects_not_accepts() {
        let entries = vec![UnixSkEntry {
            id: 21,
            fd: 210,
            sk_type: UnixType::Stream,
            state: UnixState::Established,
            name: None,
            backlog: 0,
            inflight: true,
            peer: Some(20),
        }];
        let plan = plan_unix_restore(&entries, &cfg());
        assert_eq!(plan.connect_jobs.len(), 1);
        assert_eq!(plan.connect_jobs[0].kind, ConnectJobKind::StreamInflight);
        assert!(plan.accept_jobs.is_empty());
    }

    /// End-to-end over real UNIX datagram sockets (no ptrace/netlink
    /// involved): a DGRAM socketpair's rendezvous binds must land in the
    /// table `run_connect_phase` looks peers up in, or the connect phase
    /// reports a dangling in-flight peer for a socket that was never
    /// in-flight at all.
    #[test]
    fn dgram_socketpair_binds_and_connects_round_trip() {
        let fd_a = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
        let fd_b = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
        assert!(fd_a >= 0 && fd_b >= 0);

        let id_a: Inode = 900_001;
        let id_b: Inode = 900_002;

        let entries = vec![
            UnixSkEntry {
                id: id_a,
                fd: fd_a,
                sk_type: UnixType::Dgram,
                state: UnixState::Unconnected,
                name: None,
                backlog: 0,
                inflight: false,
                peer: Some(id_b),
            },
            UnixSkEntry {
                id: id_b,
                fd: fd_b,
                sk_type: UnixType::Dgram,
                state: UnixState::Unconnected,
                name: None,
                backlog: 0,
                inflight: false,
                peer: Some(id_a),
            },
        ];

        let cfg = cfg();
        let plan = plan_unix_restore(&entries, &cfg);
        assert_eq!(plan.listen_table.len(), 2, "both dgram peers must be recorded for lookup");

        let listen_table = execute_binds(&plan, &cfg).unwrap();
        let listen_table: std::collections::HashMap<Inode, UnixListenEntry> =
            listen_table.into_iter().collect();

        run_connect_phase(&plan.connect_jobs, &listen_table, &cfg).unwrap();

        let msg = b"hello";
        let n = unsafe {
            libc::send(fd_a, msg.as_ptr() as *const libc::c_void, msg.len(), 0)
        };
        assert_eq!(n, msg.len() as isize);

        unsafe {
            libc::close(fd_a);
            libc::close(fd_b);
        }
    }

    #[test]
    fn listening_stream_populates_listen_table() {
        let entries = vec![UnixSkEntry {
            id: 20,
            fd: 200,
            sk_type: UnixType::Stream,
            state: UnixState::Listen,
            name: Some(b"/tmp/s".to_vec()),
            backlog: 128,
            inflight: false,
            peer: None,
        }];
        let plan = plan_unix_restore(&entries, &cfg());
        assert_eq!(plan.listen_table.len(), 1);
        assert_eq!(plan.listen_table[0].0, 20);
        assert_eq!(plan.binds[0].listen_backlog, Some(128));
    }
}
