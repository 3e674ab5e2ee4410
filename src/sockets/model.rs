//! Socket data model (spec §3): collected socket descriptors, the
//! inode-keyed indexes, the packet pool, and the restorer's job lists.
//! Ids, not owning references, are stored everywhere a descriptor refers to
//! another one — the listener/icon/in-flight graph is cyclic and survives
//! the two-phase collect/dump split only if lookups always go back through
//! a table (design note "Cyclic graphs").

use std::collections::HashMap;

pub type Inode = u32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnixType {
    Stream,
    Dgram,
    SeqPacket,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnixState {
    Unconnected,
    Listen,
    Established,
    Closing,
}

/// A collected UNIX-domain socket (spec §3 "Socket descriptor (collected)").
#[derive(Clone, Debug)]
pub struct UnixSkDesc {
    pub ino: Inode,
    pub sk_type: UnixType,
    pub state: UnixState,
    pub peer_ino: Option<Inode>,
    pub rqlen: u32,
    pub wqlen: u32,
    pub name: Option<Vec<u8>>,
    /// Incoming-connection inodes reported for a listening socket.
    pub icons: Vec<Inode>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InetType {
    Stream,
    Dgram,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InetProto {
    Tcp,
    Udp,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InetState {
    Listen,
    Established,
    Close,
}

/// A collected IPv4 socket (spec §3).
#[derive(Clone, Debug)]
pub struct InetSkDesc {
    pub ino: Inode,
    pub sk_type: InetType,
    pub proto: InetProto,
    pub src_port: u16,
    pub dst_port: u16,
    pub state: InetState,
    pub rqlen: u32,
    pub wqlen: u32,
    pub src_addr: [u32; 4],
    pub dst_addr: [u32; 4],
}

#[derive(Clone, Debug)]
pub enum SocketDesc {
    Unix(UnixSkDesc),
    Inet(InetSkDesc),
}

impl SocketDesc {
    pub fn ino(&self) -> Inode {
        match self {
            SocketDesc::Unix(d) => d.ino,
            SocketDesc::Inet(d) => d.ino,
        }
    }
}

/// The three hash tables named in spec §3, all keyed by inode (a `HashMap`
/// stands in faithfully for the original's fixed-size bucket chains; the
/// invariants they encode don't depend on the bucket count).
#[derive(Default)]
pub struct SocketTables {
    /// All collected sockets, by inode.
    pub by_ino: HashMap<Inode, SocketDesc>,
    /// `peer_ino of icon -> listening UNIX socket inode it belongs to`,
    /// used to resolve an in-flight stream's listener at dump time.
    pub icon_owner: HashMap<Inode, Inode>,
    /// Populated at restore: `inode -> {bound sockaddr bytes, type}` for
    /// every UNIX listening socket, used to resolve a deferred connect's
    /// destination.
    pub unix_listen: HashMap<Inode, UnixListenEntry>,
}

#[derive(Clone, Debug)]
pub struct UnixListenEntry {
    pub addr: Vec<u8>,
    pub sk_type: UnixType,
}

impl SocketTables {
    pub fn insert_unix(&mut self, desc: UnixSkDesc) {
        for &icon in &desc.icons {
            self.icon_owner.insert(icon, desc.ino);
        }
        self.by_ino.insert(desc.ino, SocketDesc::Unix(desc));
    }

    pub fn insert_inet(&mut self, desc: InetSkDesc) {
        self.by_ino.insert(desc.ino, SocketDesc::Inet(desc));
    }

    /// Resolve the listener that reported `child_ino` as one of its icons
    /// (spec §4.7/§4.8: the in-flight-connection lookup).
    pub fn listener_of_icon(&self, child_ino: Inode) -> Option<Inode> {
        self.icon_owner.get(&child_ino).copied()
    }
}

/// A dumped image entry for one UNIX socket fd (spec §3 "Socket image
/// entries"). `USK_INFLIGHT` marks a connected stream whose peer was only
/// discoverable via icons.
#[derive(Clone, Debug)]
pub struct UnixSkEntry {
    pub id: Inode,
    pub fd: i32,
    pub sk_type: UnixType,
    pub state: UnixState,
    pub name: Option<Vec<u8>>,
    pub backlog: u32,
    pub inflight: bool,
    pub peer: Option<Inode>,
}

#[derive(Clone, Debug)]
pub struct InetSkEntry {
    pub id: Inode,
    pub fd: i32,
    pub sk_type: InetType,
    pub proto: InetProto,
    pub state: InetState,
    pub src_port: u16,
    pub dst_port: u16,
    pub backlog: u32,
    pub src_addr: [u32; 4],
    pub dst_addr: [u32; 4],
}

/// A packet pending replay from `SK_QUEUES`, consumed in list order (spec
/// §3 "Packet pool").
#[derive(Clone, Debug)]
pub struct PoolEntry {
    pub id_for: Inode,
    pub length: u32,
    pub image_offset: u64,
}

#[derive(Default)]
pub struct PacketPool {
    entries: Vec<PoolEntry>,
}

impl PacketPool {
    pub fn push(&mut self, entry: PoolEntry) {
        self.entries.push(entry);
    }

    /// Remove and return, in original enqueue order, every entry destined
    /// for `peer` (spec §4.9 "Queue ordering" invariant).
    pub fn drain_for(&mut self, peer: Inode) -> Vec<PoolEntry> {
        let mut drained = Vec::new();
        let mut remaining = Vec::with_capacity(self.entries.len());
        for e in self.entries.drain(..) {
            if e.id_for == peer {
                drained.push(e);
            } else {
                remaining.push(e);
            }
        }
        self.entries = remaining;
        drained
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectJobKind {
    Dgram,
    Stream,
    StreamInflight,
}

#[derive(Clone, Debug)]
pub struct ConnectJob {
    pub fd: i32,
    pub kind: ConnectJobKind,
    /// For `Dgram`/`Stream`: the peer's own id (rendezvous target). For
    /// `StreamInflight`: the listener's id.
    pub peer: Inode,
    /// The dumped id of the socket this job restores, used to drain its
    /// packet-pool entries after connect.
    pub self_id: Inode,
}

#[derive(Clone, Debug)]
pub struct AcceptJob {
    pub server_fd: i32,
    pub peer: Inode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icon_owner_resolves_inflight_listener() {
        let mut tables = SocketTables::default();
        tables.insert_unix(UnixSkDesc {
            ino: 20,
            sk_type: UnixType::Stream,
            state: UnixState::Listen,
            peer_ino: None,
            rqlen: 0,
            wqlen: 0,
            name: Some(b"/tmp/s".to_vec()),
            icons: vec![21],
        });
        assert_eq!(tables.listener_of_icon(21), Some(20));
    }

    #[test]
    fn packet_pool_preserves_enqueue_order_per_peer() {
        let mut pool = PacketPool::default();
        pool.push(PoolEntry { id_for: 11, length: 3, image_offset: 0 });
        pool.push(PoolEntry { id_for: 12, length: 5, image_offset: 3 });
        pool.push(PoolEntry { id_for: 11, length: 2, image_offset: 8 });

        let drained = pool.drain_for(11);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].image_offset, 0);
        assert_eq!(drained[1].image_offset, 8);
        assert_eq!(pool.drain_for(12).len(), 1);
    }
}
