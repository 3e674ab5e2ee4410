//! Ambient configuration: retry counts, buffer sizes, the rendezvous
//! address prefix. Constructed by the (external) CLI collaborator and
//! threaded through; this crate does not parse argv itself (spec §1).

/// Smallest `addr_args` buffer we'll ever map, regardless of command mix
/// (spec §4.6).
pub const PARASITE_ARG_SIZE_MIN: usize = 16 * 1024;

/// Every signal-max sigaction entry dumped by `DUMP_SIGACTS` (spec §4.5).
pub const SIGNAL_MAX: usize = 64;

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of times `connect()` is retried while the peer side may not
    /// yet have reached its `listen()` (spec §4.9).
    pub rendezvous_connect_attempts: u32,
    /// Sleep between rendezvous connect attempts.
    pub rendezvous_connect_backoff: std::time::Duration,
    /// Floor for the parasite argument buffer (spec §4.6).
    pub parasite_arg_size_min: usize,
    /// Max iovecs a single page-pipe buffer may hold before rotating.
    pub page_pipe_max_iovs: usize,
    /// Capacity, in bytes, of each page-pipe's underlying kernel pipe.
    pub page_pipe_capacity: usize,
    /// Abstract-namespace prefix used to derive the parasite transport
    /// socket addresses (spec §6).
    pub tsock_prefix: &'static str,
    /// Abstract-namespace prefix used to derive UNIX stream rendezvous
    /// addresses (spec §6).
    pub rendezvous_prefix: &'static str,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rendezvous_connect_attempts: 8,
            rendezvous_connect_backoff: std::time::Duration::from_millis(1),
            parasite_arg_size_min: PARASITE_ARG_SIZE_MIN,
            page_pipe_max_iovs: 1024,
            page_pipe_capacity: 1024 * 1024,
            tsock_prefix: "crtools-pr-",
            rendezvous_prefix: "crtools-sk-",
        }
    }
}
