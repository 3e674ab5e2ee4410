//! Victim control block (spec §3): the record owning, for the duration of
//! one ptrace session, everything the injection engine needs to drive a
//! victim and cleanly undo itself.

use crate::registers::Registers;
use crate::remote_ptr::{LocalView, RemotePtr};
use crate::victim::vma::SYSCALL_OP_LEN;
use libc::pid_t;
use std::os::unix::io::RawFd;

/// Bytes overwritten at the chosen syscall site, saved so `cure` can put
/// them back exactly (invariant (a) in spec §3).
pub type SavedOpBytes = [u8; SYSCALL_OP_LEN as usize];

pub struct VictimControlBlock {
    pub pid: pid_t,

    /// Registers captured before we touched anything, restored by `cure`.
    pub orig_regs: Registers,
    /// Bytes that lived at `syscall_ip` before we spliced in the native
    /// syscall opcode.
    pub code_orig: SavedOpBytes,
    pub syscall_ip: u64,
    /// True once the syscall opcode has replaced `code_orig` at
    /// `syscall_ip`; false once `cure` has put `code_orig` back.
    pub live: bool,

    /// Remote address of the shared mapping injected into the victim, and
    /// its total length.
    pub remote_map: RemotePtr<u8>,
    pub remote_map_len: usize,
    /// The controller's own mapping of the same physical pages, obtained
    /// through `/proc/<pid>/map_files/...` (spec §4.4 step 3).
    pub local_map: Option<LocalView<u8>>,

    /// Remote entry point of the injected parasite blob.
    pub parasite_ip: RemotePtr<u8>,
    /// Byte offsets of the command slot and argument buffer within the
    /// shared mapping (resolved from the blob's exported symbols).
    pub cmd_offset: usize,
    pub args_offset: usize,
    pub args_buf_size: usize,

    /// Transport socket connected to the parasite (spec §4.5). `None`
    /// until `PARASITE_CMD_INIT` succeeds.
    pub tsock: Option<RawFd>,

    /// Once set, any non-`SIGTRAP` stop during parasite execution is
    /// fatal rather than re-delivered (spec §3 invariant, §4.3).
    pub signals_blocked: bool,
}

impl VictimControlBlock {
    pub fn new(pid: pid_t, orig_regs: Registers, syscall_ip: u64, code_orig: SavedOpBytes) -> Self {
        VictimControlBlock {
            pid,
            orig_regs,
            code_orig,
            syscall_ip,
            live: false,
            remote_map: RemotePtr::new(0),
            remote_map_len: 0,
            local_map: None,
            parasite_ip: RemotePtr::new(0),
            cmd_offset: 0,
            args_offset: 0,
            args_buf_size: 0,
            tsock: None,
            signals_blocked: false,
        }
    }

    pub fn addr_cmd(&self) -> Option<*mut u32> {
        self.local_map.as_ref().map(|m| unsafe {
            (m.as_ptr() as *const u8).add(self.cmd_offset) as *mut u32
        })
    }

    pub fn addr_args(&self) -> Option<*mut u8> {
        self.local_map
            .as_ref()
            .map(|m| unsafe { (m.as_ptr() as *const u8).add(self.args_offset) as *mut u8 })
    }
}
