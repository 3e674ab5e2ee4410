//! Parasite transport (spec §4.4): map shared memory into the victim,
//! copy the blob in, and expose the command/args slots, with rollback on
//! any failed step.

use crate::error::{Error, Result};
use crate::remote_ptr::{LocalView, RemotePtr};
use crate::remote_syscall;
use crate::victim::control_block::VictimControlBlock;
use crate::victim::vma::{Vma, SYSCALL_OP_LEN};
use libc::{c_void, pid_t};
use log::{debug, warn};

/// `syscall` instruction, x86_64.
const SYSCALL_OPCODE: [u8; SYSCALL_OP_LEN as usize] = [0x0f, 0x05];

/// The parasite blob as produced by the (external) compel-equivalent build
/// step: a fully linked, position-independent payload plus the byte
/// offsets of its three exported symbols (spec §4.4 step 5, SPEC_FULL §11).
pub struct ParasiteBlob {
    pub bytes: Vec<u8>,
    pub head_start_offset: usize,
    pub cmd_offset: usize,
    pub args_offset: usize,
    /// `__export_parasite_args_size`, if the blob was built with it; falls
    /// back to `Config::parasite_arg_size_min` otherwise (SPEC_FULL §11).
    pub args_size_hint: Option<usize>,
}

fn mmap_args_for_size(size: usize) -> [u64; 6] {
    [
        0, // NULL
        size as u64,
        (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64,
        (libc::MAP_ANONYMOUS | libc::MAP_SHARED) as u64,
        (-1i64) as u64,
        0,
    ]
}

/// Inject `blob` into the victim at `vma`'s start, per spec §4.4.
pub fn infect(
    vcb: &mut VictimControlBlock,
    vma: &Vma,
    blob: &ParasiteBlob,
    requested_arg_size_min: usize,
) -> Result<()> {
    debug_assert!(!vcb.live);

    // Step 1: swap in the syscall opcode, remembering the original bytes.
    crate::ptrace::peek_bytes(vcb.pid, vma.start, &mut vcb.code_orig)?;
    crate::ptrace::poke_bytes(vcb.pid, vma.start, &SYSCALL_OPCODE)?;
    vcb.syscall_ip = vma.start;
    vcb.live = true;

    let map_size = std::cmp::max(
        blob.bytes.len(),
        blob.args_size_hint.unwrap_or(requested_arg_size_min) + blob.args_offset,
    );

    // Step 2: mmap(NULL, size, R|W|X, ANON|SHARED, -1, 0) in the victim.
    let mmap_result = remote_syscall::execute(
        vcb.pid,
        vcb.pid,
        vcb.syscall_ip,
        &mut vcb.orig_regs,
        vcb.signals_blocked,
        libc::SYS_mmap,
        mmap_args_for_size(map_size),
    );
    let remote_addr = match mmap_result {
        Ok(v) if v > 0 => v as u64,
        Ok(v) => {
            cure_best_effort(vcb, vma);
            return Err(Error::InjectionFailed("remote mmap returned an error code"));
        }
        Err(e) => {
            cure_best_effort(vcb, vma);
            return Err(e);
        }
    };
    vcb.remote_map = RemotePtr::new(remote_addr);
    vcb.remote_map_len = map_size;

    // Step 3: alias the same physical pages locally via map_files.
    let local_map = match open_map_files_alias(vcb.pid, remote_addr, map_size) {
        Ok(v) => v,
        Err(e) => {
            undo_remote_mmap(vcb);
            cure_best_effort(vcb, vma);
            return Err(e);
        }
    };

    // Step 4: copy the parasite blob into the local view.
    unsafe {
        std::ptr::copy_nonoverlapping(
            blob.bytes.as_ptr(),
            local_map.as_ptr() as *mut u8,
            blob.bytes.len(),
        );
    }

    // Step 5: resolve exported symbols.
    vcb.parasite_ip = vcb.remote_map.add(blob.head_start_offset as u64);
    vcb.cmd_offset = blob.cmd_offset;
    vcb.args_offset = blob.args_offset;
    vcb.args_buf_size = map_size - blob.args_offset;
    vcb.local_map = Some(local_map);

    Ok(())
}

fn open_map_files_alias(pid: pid_t, remote_addr: u64, size: usize) -> Result<LocalView<u8>> {
    let path = format!(
        "/proc/{}/map_files/{:x}-{:x}",
        pid,
        remote_addr,
        remote_addr + size as u64
    );
    let cpath = std::ffi::CString::new(path).expect("no interior NUL in /proc path");
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    unsafe {
        libc::close(fd);
    }
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { LocalView::new(ptr as *mut u8, size) })
}

fn undo_remote_mmap(vcb: &mut VictimControlBlock) {
    if vcb.remote_map_len == 0 {
        return;
    }
    let args = [vcb.remote_map.addr(), vcb.remote_map_len as u64, 0, 0, 0, 0];
    if let Err(e) = remote_syscall::execute(
        vcb.pid,
        vcb.pid,
        vcb.syscall_ip,
        &mut vcb.orig_regs,
        vcb.signals_blocked,
        libc::SYS_munmap,
        args,
    ) {
        warn!("remote munmap during rollback failed: {}", e);
    }
    vcb.remote_map = RemotePtr::new(0);
    vcb.remote_map_len = 0;
}

fn cure_best_effort(vcb: &mut VictimControlBlock, vma: &Vma) {
    if vcb.live {
        if let Err(e) = crate::ptrace::poke_bytes(vcb.pid, vma.start, &vcb.code_orig) {
            warn!("failed to restore original bytes during rollback: {}", e);
        } else {
            vcb.live = false;
        }
    }
}

/// Reverse the injection (spec §4.4 "Teardown"): unmap locally, unmap
/// remotely, restore the original bytes. Individual step failures are
/// tolerated and aggregated into one error.
pub fn cure(vcb: &mut VictimControlBlock, vma: &Vma) -> Result<()> {
    let mut failures: Vec<String> = Vec::new();

    if let Some(local_map) = vcb.local_map.take() {
        let ret = unsafe { libc::munmap(local_map.as_ptr() as *mut c_void, local_map.byte_len()) };
        if ret != 0 {
            failures.push(format!("local munmap: {}", std::io::Error::last_os_error()));
        }
    }

    if vcb.remote_map_len != 0 {
        let args = [vcb.remote_map.addr(), vcb.remote_map_len as u64, 0, 0, 0, 0];
        match remote_syscall::execute(
            vcb.pid,
            vcb.pid,
            vcb.syscall_ip,
            &mut vcb.orig_regs,
            vcb.signals_blocked,
            libc::SYS_munmap,
            args,
        ) {
            Ok(v) if v < 0 => failures.push(format!("remote munmap returned {}", v)),
            Err(e) => failures.push(format!("remote munmap: {}", e)),
            _ => {}
        }
        vcb.remote_map = RemotePtr::new(0);
        vcb.remote_map_len = 0;
    }

    if vcb.live {
        if let Err(e) = crate::ptrace::poke_bytes(vcb.pid, vma.start, &vcb.code_orig) {
            failures.push(format!("restore original bytes: {}", e));
        } else {
            vcb.live = false;
        }
    }

    if failures.is_empty() {
        debug!("cure completed cleanly for pid {}", vcb.pid);
        Ok(())
    } else {
        let n = failures.len();
        Err(Error::CureFailed(n, failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_files_path_is_lowercase_hex_range() {
        // Exercise only the string-building half; the open/mmap calls need
        // a real tracee with a remote mapping.
        let remote_addr = 0x7f1234500000u64;
        let size = 0x1000usize;
        let path = format!(
            "/proc/{}/map_files/{:x}-{:x}",
            1234,
            remote_addr,
            remote_addr + size as u64
        );
        assert_eq!(path, "/proc/1234/map_files/7f1234500000-7f1234501000");
    }
}
