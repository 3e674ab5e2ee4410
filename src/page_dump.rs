//! Page dumper (spec §4.6): walks `/proc/<pid>/pagemap` for each candidate
//! VMA, batches dumpable addresses into page-pipes, and drives `DUMPPAGES`
//! in the parasite to `vmsplice` them out.

use crate::config::Config;
use crate::error::Result;
use crate::page_xfer::{PageRecord, PageTransfer};
use crate::parasite::commands::{CommandCode, DumpPagesArgs};
use crate::parasite::control;
use crate::remote_ptr::RemotePtr;
use crate::victim::control_block::VictimControlBlock;
use crate::victim::vma::{Backing, Vma};
use libc::pid_t;
use nix::unistd::{close, pipe};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::RawFd;

const PAGE_SIZE: u64 = 4096;
/// Pagemap entry width in bytes (spec §6); design note (c) flags this as an
/// assumption rather than a portably-probed constant.
const PAGEMAP_ENTRY_WIDTH: u64 = 8;

bitflags::bitflags! {
    /// The bits of a `/proc/<pid>/pagemap` entry this crate cares about.
    struct PmeFlags: u64 {
        const PRESENT = 1 << 63;
        const SWAP = 1 << 62;
        const FILE = 1 << 61;
    }
}

#[derive(Copy, Clone, Debug)]
struct PageMapEntry {
    raw: u64,
}

impl PageMapEntry {
    fn flags(self) -> PmeFlags {
        PmeFlags::from_bits_truncate(self.raw)
    }
    fn present(self) -> bool {
        self.flags().contains(PmeFlags::PRESENT)
    }
    fn swap(self) -> bool {
        self.flags().contains(PmeFlags::SWAP)
    }
    fn file(self) -> bool {
        self.flags().contains(PmeFlags::FILE)
    }
}

/// Reads the pagemap entries covering `vma`. Loops on short reads (design
/// note (b): `generate_iovs` in the original must not assume one `read`
/// call returns the whole range).
fn read_pagemap(pid: pid_t, vma: &Vma) -> Result<Vec<PageMapEntry>> {
    let mut file = File::open(format!("/proc/{}/pagemap", pid))?;
    file.seek(SeekFrom::Start(vma.start / PAGE_SIZE * PAGEMAP_ENTRY_WIDTH))?;

    let npages = (vma.len() / PAGE_SIZE) as usize;
    let mut buf = vec![0u8; npages * PAGEMAP_ENTRY_WIDTH as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled - filled % PAGEMAP_ENTRY_WIDTH as usize);

    Ok(buf
        .chunks_exact(PAGEMAP_ENTRY_WIDTH as usize)
        .map(|c| PageMapEntry {
            raw: u64::from_ne_bytes(c.try_into().expect("chunk is 8 bytes")),
        })
        .collect())
}

/// Decide whether one page should be dumped (spec §4.6 step 1).
fn should_dump(vma: &Vma, pme: PageMapEntry) -> bool {
    if vma.backing == Backing::Vdso {
        return true;
    }
    if vma.private && vma.backing == Backing::File && pme.file() {
        return false;
    }
    pme.present() || pme.swap()
}

/// Candidate VMAs for the dumper: private mappings that could hold
/// genuinely modified or swapped-out pages (spec §4.6 step 1).
fn is_candidate(vma: &Vma) -> bool {
    vma.private
        && matches!(
            vma.backing,
            Backing::Anonymous | Backing::File | Backing::Heap | Backing::Stack | Backing::Vdso
        )
}

/// One batch of addresses ready to hand to the parasite: the pipe pair the
/// parasite will `vmsplice` into, and the iovec list (remote addresses +
/// lengths) describing what to splice.
struct PagePipeBuffer {
    read_fd: RawFd,
    write_fd: RawFd,
    iovs: Vec<(RemotePtr<u8>, u32)>,
    capacity_used: usize,
}

impl PagePipeBuffer {
    fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        Ok(PagePipeBuffer {
            read_fd,
            write_fd,
            iovs: Vec::new(),
            capacity_used: 0,
        })
    }
}

/// Group a VMA's dumpable pages into contiguous runs, then pack those runs
/// into page-pipe buffers bounded by `cfg.page_pipe_max_iovs` and
/// `cfg.page_pipe_capacity` (spec §4.6 step 2).
fn build_page_pipes(
    vma: &Vma,
    pmes: &[PageMapEntry],
    cfg: &Config,
    buffers: &mut Vec<PagePipeBuffer>,
) -> Result<()> {
    let mut addr = vma.start;
    let mut run_start: Option<u64> = None;

    let mut flush_run = |buffers: &mut Vec<PagePipeBuffer>, start: u64, end: u64| -> Result<()> {
        let len = (end - start) as u32;
        let need_new = match buffers.last() {
            None => true,
            Some(b) => {
                b.iovs.len() >= cfg.page_pipe_max_iovs
                    || b.capacity_used + len as usize > cfg.page_pipe_capacity
            }
        };
        if need_new {
            buffers.push(PagePipeBuffer::new()?);
        }
        let buf = buffers.last_mut().expect("just pushed");
        buf.capacity_used += len as usize;
        buf.iovs.push((RemotePtr::new(start), len));
        Ok(())
    };

    for pme in pmes {
        if should_dump(vma, *pme) {
            run_start.get_or_insert(addr);
        } else if let Some(start) = run_start.take() {
            flush_run(buffers, start, addr)?;
        }
        addr += PAGE_SIZE;
    }
    if let Some(start) = run_start.take() {
        flush_run(buffers, start, addr)?;
    }
    Ok(())
}

/// Drive `DUMPPAGES` over every buffer for one candidate VMA and hand the
/// spliced pipes off to the page transfer service (spec §4.6 steps 3-4).
fn drain_buffers(
    vcb: &mut VictimControlBlock,
    buffers: Vec<PagePipeBuffer>,
    xfer: &mut dyn PageTransfer,
) -> Result<()> {
    for mut buf in buffers {
        control::send_fd(vcb.tsock.expect("parasite not initialised"), buf.write_fd)?;
        close(buf.write_fd)?;
        buf.write_fd = -1;

        let iov_words: Vec<libc::iovec> = buf
            .iovs
            .iter()
            .map(|(addr, len)| libc::iovec {
                iov_base: addr.addr() as *mut libc::c_void,
                iov_len: *len as usize,
            })
            .collect();
        let tail = unsafe {
            std::slice::from_raw_parts(
                iov_words.as_ptr() as *const u8,
                iov_words.len() * std::mem::size_of::<libc::iovec>(),
            )
        };
        let header = DumpPagesArgs {
            nr: buf.iovs.len() as u32,
            off: 0,
        };
        control::dispatch_with_tail(vcb, vcb.pid, CommandCode::DumpPages, &header, tail)?;

        let records: Vec<PageRecord> = buf
            .iovs
            .iter()
            .map(|(addr, len)| PageRecord { addr: *addr, len: *len })
            .collect();
        xfer.write_pagemap(&records, buf.read_fd)?;

        close(buf.read_fd)?;
    }
    Ok(())
}

/// Full page-dump pass over every candidate VMA (spec §4.6).
pub fn dump_task_pages(
    vcb: &mut VictimControlBlock,
    vmas: &[Vma],
    cfg: &Config,
    xfer: &mut dyn PageTransfer,
) -> Result<()> {
    xfer.open(vcb.pid)?;
    for vma in vmas.iter().filter(|v| is_candidate(v)) {
        let pmes = read_pagemap(vcb.pid, vma)?;
        let mut buffers = Vec::new();
        build_page_pipes(vma, &pmes, cfg, &mut buffers)?;
        drain_buffers(vcb, buffers, xfer)?;
    }
    xfer.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_vma() -> Vma {
        Vma {
            start: 0x1000,
            end: 0x4000,
            readable: true,
            writable: true,
            executable: false,
            private: true,
            backing: Backing::Anonymous,
            path: None,
        }
    }

    #[test]
    fn vdso_pages_always_dumped() {
        let mut vma = anon_vma();
        vma.backing = Backing::Vdso;
        let pme = PageMapEntry { raw: 0 };
        assert!(should_dump(&vma, pme));
    }

    #[test]
    fn file_identical_private_pages_are_skipped() {
        let mut vma = anon_vma();
        vma.backing = Backing::File;
        let pme = PageMapEntry { raw: PmeFlags::FILE.bits() };
        assert!(!should_dump(&vma, pme));
    }

    #[test]
    fn present_or_swapped_pages_are_dumped() {
        let vma = anon_vma();
        assert!(should_dump(&vma, PageMapEntry { raw: PmeFlags::PRESENT.bits() }));
        assert!(should_dump(&vma, PageMapEntry { raw: PmeFlags::SWAP.bits() }));
        assert!(!should_dump(&vma, PageMapEntry { raw: 0 }));
    }

    #[test]
    fn build_page_pipes_groups_contiguous_runs() {
        let vma = anon_vma();
        let pmes = vec![
            PageMapEntry { raw: PmeFlags::PRESENT.bits() },
            PageMapEntry { raw: PmeFlags::PRESENT.bits() },
            PageMapEntry { raw: 0 },
        ];
        let cfg = Config::default();
        let mut buffers = Vec::new();
        build_page_pipes(&vma, &pmes, &cfg, &mut buffers).unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].iovs.len(), 1);
        assert_eq!(buffers[0].iovs[0].1, (PAGE_SIZE * 2) as u32);
    }

    #[test]
    fn build_page_pipes_rotates_on_iov_cap() {
        let vma = anon_vma();
        let pmes = vec![
            PageMapEntry { raw: PmeFlags::PRESENT.bits() },
            PageMapEntry { raw: 0 },
            PageMapEntry { raw: PmeFlags::PRESENT.bits() },
        ];
        let mut cfg = Config::default();
        cfg.page_pipe_max_iovs = 1;
        let mut buffers = Vec::new();
        build_page_pipes(&vma, &pmes, &cfg, &mut buffers).unwrap();
        assert_eq!(buffers.len(), 2);
    }
}
