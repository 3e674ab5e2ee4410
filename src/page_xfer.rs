//! Page transfer service (spec §6): drains a page-pipe's read end into the
//! pagemap/pages image streams. The dumper only ever talks to this through
//! the `PageTransfer` trait; the splice-based implementation is the one
//! concrete collaborator this crate supplies.

use crate::error::Result;
use crate::image::{FileImage, ImageKind};
use crate::remote_ptr::RemotePtr;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Raw `splice(2)`: the crate keeps the same fallback-to-`libc` posture
/// here as `ptrace.rs` and the abstract-socket code, rather than depend on
/// a nix-version-specific wrapper for a two-line syscall.
unsafe fn raw_splice(fd_in: RawFd, fd_out: RawFd, len: usize) -> Result<usize> {
    let n = libc::splice(
        fd_in,
        std::ptr::null_mut(),
        fd_out,
        std::ptr::null_mut(),
        len,
        libc::SPLICE_F_MOVE,
    );
    if n < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(n as usize)
}

/// One dumped page's address (in the victim) plus its length, recorded into
/// the pagemap stream alongside the raw bytes written to the pages stream.
#[derive(Copy, Clone, Debug)]
pub struct PageRecord {
    pub addr: RemotePtr<u8>,
    pub len: u32,
}

pub trait PageTransfer {
    fn open(&mut self, pid: libc::pid_t) -> Result<()>;
    /// Drain exactly `iov`'s total length of bytes out of `pipe_read_end`
    /// (already spliced into by the parasite) into the pages image, and
    /// record `iov`'s addresses into the pagemap image.
    fn write_pagemap(&mut self, iov: &[PageRecord], pipe_read_end: RawFd) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

pub struct SplicePageTransfer {
    dir: std::path::PathBuf,
    pagemap: Option<FileImage>,
    pages: Option<FileImage>,
}

impl SplicePageTransfer {
    pub fn new(dir: &Path) -> Self {
        SplicePageTransfer {
            dir: dir.to_path_buf(),
            pagemap: None,
            pages: None,
        }
    }
}

impl PageTransfer for SplicePageTransfer {
    fn open(&mut self, pid: libc::pid_t) -> Result<()> {
        self.pagemap = Some(FileImage::create(&self.dir, ImageKind::Pagemap, Some(pid))?);
        self.pages = Some(FileImage::create(&self.dir, ImageKind::Pages, Some(pid))?);
        Ok(())
    }

    fn write_pagemap(&mut self, iov: &[PageRecord], pipe_read_end: RawFd) -> Result<()> {
        use crate::image::ImageWriter;
        let pages = self.pages.as_mut().expect("open() not called");
        let pagemap = self.pagemap.as_mut().expect("open() not called");

        for rec in iov {
            pagemap.write_record(&(rec.addr.addr(), rec.len))?;

            let mut remaining = rec.len as usize;
            while remaining > 0 {
                let n = unsafe { raw_splice(pipe_read_end, pages.as_raw_fd(), remaining)? };
                if n == 0 {
                    break;
                }
                remaining -= n;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.pagemap = None;
        self.pages = None;
        Ok(())
    }
}
