//! Image streams (spec §6): append-only record files the core treats as an
//! opaque collaborator contract. A minimal `FileImage` implementation is
//! provided so the crate compiles and its tests exercise real file I/O
//! instead of mocks; the actual on-disk layout belongs to the (external)
//! protobuf-backed image writer this crate only consumes through the
//! `ImageWriter`/`ImageReader` traits.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Image stream kinds named in spec §6.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageKind {
    InetSk,
    UnixSk,
    SkQueues,
    SigAct,
    Itimers,
    Pagemap,
    Pages,
}

impl ImageKind {
    fn file_stem(self) -> &'static str {
        match self {
            ImageKind::InetSk => "inetsk",
            ImageKind::UnixSk => "unixsk",
            ImageKind::SkQueues => "sk-queues",
            ImageKind::SigAct => "sigact",
            ImageKind::Itimers => "itimers",
            ImageKind::Pagemap => "pagemap",
            ImageKind::Pages => "pages",
        }
    }
}

/// `SK_QUEUES`'s small magic-number header (spec §6); every other stream
/// starts directly at offset 0.
pub const SK_QUEUES_MAGIC: u32 = 0x5153_514b; // "SKQ" packed into one word

pub trait ImageWriter {
    fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()>;
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;
}

pub trait ImageReader {
    /// Returns `Ok(None)` at clean end-of-stream, `Ok(Some(record))`
    /// otherwise.
    fn read_record<T: DeserializeOwned>(&mut self) -> Result<Option<T>>;
    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>>;
}

/// One record per line, newline-delimited JSON — simple enough to be a
/// faithful stand-in for the real protobuf-backed format while remaining
/// pure Rust plus `serde_json`, already in the dependency stack.
pub struct FileImage {
    file: File,
}

impl FileImage {
    pub fn create(dir: &Path, kind: ImageKind, pid: Option<libc::pid_t>) -> Result<Self> {
        let path = image_path(dir, kind, pid);
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        if kind == ImageKind::SkQueues {
            file.write_all(&SK_QUEUES_MAGIC.to_le_bytes())?;
        }
        Ok(FileImage { file })
    }

    /// `open_image_ro` (spec §6): open an existing stream for reading,
    /// skipping past `SK_QUEUES`'s magic header if present.
    pub fn open_image_ro(dir: &Path, kind: ImageKind, pid: Option<libc::pid_t>) -> Result<Self> {
        let path = image_path(dir, kind, pid);
        let mut file = File::open(path)?;
        if kind == ImageKind::SkQueues {
            let mut magic = [0u8; 4];
            file.read_exact(&mut magic)?;
            if u32::from_le_bytes(magic) != SK_QUEUES_MAGIC {
                return Err(Error::NetlinkProtocol("bad SK_QUEUES magic".into()));
            }
        }
        Ok(FileImage { file })
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.file.as_raw_fd()
    }
}

fn image_path(dir: &Path, kind: ImageKind, pid: Option<libc::pid_t>) -> PathBuf {
    match pid {
        Some(p) => dir.join(format!("{}-{}.img", kind.file_stem(), p)),
        None => dir.join(format!("{}.img", kind.file_stem())),
    }
}

impl ImageWriter for FileImage {
    fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        Ok(())
    }
}

impl ImageReader for FileImage {
    fn read_record<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.file.read(&mut byte)? {
                0 if line.is_empty() => return Ok(None),
                0 => break,
                _ if byte[0] == b'\n' => break,
                _ => line.push(byte[0]),
            }
        }
        Ok(Some(serde_json::from_slice(&line)?))
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_records() {
        let dir = tempdir().unwrap();
        let rec = Sample { a: 7, b: "x".into() };
        {
            let mut w = FileImage::create(dir.path(), ImageKind::SigAct, None).unwrap();
            w.write_record(&rec).unwrap();
        }
        let mut r = FileImage::open_image_ro(dir.path(), ImageKind::SigAct, None).unwrap();
        let got: Sample = r.read_record::<Sample>().unwrap().unwrap();
        assert_eq!(got, rec);
        assert!(r.read_record::<Sample>().unwrap().is_none());
    }

    #[test]
    fn sk_queues_carries_magic_header() {
        let dir = tempdir().unwrap();
        {
            FileImage::create(dir.path(), ImageKind::SkQueues, None).unwrap();
        }
        let bytes = std::fs::read(dir.path().join("sk-queues.img")).unwrap();
        assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), SK_QUEUES_MAGIC);
    }
}
