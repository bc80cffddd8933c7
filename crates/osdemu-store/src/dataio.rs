//! Object payload storage and the data I/O engine.
//!
//! Payloads are plain files under `<root>/dfiles/NN/<pid>.<oid>` where `NN`
//! is the low byte of the oid in hex, fanning the namespace out over 256
//! directories. All I/O is positional; reads that run past end-of-object
//! report the short length so the dispatcher can raise the recovered-error
//! sense, and writes extend the file.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};

use osdemu_proto::defs::{USEROBJECT_OID_LB, USEROBJECT_PID_LB};

#[derive(Debug, thiserror::Error)]
pub enum DataIoError {
    /// pid or oid below the user-object lower bound.
    #[error("invalid object identifier ({pid:#x}, {oid:#x})")]
    InvalidId { pid: u64, oid: u64 },
    /// The payload file does not exist.
    #[error("no payload for ({pid:#x}, {oid:#x})")]
    NoObject { pid: u64, oid: u64 },
    #[error("payload for ({pid:#x}, {oid:#x}) already exists")]
    Exists { pid: u64, oid: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

const DFILES: &str = "dfiles";
const STRANDED: &str = "stranded";

pub struct DataIo {
    root: PathBuf,
}

impl DataIo {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Create `dfiles` (with its 256 fan-out subdirectories) and
    /// `stranded` under the root.
    pub fn create_layout(&self) -> io::Result<()> {
        for nn in 0..=0xFFu32 {
            fs::create_dir_all(self.root.join(DFILES).join(format!("{nn:02x}")))?;
        }
        fs::create_dir_all(self.root.join(STRANDED))?;
        Ok(())
    }

    /// Remove every payload file (FORMAT OSD) and empty `stranded`.
    pub fn clear(&self) -> io::Result<()> {
        for dir in [DFILES, STRANDED] {
            let path = self.root.join(dir);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        self.create_layout()
    }

    fn dfile_path(&self, pid: u64, oid: u64) -> PathBuf {
        self.root
            .join(DFILES)
            .join(format!("{:02x}", oid & 0xFF))
            .join(format!("{pid:x}.{oid:x}"))
    }

    fn check_ids(&self, pid: u64, oid: u64) -> Result<(), DataIoError> {
        if pid < USEROBJECT_PID_LB || oid < USEROBJECT_OID_LB {
            return Err(DataIoError::InvalidId { pid, oid });
        }
        Ok(())
    }

    fn open(&self, pid: u64, oid: u64) -> Result<File, DataIoError> {
        self.check_ids(pid, oid)?;
        let path = self.dfile_path(pid, oid);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => DataIoError::NoObject { pid, oid },
                _ => DataIoError::Io(e),
            })
    }

    pub fn create(&self, pid: u64, oid: u64) -> Result<(), DataIoError> {
        self.check_ids(pid, oid)?;
        let path = self.dfile_path(pid, oid);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map(drop)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => DataIoError::Exists { pid, oid },
                _ => DataIoError::Io(e),
            })
    }

    pub fn exists(&self, pid: u64, oid: u64) -> bool {
        self.dfile_path(pid, oid).is_file()
    }

    pub fn remove(&self, pid: u64, oid: u64) -> Result<(), DataIoError> {
        self.check_ids(pid, oid)?;
        fs::remove_file(self.dfile_path(pid, oid)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DataIoError::NoObject { pid, oid },
            _ => DataIoError::Io(e),
        })
    }

    pub fn truncate(&self, pid: u64, oid: u64, len: u64) -> Result<(), DataIoError> {
        let file = self.open(pid, oid)?;
        file.set_len(len)?;
        Ok(())
    }

    pub fn logical_len(&self, pid: u64, oid: u64) -> Result<u64, DataIoError> {
        let file = self.open(pid, oid)?;
        Ok(file.metadata()?.len())
    }

    /// Bytes the payload actually occupies (allocation-aware, 512-byte
    /// units as reported by the file system).
    pub fn used_capacity(&self, pid: u64, oid: u64) -> Result<u64, DataIoError> {
        let file = self.open(pid, oid)?;
        Ok(file.metadata()?.blocks() * 512)
    }

    /// Total and used bytes of the file system holding the root.
    pub fn device_capacity(&self) -> io::Result<(u64, u64)> {
        let cpath = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "root path contains NUL"))?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(cpath.as_ptr(), &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let frsize = st.f_frsize as u64;
        let total = st.f_blocks as u64 * frsize;
        let free = st.f_bfree as u64 * frsize;
        Ok((total, total.saturating_sub(free)))
    }

    pub fn flush(&self, pid: u64, oid: u64) -> Result<(), DataIoError> {
        let file = self.open(pid, oid)?;
        file.sync_all()?;
        Ok(())
    }

    /// Contiguous read into `out`. Returns the bytes actually present;
    /// everything past end-of-object is zero-filled.
    pub fn read_contig(
        &self,
        pid: u64,
        oid: u64,
        offset: u64,
        out: &mut [u8],
    ) -> Result<u64, DataIoError> {
        let file = self.open(pid, oid)?;
        let got = read_full_at(&file, out, offset)?;
        out[got..].fill(0);
        Ok(got as u64)
    }

    /// Scatter/gather read: each `(offset, len)` pair fills the next slice
    /// of `out`; the pair offsets are relative to `base`. Returns the bytes
    /// actually present across all segments.
    pub fn read_sgl(
        &self,
        pid: u64,
        oid: u64,
        base: u64,
        pairs: &[(u64, u64)],
        out: &mut [u8],
    ) -> Result<u64, DataIoError> {
        let file = self.open(pid, oid)?;
        let mut data_off = 0usize;
        let mut transferred = 0u64;
        for &(seg_off, seg_len) in pairs {
            let dst = &mut out[data_off..data_off + seg_len as usize];
            let got = read_full_at(&file, dst, base + seg_off)?;
            dst[got..].fill(0);
            transferred += got as u64;
            data_off += seg_len as usize;
        }
        Ok(transferred)
    }

    pub fn write_contig(
        &self,
        pid: u64,
        oid: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DataIoError> {
        let file = self.open(pid, oid)?;
        file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Scatter/gather write: consecutive slices of `data` land at
    /// `base + offset_i`.
    pub fn write_sgl(
        &self,
        pid: u64,
        oid: u64,
        base: u64,
        pairs: &[(u64, u64)],
        data: &[u8],
    ) -> Result<(), DataIoError> {
        let file = self.open(pid, oid)?;
        let mut data_off = 0usize;
        for &(seg_off, seg_len) in pairs {
            let src = &data[data_off..data_off + seg_len as usize];
            file.write_all_at(src, base + seg_off)?;
            data_off += seg_len as usize;
        }
        Ok(())
    }
}

/// `read_at` until the buffer is full or end-of-file; returns the bytes
/// read. Short kernel reads inside the file are retried.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PID: u64 = 0x10000;
    const OID: u64 = 0x10000;

    fn io() -> (tempfile::TempDir, DataIo) {
        let dir = tempfile::tempdir().unwrap();
        let io = DataIo::new(dir.path());
        io.create_layout().unwrap();
        (dir, io)
    }

    #[test]
    fn ids_are_validated_before_any_open() {
        let (_dir, io) = io();
        assert!(matches!(
            io.read_contig(0xFF, OID, 0, &mut [0u8; 4]),
            Err(DataIoError::InvalidId { .. })
        ));
        assert!(matches!(
            io.create(PID, 0xFF),
            Err(DataIoError::InvalidId { .. })
        ));
    }

    #[test]
    fn create_write_read_remove() {
        let (_dir, io) = io();
        io.create(PID, OID).unwrap();
        assert!(matches!(
            io.create(PID, OID),
            Err(DataIoError::Exists { .. })
        ));
        io.write_contig(PID, OID, 0, &[0xAA; 100]).unwrap();
        assert_eq!(io.logical_len(PID, OID).unwrap(), 100);

        let mut out = [0u8; 100];
        let got = io.read_contig(PID, OID, 0, &mut out).unwrap();
        assert_eq!(got, 100);
        assert_eq!(out, [0xAA; 100]);

        io.remove(PID, OID).unwrap();
        assert!(matches!(
            io.remove(PID, OID),
            Err(DataIoError::NoObject { .. })
        ));
    }

    #[test]
    fn short_read_zero_fills() {
        let (_dir, io) = io();
        io.create(PID, OID).unwrap();
        io.write_contig(PID, OID, 0, &[0xAA; 200]).unwrap();

        let mut out = [0x55u8; 200];
        let got = io.read_contig(PID, OID, 50, &mut out).unwrap();
        assert_eq!(got, 150);
        assert_eq!(&out[..150], &[0xAA; 150][..]);
        assert_eq!(&out[150..], &[0x00; 50][..]);
    }

    #[test]
    fn write_past_end_extends() {
        let (_dir, io) = io();
        io.create(PID, OID).unwrap();
        io.write_contig(PID, OID, 1000, b"tail").unwrap();
        assert_eq!(io.logical_len(PID, OID).unwrap(), 1004);
        let mut out = [0xFFu8; 4];
        io.read_contig(PID, OID, 500, &mut out).unwrap();
        assert_eq!(out, [0u8; 4]); // hole reads back as zeros
    }

    #[test]
    fn sgl_round_trip() {
        let (_dir, io) = io();
        io.create(PID, OID).unwrap();
        let pairs = [(0u64, 4u64), (100, 4)];
        io.write_sgl(PID, OID, 0, &pairs, b"aaaabbbb").unwrap();

        let mut out = [0u8; 8];
        let got = io.read_sgl(PID, OID, 0, &pairs, &mut out).unwrap();
        assert_eq!(got, 8);
        assert_eq!(&out, b"aaaabbbb");
        assert_eq!(io.logical_len(PID, OID).unwrap(), 104);
    }

    #[test]
    fn truncate_shrinks() {
        let (_dir, io) = io();
        io.create(PID, OID).unwrap();
        io.write_contig(PID, OID, 0, &[1; 100]).unwrap();
        io.truncate(PID, OID, 10).unwrap();
        assert_eq!(io.logical_len(PID, OID).unwrap(), 10);
    }

    #[test]
    fn device_capacity_is_sane() {
        let (_dir, io) = io();
        let (total, used) = io.device_capacity().unwrap();
        assert!(total > 0);
        assert!(used <= total);
    }
}
