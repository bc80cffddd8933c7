//! Single-file log-structured back-end for `osd.db`.
//!
//! The file is a 16-byte header followed by append-only records:
//!
//! ```text
//! offset  size  field
//!  0      1     op (1 = put, 2 = delete)
//!  1      2     key length (big-endian)
//!  3      4     value length (big-endian, zero for delete)
//!  7      klen  key
//!  7+klen vlen  value
//! ```
//!
//! The whole index lives in memory (attribute values are capped at 64 KiB
//! and an emulator's namespace is small); opening replays the log, and a
//! compaction pass rewrites the file once more than half of it is garbage.
//! A torn tail record from a crash is dropped at replay with a warning.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::kv::{Kv, KvError};
use std::collections::BTreeMap;

const MAGIC: &[u8; 8] = b"OSDEMUDB";
const VERSION: u16 = 1;
const HEADER_LEN: u64 = 16;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

const RECORD_HDR_LEN: usize = 7;
/// Compact when at least this much garbage has accumulated and it
/// outweighs the live data.
const COMPACT_MIN_GARBAGE: u64 = 1 << 20;

pub struct LogKv {
    path: PathBuf,
    file: BufWriter<File>,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    live_bytes: u64,
    total_bytes: u64,
}

impl LogKv {
    /// Open an existing store or create an empty one.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut kv = Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            index: BTreeMap::new(),
            live_bytes: 0,
            total_bytes: HEADER_LEN,
        };
        let len = kv.file.get_ref().metadata()?.len();
        if len == 0 {
            kv.write_header()?;
        } else {
            kv.replay()?;
        }
        if kv.should_compact() {
            kv.compact()?;
        }
        Ok(kv)
    }

    fn write_header(&mut self) -> Result<(), KvError> {
        self.file.flush()?;
        self.file.get_ref().set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(MAGIC)?;
        self.file.write_all(&VERSION.to_be_bytes())?;
        self.file.write_all(&[0u8; 6])?;
        self.file.flush()?;
        self.total_bytes = HEADER_LEN;
        self.live_bytes = 0;
        Ok(())
    }

    fn replay(&mut self) -> Result<(), KvError> {
        let mut reader = BufReader::new(self.file.get_ref().try_clone()?);
        reader.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_LEN as usize];
        reader.read_exact(&mut header).map_err(|_| {
            KvError::Corrupt(format!("{}: truncated header", self.path.display()))
        })?;
        if &header[0..8] != MAGIC {
            return Err(KvError::Corrupt(format!(
                "{}: bad magic",
                self.path.display()
            )));
        }
        let version = u16::from_be_bytes([header[8], header[9]]);
        if version != VERSION {
            return Err(KvError::Corrupt(format!(
                "{}: unsupported version {}",
                self.path.display(),
                version
            )));
        }

        let mut offset = HEADER_LEN;
        loop {
            let mut rec_hdr = [0u8; RECORD_HDR_LEN];
            match reader.read_exact(&mut rec_hdr) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let op = rec_hdr[0];
            let klen = u16::from_be_bytes([rec_hdr[1], rec_hdr[2]]) as usize;
            let vlen = u32::from_be_bytes([rec_hdr[3], rec_hdr[4], rec_hdr[5], rec_hdr[6]]) as usize;
            let mut key = vec![0u8; klen];
            let mut value = vec![0u8; vlen];
            let body = reader
                .read_exact(&mut key)
                .and_then(|_| reader.read_exact(&mut value));
            if body.is_err() || !matches!(op, OP_PUT | OP_DELETE) {
                log::warn!(
                    "{}: dropping torn record at byte {}",
                    self.path.display(),
                    offset
                );
                self.file.get_ref().set_len(offset)?;
                break;
            }
            let rec_len = (RECORD_HDR_LEN + klen + vlen) as u64;
            match op {
                OP_PUT => {
                    if let Some(old) = self.index.insert(key.clone(), value) {
                        self.live_bytes -=
                            (RECORD_HDR_LEN + key.len() + old.len()) as u64;
                    }
                    self.live_bytes += rec_len;
                }
                _ => {
                    if let Some(old) = self.index.remove(&key) {
                        self.live_bytes -=
                            (RECORD_HDR_LEN + key.len() + old.len()) as u64;
                    }
                }
            }
            offset += rec_len;
        }
        self.total_bytes = offset;
        self.file.seek(SeekFrom::Start(offset))?;
        log::debug!(
            "{}: replayed {} entries, {}b live of {}b",
            self.path.display(),
            self.index.len(),
            self.live_bytes,
            self.total_bytes
        );
        Ok(())
    }

    fn append(&mut self, op: u8, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        debug_assert!(key.len() <= u16::MAX as usize);
        let mut rec = Vec::with_capacity(RECORD_HDR_LEN + key.len() + value.len());
        rec.push(op);
        rec.extend_from_slice(&(key.len() as u16).to_be_bytes());
        rec.extend_from_slice(&(value.len() as u32).to_be_bytes());
        rec.extend_from_slice(key);
        rec.extend_from_slice(value);
        self.file.write_all(&rec)?;
        self.total_bytes += rec.len() as u64;
        Ok(())
    }

    fn should_compact(&self) -> bool {
        let garbage = self.total_bytes - HEADER_LEN - self.live_bytes.min(self.total_bytes);
        garbage > COMPACT_MIN_GARBAGE && garbage > self.live_bytes
    }

    /// Rewrite the log with only live entries, via a temp file and rename.
    pub fn compact(&mut self) -> Result<(), KvError> {
        self.file.flush()?;
        let tmp_path = self.path.with_extension("compact");
        {
            let tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            writer.write_all(MAGIC)?;
            writer.write_all(&VERSION.to_be_bytes())?;
            writer.write_all(&[0u8; 6])?;
            for (key, value) in &self.index {
                writer.write_all(&[OP_PUT])?;
                writer.write_all(&(key.len() as u16).to_be_bytes())?;
                writer.write_all(&(value.len() as u32).to_be_bytes())?;
                writer.write_all(key)?;
                writer.write_all(value)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let len = file.metadata()?.len();
        self.file = BufWriter::new(file);
        self.file.seek(SeekFrom::End(0))?;
        self.live_bytes = len - HEADER_LEN;
        self.total_bytes = len;
        log::debug!("{}: compacted to {}b", self.path.display(), len);
        Ok(())
    }
}

impl Kv for LogKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.index.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        if key.len() > u16::MAX as usize {
            return Err(KvError::Corrupt("key too long".into()));
        }
        self.append(OP_PUT, key, value)?;
        let rec_len = (RECORD_HDR_LEN + key.len() + value.len()) as u64;
        if let Some(old) = self.index.insert(key.to_vec(), value.to_vec()) {
            self.live_bytes -= (RECORD_HDR_LEN + key.len() + old.len()) as u64;
        }
        self.live_bytes += rec_len;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KvError> {
        if self.index.contains_key(key) {
            self.append(OP_DELETE, key, &[])?;
            if let Some(old) = self.index.remove(key) {
                self.live_bytes -= (RECORD_HDR_LEN + key.len() + old.len()) as u64;
            }
        }
        Ok(())
    }

    fn scan(
        &self,
        lo: &[u8],
        hi: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        for (k, v) in self.index.range(lo.to_vec()..hi.to_vec()) {
            if !visit(k, v) {
                break;
            }
        }
        Ok(())
    }

    fn last(&self, lo: &[u8], hi: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        Ok(self
            .index
            .range(lo.to_vec()..hi.to_vec())
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn flush(&mut self) -> Result<(), KvError> {
        if self.should_compact() {
            self.compact()?;
        }
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), KvError> {
        self.index.clear();
        self.write_header()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::prefix_end;
    use pretty_assertions::assert_eq;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osd.db");
        {
            let mut kv = LogKv::open(&path).unwrap();
            kv.put(b"alpha", b"1").unwrap();
            kv.put(b"beta", b"2").unwrap();
            kv.delete(b"alpha").unwrap();
            kv.put(b"beta", b"3").unwrap();
            kv.flush().unwrap();
        }
        let kv = LogKv::open(&path).unwrap();
        assert_eq!(kv.get(b"alpha").unwrap(), None);
        assert_eq!(kv.get(b"beta").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osd.db");
        {
            let mut kv = LogKv::open(&path).unwrap();
            kv.put(b"key", b"value").unwrap();
            kv.flush().unwrap();
        }
        // Append half a record.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[OP_PUT, 0, 4]).unwrap();
        }
        let kv = LogKv::open(&path).unwrap();
        assert_eq!(kv.get(b"key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn compaction_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osd.db");
        let mut kv = LogKv::open(&path).unwrap();
        for round in 0..4u8 {
            for i in 0..64u8 {
                kv.put(&[b'k', i], &vec![round; 128]).unwrap();
            }
        }
        kv.compact().unwrap();
        for i in 0..64u8 {
            assert_eq!(kv.get(&[b'k', i]).unwrap(), Some(vec![3u8; 128]));
        }
        // Everything still scans in order after the rewrite.
        let mut count = 0;
        kv.scan(b"k", &prefix_end(b"k"), &mut |_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 64);
    }

    #[test]
    fn clear_empties_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osd.db");
        let mut kv = LogKv::open(&path).unwrap();
        kv.put(b"key", b"value").unwrap();
        kv.clear().unwrap();
        assert_eq!(kv.get(b"key").unwrap(), None);
        drop(kv);
        let kv = LogKv::open(&path).unwrap();
        assert_eq!(kv.get(b"key").unwrap(), None);
    }
}
