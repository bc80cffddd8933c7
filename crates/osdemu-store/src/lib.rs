//! Persistence for the OSD target.
//!
//! Three tables share one ordered key/value store (`osd.db`): attributes,
//! the object registry, and the collection membership index. The [`Kv`]
//! trait is the seam between them and the bytes on disk; the default
//! back-end is a single-file log-structured store, and an in-memory map
//! serves tests. Object payloads live outside the KV store as plain files
//! managed by [`DataIo`].
//!
//! [`Kv`]: kv::Kv
//! [`DataIo`]: dataio::DataIo

pub mod attr;
pub mod coll;
pub mod dataio;
pub mod db;
pub mod kv;
pub mod logfile;
pub mod obj;

pub use attr::AttrEntry;
pub use dataio::DataIo;
pub use db::Db;
pub use kv::{Kv, KvError, MemKv};
pub use logfile::LogKv;
pub use obj::IdPage;

/// Errors surfaced by the store subsystems. The dispatcher translates these
/// into sense; `Busy` never escapes (the stores retry internally).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("partition is not empty")]
    NotEmpty,
    #[error("invalid argument")]
    Invalid,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        match err {
            // Busy reaching here means a retry loop was skipped; treat it
            // as corruption rather than looping at an outer layer.
            KvError::Busy => StoreError::Corrupt("busy signal escaped retry loop".into()),
            KvError::Io(e) => StoreError::Io(e),
            KvError::Corrupt(m) => StoreError::Corrupt(m),
        }
    }
}
