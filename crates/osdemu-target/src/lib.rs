//! An OSD-2 object storage target.
//!
//! [`Target`] owns a root directory with the layout
//!
//! ```text
//! <root>/osd.db       object, attribute and collection tables
//! <root>/dfiles/NN/   payload files (NN = low byte of the oid, hex)
//! <root>/stranded/    detached payloads awaiting cleanup
//! <root>/md/          target metadata
//! ```
//!
//! and exposes a single entry point, [`Target::submit`]: a 200-byte CDB
//! plus a data-out buffer in, data-in buffer plus sense plus SCSI status
//! out. Commands are serialized through one internal lock, which gives
//! every command atomicity of its core operation and embedded attribute
//! directives, and gives commands on the same object their arrival order.

mod capcheck;
mod dispatch;
mod facade;

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use osdemu_proto::defs::{ObjectKind, ROOT_OID, ROOT_PID};
use osdemu_store::{DataIo, Db, StoreError, attr, obj};

pub use dispatch::SubmitResult;

/// Which back-end `osd.db` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Single-file log-structured store under the root.
    #[default]
    File,
    /// Volatile store; the payload files still hit disk.
    Memory,
}

#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub root: PathBuf,
    pub backend: Backend,
    /// Create and format a fresh database when `osd.db` is missing.
    /// When false, a missing database is an error.
    pub format_on_missing_db: bool,
    /// Capacity accounting granularity for the used-capacity attribute.
    pub block_size: u32,
}

impl TargetOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backend: Backend::File,
            format_on_missing_db: true,
            block_size: 512,
        }
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn format_on_missing_db(mut self, yes: bool) -> Self {
        self.format_on_missing_db = yes;
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("root path is not a directory: {0}")]
    BadRoot(PathBuf),
    #[error("database missing at {0} and format-on-missing-db is off")]
    MissingDb(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cooperative cancellation for an in-flight command. The dispatcher polls
/// it between stages and before each I/O batch; a cancelled command
/// answers with aborted-command sense and leaves the store in its pre- or
/// fully post-operation state.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(std::sync::Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub(crate) struct Inner {
    pub db: Db,
    pub data: DataIo,
    pub root: PathBuf,
    pub block_size: u32,
    pub boot_epoch: u16,
    /// Current-command attributes page, rebuilt by every command.
    pub ccap: Ccap,
    /// True while FORMAT OSD runs; unlocks the system-id attribute.
    pub formatting: bool,
}

/// State behind the synthesized page `0xFFFF_FFFE`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Ccap {
    pub ricv: [u8; 20],
    pub object_type: u8,
    pub pid: u64,
    pub oid: u64,
    pub append_offset: u64,
}

impl Ccap {
    pub fn set(&mut self, kind: ObjectKind, pid: u64, oid: u64, append_offset: u64) {
        *self = Ccap {
            ricv: [0; 20],
            object_type: kind as u8,
            pid,
            oid,
            append_offset,
        };
    }
}

pub struct Target {
    inner: Mutex<Inner>,
}

const DB_NAME: &str = "osd.db";
const MD_DIR: &str = "md";
const BOOT_EPOCH_META: &str = "boot_epoch";

impl Target {
    /// Open a target root, creating the directory layout and database as
    /// the options allow. Each open advances the device boot epoch.
    pub fn open(options: TargetOptions) -> Result<Self, TargetError> {
        let root = &options.root;
        if root.exists() && !root.is_dir() {
            return Err(TargetError::BadRoot(root.clone()));
        }
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join(MD_DIR))?;

        let data = DataIo::new(root);
        data.create_layout()?;

        let db_path = root.join(DB_NAME);
        let mut db = match options.backend {
            Backend::Memory => Db::open_memory(),
            Backend::File => {
                if !db_path.exists() && !options.format_on_missing_db {
                    return Err(TargetError::MissingDb(db_path));
                }
                Db::open_file(&db_path)?
            }
        };

        let boot_epoch = match db.meta_get(BOOT_EPOCH_META)? {
            Some(raw) if raw.len() == 2 => u16::from_be_bytes([raw[0], raw[1]]).wrapping_add(1),
            _ => 1,
        };
        db.meta_put(BOOT_EPOCH_META, &boot_epoch.to_be_bytes())?;

        let mut inner = Inner {
            db,
            data,
            root: root.clone(),
            block_size: options.block_size.max(1),
            boot_epoch,
            ccap: Ccap::default(),
            formatting: false,
        };
        inner.ensure_root_object()?;
        log::info!(
            "opened target at {} (boot epoch {})",
            root.display(),
            boot_epoch
        );
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Execute one command.
    pub fn submit(&self, cdb: &[u8], data_out: &[u8]) -> SubmitResult {
        self.submit_with_cancel(cdb, data_out, &CancelToken::new())
    }

    /// Execute one command with a cooperative cancel token.
    pub fn submit_with_cancel(
        &self,
        cdb: &[u8],
        data_out: &[u8],
        cancel: &CancelToken,
    ) -> SubmitResult {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        dispatch::execute(&mut inner, cdb, data_out, cancel)
    }

    /// Flush everything and drop the handle.
    pub fn close(self) -> Result<(), TargetError> {
        let mut inner = self.inner.into_inner().unwrap_or_else(|e| e.into_inner());
        inner.db.flush()?;
        log::info!("closed target at {}", inner.root.display());
        Ok(())
    }
}

impl Inner {
    /// Register the root object and stamp its creation time on first open.
    fn ensure_root_object(&mut self) -> Result<(), StoreError> {
        if obj::is_present(&self.db, ROOT_PID, ROOT_OID)? {
            return Ok(());
        }
        obj::insert(&mut self.db, ROOT_PID, ROOT_OID, ObjectKind::Root)?;
        self.stamp_ctime(ROOT_PID, ROOT_OID, ObjectKind::Root)
    }

    /// Record the creation timestamp attribute for a freshly created
    /// entity.
    pub(crate) fn stamp_ctime(
        &mut self,
        pid: u64,
        oid: u64,
        kind: ObjectKind,
    ) -> Result<(), StoreError> {
        let mut ts = [0u8; osdemu_proto::defs::UTSAP_CTIME_LEN];
        osdemu_proto::endian::set_u48(&mut ts, 0, now_ms());
        attr::set(
            &mut self.db,
            pid,
            oid,
            kind.timestamp_page(),
            osdemu_proto::defs::UTSAP_CTIME,
            &ts,
        )
    }

    /// Stored creation time of an entity, if stamped.
    pub(crate) fn ctime_ms(&self, pid: u64, oid: u64, kind: ObjectKind) -> Option<u64> {
        attr::get_one(
            &self.db,
            pid,
            oid,
            kind.timestamp_page(),
            osdemu_proto::defs::UTSAP_CTIME,
        )
        .ok()
        .filter(|v| v.len() == osdemu_proto::defs::UTSAP_CTIME_LEN)
        .map(|v| osdemu_proto::endian::get_u48(&v, 0))
    }
}

/// Milliseconds since the epoch, truncated to the 48-bit wire width.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64 & 0xFFFF_FFFF_FFFF
}
