//! nodefile — a hierarchical, schemaless node store in a single paged
//! file.
//!
//! The file is partitioned into fixed-size pages of fixed-size records.
//! Every path in the hierarchy lives either inline in its parent's
//! record or in a record of its own, addressed by (page, record). Large
//! records span multiple records through a chunk table in their header;
//! records with many children embed a binary B+tree instead of a linear
//! child list. Writes are guarded by a hierarchical path lock manager
//! and mutate records in place when possible, relocating and patching
//! the parent chain otherwise.
//!
//! ```no_run
//! use nodefile::NodeValue;
//!
//! let db = nodefile::open("data.db")?;
//! db.set(
//!     "game/config",
//!     NodeValue::object([
//!         ("name", NodeValue::str("g")),
//!         ("max_players", NodeValue::Number(10.0)),
//!     ]),
//! )?;
//! let config = db.get_value("game/config")?;
//! # Ok::<(), nodefile::Error>(())
//! ```

use std::path::Path;
use std::time::Duration;

mod btree;
mod cache;
mod codec;
mod engine;
mod error;
mod fst;
mod id;
mod kit;
mod lock;
mod path;
mod reader;
mod storage;
mod value;
mod writer;

pub use codec::{FLAG_KEY_TREE, FLAG_READ_LOCK, FLAG_WRITE_LOCK};
pub use engine::{
    ChangeEvent, ChangeObserver, Children, QueryCriterion, QueryOp, RecordSummary, StorageEngine,
    StorageStats,
};
pub use error::{Error, FormatError, Result};
pub use lock::DEFAULT_LOCK_TIMEOUT;
pub use path::{PathKey, MAX_KEY_LEN};
pub use reader::{NodeInfo, ValueFilter};
pub use storage::{NodeAllocation, RecordAddress, StorageRange};
pub use value::{NodeValue, ValueType};

use storage::{FileHeader, PagedFile};

/// Records per page unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: u32 = 1024;

/// Bytes per record unless configured otherwise.
pub const DEFAULT_RECORD_SIZE: u32 = 128;

/// Largest value stored inline in its parent record, in bytes. Bounded
/// above by 64: the wire format keeps inline lengths in 6 bits.
pub const DEFAULT_MAX_INLINE_VALUE_SIZE: u16 = 50;

/// Geometry and behavior of one database.
#[derive(Debug, Clone, Copy)]
pub struct DbSettings {
    /// Records per page
    pub page_size: u32,
    /// Bytes per record
    pub record_size: u32,
    /// Values up to this many bytes stay inline in the parent record
    pub max_inline_value_size: u16,
    /// How long a granted lock may be held before it expires
    pub lock_timeout: Duration,
    /// Drop null entries from stored arrays instead of rejecting them
    pub remove_void_properties: bool,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            record_size: DEFAULT_RECORD_SIZE,
            max_inline_value_size: DEFAULT_MAX_INLINE_VALUE_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            remove_void_properties: false,
        }
    }
}

impl DbSettings {
    fn validate(&self) -> Result<()> {
        if self.page_size < 8 || self.page_size > u16::MAX as u32 {
            return Err(Error::Config("page_size must be in 8..=65535 records"));
        }
        if self.record_size < 32 || self.record_size > 32768 {
            return Err(Error::Config("record_size must be in 32..=32768 bytes"));
        }
        if self.max_inline_value_size < 4 || self.max_inline_value_size > 64 {
            return Err(Error::Config(
                "max_inline_value_size must be in 4..=64 bytes",
            ));
        }
        Ok(())
    }
}

/// Builder for opening or creating a database.
///
/// Geometry settings only apply when creating; an existing file's stored
/// geometry always wins.
pub struct OpenOptions {
    settings: DbSettings,
    observer: Option<Box<dyn ChangeObserver>>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            settings: DbSettings::default(),
            observer: None,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of records per page for a new database.
    pub fn page_size(&mut self, records: u32) -> &mut Self {
        self.settings.page_size = records;
        self
    }

    /// Set the record size in bytes for a new database.
    pub fn record_size(&mut self, bytes: u32) -> &mut Self {
        self.settings.record_size = bytes;
        self
    }

    /// Set the inline value threshold for a new database.
    pub fn max_inline_value_size(&mut self, bytes: u16) -> &mut Self {
        self.settings.max_inline_value_size = bytes;
        self
    }

    pub fn lock_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.lock_timeout = timeout;
        self
    }

    pub fn remove_void_properties(&mut self, yes: bool) -> &mut Self {
        self.settings.remove_void_properties = yes;
        self
    }

    /// Install the subscription collaborator that receives old/new
    /// values after successful writes.
    pub fn observer(&mut self, observer: Box<dyn ChangeObserver>) -> &mut Self {
        self.observer = Some(observer);
        self
    }

    /// Open or create a file-backed database.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<StorageEngine> {
        self.settings.validate()?;
        let header = FileHeader::new(
            self.settings.page_size,
            self.settings.record_size,
            self.settings.max_inline_value_size,
        );
        let (file, header, _is_new) = PagedFile::open(path, header)?;
        let mut settings = self.settings;
        settings.page_size = header.page_size;
        settings.record_size = header.record_size;
        settings.max_inline_value_size = header.max_inline_value_size;
        StorageEngine::open_from(file, header, settings, self.observer.take())
    }

    /// Open a fresh in-memory database. Nothing touches disk.
    pub fn open_in_memory(&mut self) -> Result<StorageEngine> {
        self.settings.validate()?;
        let header = FileHeader::new(
            self.settings.page_size,
            self.settings.record_size,
            self.settings.max_inline_value_size,
        );
        let (file, header) = PagedFile::open_anon(header)?;
        StorageEngine::open_from(file, header, self.settings, self.observer.take())
    }
}

/// Open or create a database at `path` with default settings.
pub fn open<P: AsRef<Path>>(path: P) -> Result<StorageEngine> {
    OpenOptions::new().open(path)
}

/// Open an in-memory database with default settings.
pub fn open_in_memory() -> Result<StorageEngine> {
    OpenOptions::new().open_in_memory()
}
