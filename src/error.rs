use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A read targeted a path that doesn't exist
    #[error("node at \"{path}\" does not exist")]
    NodeNotFound { path: String },
    /// Stored record data failed validation and cannot be interpreted
    #[error("record data corrupted: {reason}")]
    Corrupt { reason: String },
    /// A lock held by this transaction timed out; the transaction must abort
    #[error("lock on \"{path}\" held by transaction {tid} has expired")]
    LockExpired { tid: u64, path: String },
    /// Waiting for a lock grant exceeded the configured timeout
    #[error("timed out waiting to {} \"{path}\" ({comment})", if *.for_writing { "write-lock" } else { "read-lock" })]
    LockTimeout {
        path: String,
        for_writing: bool,
        comment: String,
    },
    /// A value that cannot be stored was handed to a write operation
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),
    /// Couldn't open the backing file
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("failed to lock the backing file for exclusive use")]
    FileLock(#[source] std::io::Error),
    /// Couldn't resize the backing file
    #[error("can't resize the backing file to 0x{requested:x} bytes")]
    ResizeFailed {
        requested: u64,
        #[source]
        source: std::io::Error,
    },
    /// Couldn't map the backing file into memory
    #[error("memory-mapping 0x{requested:x} bytes failed")]
    MapFailed {
        requested: usize,
        #[source]
        source: std::io::Error,
    },
    /// Couldn't synchronize to the backing file
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Access past the end of the mapped file
    #[error("invalid access at offset 0x{offset:x} with length 0x{len:x}")]
    InvalidAccess { offset: u64, len: usize },
    /// The file contents don't look like a database of ours
    #[error("invalid database file")]
    DataFormat(#[from] FormatError),
    /// Settings that can't describe a valid database
    #[error("invalid settings: {0}")]
    Config(&'static str),
}

impl Error {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FormatError {
    #[error("unrecognized magic bytes")]
    Magic,
    #[error("unrecognized version number {0} in header")]
    Version(u8),
    #[error("header integrity hash mismatch")]
    HeaderHash,
    #[error("stored file geometry is out of range")]
    Geometry,
    #[error("file size doesn't fit the stored geometry")]
    FileSize,
}
