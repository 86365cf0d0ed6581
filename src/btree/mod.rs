//! The embedded B+tree used for records with many children.
//!
//! When a record's flags carry the key-tree bit, its body holds a binary
//! B+tree over the child keys instead of a linear entry list. Leaf values
//! are the same value-info + payload bytes a linear entry would hold.
//! The tree addresses its nodes by logical byte offsets within the record
//! body; [`RecordFragmentIo`] translates those into file positions by
//! following the record's allocation ranges.

mod builder;
mod tree;

pub use builder::{TreeBuilder, FILL_FACTOR_APPEND, FILL_FACTOR_PACKED};
pub use tree::{BinaryTree, TreeLeaf};

use crate::error::{Error, Result};
use crate::storage::{NodeAllocation, PagedFile, RecordAddress};

/// Child-count threshold above which a record is serialized as a tree.
pub const TREE_PROMOTION_THRESHOLD: usize = 100;

/// Fixed data capacity of a leaf node. The slack left by the fill factor
/// is what in-place mutation spends before forcing a rebuild.
pub const LEAF_DATA: usize = 512;

/// Serialized size of a leaf node: kind + count + next + free + data.
pub const LEAF_BLOCK: usize = 3 + 4 + 2 + LEAF_DATA;

/// Maximum children per branch node.
pub const BRANCH_FANOUT: usize = 16;

/// One key/value pair in a tree leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A batched tree mutation.
#[derive(Debug, Clone)]
pub enum TreeOp {
    Add { key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

impl TreeOp {
    pub fn key(&self) -> &[u8] {
        match self {
            TreeOp::Add { key, .. } | TreeOp::Update { key, .. } | TreeOp::Remove { key } => key,
        }
    }
}

/// Why an in-place tree transaction could not be applied.
#[derive(Debug)]
pub enum TreeWriteError {
    /// A leaf would outgrow its slack; the caller must rebuild the tree
    NoSpace,
    Fatal(Error),
}

impl From<Error> for TreeWriteError {
    fn from(e: Error) -> Self {
        TreeWriteError::Fatal(e)
    }
}

/// Byte-level access to a tree's backing storage, addressed by logical
/// body offset.
pub trait TreeIo {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()>;
    fn len(&self) -> u32;
}

/// In-memory tree bytes; used for freshly built trees and in tests.
impl TreeIo for Vec<u8> {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let Some(src) = self.get(start..start + buf.len()) else {
            return Err(Error::corrupt("tree read past end of buffer"));
        };
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        let Some(dst) = self.get_mut(start..start + data.len()) else {
            return Err(Error::corrupt("tree write past end of buffer"));
        };
        dst.copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> u32 {
        Vec::len(self) as u32
    }
}

/// Translates logical record-body offsets into file reads/writes across
/// the record's possibly fragmented allocation.
pub struct RecordFragmentIo<'a> {
    file: &'a PagedFile,
    addresses: Vec<RecordAddress>,
    record_size: u32,
    /// Byte offset of the body within the record stream (the header size)
    base: u32,
    /// Body length in bytes
    data_len: u32,
}

impl<'a> RecordFragmentIo<'a> {
    pub fn new(file: &'a PagedFile, allocation: &NodeAllocation, base: u32, data_len: u32) -> Self {
        Self {
            file,
            addresses: allocation.addresses(),
            record_size: file.record_size(),
            base,
            data_len,
        }
    }

    fn spans(&self, offset: u32, len: usize) -> Result<Vec<(u64, usize)>> {
        if offset as u64 + len as u64 > self.data_len as u64 {
            return Err(Error::corrupt(format!(
                "tree access at {}+{} past record data length {}",
                offset, len, self.data_len
            )));
        }
        let mut pos = (self.base + offset) as u64;
        let mut remaining = len;
        let mut out = Vec::new();
        while remaining > 0 {
            let record = (pos / self.record_size as u64) as usize;
            let within = (pos % self.record_size as u64) as u32;
            let take = ((self.record_size - within) as usize).min(remaining);
            let Some(&addr) = self.addresses.get(record) else {
                return Err(Error::corrupt("tree access past end of allocation"));
            };
            out.push((self.file.file_index(addr) + within as u64, take));
            pos += take as u64;
            remaining -= take;
        }
        Ok(out)
    }
}

impl TreeIo for RecordFragmentIo<'_> {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let mut cursor = 0usize;
        for (index, take) in self.spans(offset, buf.len())? {
            self.file.read_data(index, &mut buf[cursor..cursor + take])?;
            cursor += take;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let mut cursor = 0usize;
        for (index, take) in self.spans(offset, data.len())? {
            self.file.write_data(index, &data[cursor..cursor + take])?;
            cursor += take;
        }
        Ok(())
    }

    fn len(&self) -> u32 {
        self.data_len
    }
}

/// Array indexes become fixed-width big-endian keys so byte order equals
/// numeric order.
pub fn index_key(index: u32) -> Vec<u8> {
    index.to_be_bytes().to_vec()
}
