//! The paged file backend.
//!
//! A database is a single file: one 4 kiB header block followed by pages of
//! `page_size × record_size` bytes each. The whole file is memory-mapped
//! from offset zero; growth resizes the file and remaps (or replaces the
//! map — no access outlives a call, so swapping the map is sound). All
//! multi-byte integers on the wire are big-endian.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::error::{Error, FormatError, Result};

/// Size of the fixed file header block, including the key-index table
/// region and the integrity hash.
pub const HEADER_BLOCK: usize = 4096;

const MAGIC: [u8; 8] = *b"nodefile";
const VERSION: u8 = 1;

/// Location of one record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordAddress {
    pub page: u32,
    pub record: u16,
}

impl RecordAddress {
    pub fn new(page: u32, record: u16) -> Self {
        Self { page, record }
    }
}

impl fmt::Display for RecordAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.page, self.record)
    }
}

/// A contiguous run of records within one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageRange {
    pub page: u32,
    pub record: u16,
    /// Number of records in the run
    pub length: u16,
}

impl StorageRange {
    pub fn new(page: u32, record: u16, length: u16) -> Self {
        Self {
            page,
            record,
            length,
        }
    }

    pub fn address(&self) -> RecordAddress {
        RecordAddress::new(self.page, self.record)
    }

    pub fn contains(&self, addr: RecordAddress) -> bool {
        self.page == addr.page
            && addr.record >= self.record
            && (addr.record as u32) < self.record as u32 + self.length as u32
    }
}

/// The ordered set of ranges that together store one node's record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeAllocation {
    pub ranges: Vec<StorageRange>,
}

impl NodeAllocation {
    pub fn new(ranges: Vec<StorageRange>) -> Self {
        Self { ranges }
    }

    pub fn single(addr: RecordAddress, length: u16) -> Self {
        Self {
            ranges: vec![StorageRange::new(addr.page, addr.record, length)],
        }
    }

    /// The allocation's address: its first range's first record.
    pub fn address(&self) -> RecordAddress {
        self.ranges[0].address()
    }

    pub fn total_records(&self) -> u32 {
        self.ranges.iter().map(|r| r.length as u32).sum()
    }

    /// Every record address in order.
    pub fn addresses(&self) -> Vec<RecordAddress> {
        let mut out = Vec::with_capacity(self.total_records() as usize);
        for r in &self.ranges {
            for i in 0..r.length {
                out.push(RecordAddress::new(r.page, r.record + i));
            }
        }
        out
    }

    /// Merge ranges that are address-adjacent within the same page.
    pub fn normalize(&mut self) {
        let mut merged: Vec<StorageRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.page == r.page
                    && last.record as u32 + last.length as u32 == r.record as u32
                    && last.length as u32 + r.length as u32 <= u16::MAX as u32
                {
                    last.length += r.length;
                    continue;
                }
            }
            merged.push(r);
        }
        self.ranges = merged;
    }

    /// Keep the first `keep` records, returning the trimmed-off tail ranges
    /// so the caller can release them.
    pub fn trim(&mut self, keep: u32) -> Vec<StorageRange> {
        let mut remaining = keep;
        let mut tail = Vec::new();
        let mut kept = Vec::new();
        for r in self.ranges.drain(..) {
            if remaining == 0 {
                tail.push(r);
            } else if (r.length as u32) <= remaining {
                remaining -= r.length as u32;
                kept.push(r);
            } else {
                let keep_len = remaining as u16;
                kept.push(StorageRange::new(r.page, r.record, keep_len));
                tail.push(StorageRange::new(
                    r.page,
                    r.record + keep_len,
                    r.length - keep_len,
                ));
                remaining = 0;
            }
        }
        self.ranges = kept;
        tail
    }
}

/// The decoded file header: geometry, the root record pointer, and the
/// serialized key-index table.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Records per page
    pub page_size: u32,
    /// Bytes per record
    pub record_size: u32,
    pub max_inline_value_size: u16,
    pub root: Option<RecordAddress>,
    pub kit_bytes: Vec<u8>,
}

/// Fixed on-disk part of the header. All integer fields are stored as
/// big-endian byte arrays so the struct is padding-free and `Pod`.
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct StoredHeader {
    magic: [u8; 8],
    version: u8,
    root_exists: u8,
    max_inline: [u8; 2],
    page_size: [u8; 4],
    record_size: [u8; 4],
    root_page: [u8; 4],
    root_record: [u8; 2],
    kit_len: [u8; 2],
    _reserved: [u8; 4],
}

const STORED_HEADER_LEN: usize = std::mem::size_of::<StoredHeader>();

/// Bytes available to the serialized key-index table.
pub const KIT_CAPACITY: usize = HEADER_BLOCK - STORED_HEADER_LEN - 8;

impl FileHeader {
    pub fn new(page_size: u32, record_size: u32, max_inline_value_size: u16) -> Self {
        Self {
            page_size,
            record_size,
            max_inline_value_size,
            root: None,
            kit_bytes: Vec::new(),
        }
    }

    fn validate_geometry(&self) -> Result<()> {
        if self.page_size < 8 || self.page_size > u16::MAX as u32 {
            return Err(FormatError::Geometry.into());
        }
        if self.record_size < 32 || self.record_size > 32768 {
            return Err(FormatError::Geometry.into());
        }
        if self.max_inline_value_size < 4 || self.max_inline_value_size > 64 {
            return Err(FormatError::Geometry.into());
        }
        Ok(())
    }

    pub fn load(block: &[u8]) -> Result<Self> {
        let (header, rem) = block.split_at(STORED_HEADER_LEN);
        let header: &StoredHeader = bytemuck::from_bytes(header);
        if header.magic != MAGIC {
            return Err(FormatError::Magic.into());
        }
        if header.version != VERSION {
            return Err(FormatError::Version(header.version).into());
        }
        let kit_len = u16::from_be_bytes(header.kit_len) as usize;
        let Some(kit_bytes) = rem.get(..kit_len) else {
            return Err(FormatError::Geometry.into());
        };
        let Some(hash) = rem.get(kit_len..kit_len + 8) else {
            return Err(FormatError::HeaderHash.into());
        };
        let hash = u64::from_le_bytes(hash.try_into().unwrap());
        let hashed = &block[..STORED_HEADER_LEN + kit_len];
        if xxhash_rust::xxh3::xxh3_64(hashed) != hash {
            return Err(FormatError::HeaderHash.into());
        }

        let ret = Self {
            page_size: u32::from_be_bytes(header.page_size),
            record_size: u32::from_be_bytes(header.record_size),
            max_inline_value_size: u16::from_be_bytes(header.max_inline),
            root: (header.root_exists != 0).then(|| {
                RecordAddress::new(
                    u32::from_be_bytes(header.root_page),
                    u16::from_be_bytes(header.root_record),
                )
            }),
            kit_bytes: kit_bytes.to_vec(),
        };
        ret.validate_geometry()?;
        Ok(ret)
    }

    /// Serialize into a full header block.
    pub fn store(&self) -> Result<Vec<u8>> {
        self.validate_geometry()?;
        if self.kit_bytes.len() > KIT_CAPACITY {
            return Err(Error::Config("key-index table overflows the header block"));
        }
        let header = StoredHeader {
            magic: MAGIC,
            version: VERSION,
            root_exists: self.root.is_some() as u8,
            max_inline: self.max_inline_value_size.to_be_bytes(),
            page_size: self.page_size.to_be_bytes(),
            record_size: self.record_size.to_be_bytes(),
            root_page: self.root.map(|a| a.page).unwrap_or(0).to_be_bytes(),
            root_record: self.root.map(|a| a.record).unwrap_or(0).to_be_bytes(),
            kit_len: (self.kit_bytes.len() as u16).to_be_bytes(),
            _reserved: [0; 4],
        };
        let mut dst = Vec::with_capacity(HEADER_BLOCK);
        dst.extend_from_slice(bytemuck::bytes_of(&header));
        dst.extend_from_slice(&self.kit_bytes);
        let hash = xxhash_rust::xxh3::xxh3_64(&dst);
        dst.extend_from_slice(hash.to_le_bytes().as_slice());
        dst.resize(HEADER_BLOCK, 0);
        Ok(dst)
    }
}

struct MapInner {
    map: MmapRaw,
    file: Option<File>,
    len: u64,
}

/// Byte-level access to the record area of the backing file. No caching
/// beyond the OS; all higher-level caching is explicit.
pub struct PagedFile {
    inner: Mutex<MapInner>,
    page_size: u32,
    record_size: u32,
}

impl fmt::Debug for PagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.inner.lock().unwrap().len;
        f.debug_struct("PagedFile")
            .field("page_size", &self.page_size)
            .field("record_size", &self.record_size)
            .field("len", &len)
            .finish()
    }
}

impl PagedFile {
    /// Open or create a file-backed store. `new_header` describes the
    /// geometry to create with; an existing file's stored geometry wins.
    pub fn open<P: AsRef<Path>>(
        path: P,
        new_header: FileHeader,
    ) -> Result<(Self, FileHeader, bool)> {
        use fs4::fs_std::FileExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(Error::Open)?;
        file.try_lock_exclusive().map_err(Error::FileLock)?;

        let file_size = file.metadata().map_err(Error::Open)?.len();
        let is_new = file_size == 0;
        if is_new {
            file.set_len(HEADER_BLOCK as u64)
                .map_err(|e| Error::ResizeFailed {
                    requested: HEADER_BLOCK as u64,
                    source: e,
                })?;
        } else if file_size < HEADER_BLOCK as u64 {
            return Err(FormatError::FileSize.into());
        }

        let len = file.metadata().map_err(Error::Open)?.len();
        let map = MmapOptions::new()
            .len(len as usize)
            .map_raw(&file)
            .map_err(|e| Error::MapFailed {
                requested: len as usize,
                source: e,
            })?;

        let mut ret = Self {
            inner: Mutex::new(MapInner {
                map,
                file: Some(file),
                len,
            }),
            page_size: new_header.page_size,
            record_size: new_header.record_size,
        };

        let header = if is_new {
            ret.write_header_block(&new_header)?;
            new_header
        } else {
            let mut block = vec![0u8; HEADER_BLOCK];
            ret.read_data(0, &mut block)?;
            let header = FileHeader::load(&block)?;
            ret.page_size = header.page_size;
            ret.record_size = header.record_size;
            let page_bytes = header.page_size as u64 * header.record_size as u64;
            if (len - HEADER_BLOCK as u64) % page_bytes != 0 {
                return Err(FormatError::FileSize.into());
            }
            header
        };

        Ok((ret, header, is_new))
    }

    /// Open an anonymous in-memory store. Always starts empty.
    pub fn open_anon(header: FileHeader) -> Result<(Self, FileHeader)> {
        let map = MmapRaw::from(MmapMut::map_anon(HEADER_BLOCK).map_err(|e| Error::MapFailed {
            requested: HEADER_BLOCK,
            source: e,
        })?);
        let ret = Self {
            inner: Mutex::new(MapInner {
                map,
                file: None,
                len: HEADER_BLOCK as u64,
            }),
            page_size: header.page_size,
            record_size: header.record_size,
        };
        ret.write_header_block(&header)?;
        Ok((ret, header))
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    fn page_bytes(&self) -> u64 {
        self.page_size as u64 * self.record_size as u64
    }

    /// Number of whole pages currently in the file.
    pub fn page_count(&self) -> u32 {
        let len = self.inner.lock().unwrap().len;
        ((len - HEADER_BLOCK as u64) / self.page_bytes()) as u32
    }

    /// Byte offset of a record slot in the file.
    pub fn file_index(&self, addr: RecordAddress) -> u64 {
        HEADER_BLOCK as u64
            + (addr.page as u64 * self.page_size as u64 + addr.record as u64)
                * self.record_size as u64
    }

    pub fn read_data(&self, file_index: u64, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let end = file_index
            .checked_add(buf.len() as u64)
            .ok_or(Error::InvalidAccess {
                offset: file_index,
                len: buf.len(),
            })?;
        if end > inner.len {
            return Err(Error::InvalidAccess {
                offset: file_index,
                len: buf.len(),
            });
        }
        // Safety: bounds checked above; the mutex serializes access, so no
        // mutable alias exists for the copied range during this call.
        unsafe {
            std::ptr::copy_nonoverlapping(
                inner.map.as_ptr().add(file_index as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    pub fn write_data(&self, file_index: u64, data: &[u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let end = file_index
            .checked_add(data.len() as u64)
            .ok_or(Error::InvalidAccess {
                offset: file_index,
                len: data.len(),
            })?;
        if end > inner.len {
            return Err(Error::InvalidAccess {
                offset: file_index,
                len: data.len(),
            });
        }
        // Safety: same argument as read_data
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                inner.map.as_mut_ptr().add(file_index as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Append `n` empty pages, returning the first new page number.
    pub fn grow_pages(&self, n: u32) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let first_new = ((inner.len - HEADER_BLOCK as u64) / self.page_bytes()) as u32;
        let new_len = inner.len + n as u64 * self.page_bytes();
        log::debug!("growing file by {} page(s) to 0x{:x} bytes", n, new_len);

        if inner.file.is_some() {
            inner
                .file
                .as_ref()
                .unwrap()
                .set_len(new_len)
                .map_err(|e| Error::ResizeFailed {
                    requested: new_len,
                    source: e,
                })?;

            // On Linux the existing map can usually be extended in place
            #[cfg(target_os = "linux")]
            {
                use memmap2::RemapOptions;
                let ok = unsafe {
                    inner
                        .map
                        .remap(new_len as usize, RemapOptions::new().may_move(true))
                        .is_ok()
                };
                if ok {
                    inner.len = new_len;
                    return Ok(first_new);
                }
            }

            let map = MmapOptions::new()
                .len(new_len as usize)
                .map_raw(inner.file.as_ref().unwrap())
                .map_err(|e| Error::MapFailed {
                    requested: new_len as usize,
                    source: e,
                })?;
            inner.map = map;
        } else {
            let map = MmapRaw::from(MmapMut::map_anon(new_len as usize).map_err(|e| {
                Error::MapFailed {
                    requested: new_len as usize,
                    source: e,
                }
            })?);
            // Safety: both maps are live and at least inner.len bytes long
            unsafe {
                std::ptr::copy_nonoverlapping(
                    inner.map.as_ptr(),
                    map.as_mut_ptr(),
                    inner.len as usize,
                );
            }
            inner.map = map;
        }
        inner.len = new_len;
        Ok(first_new)
    }

    /// Serialize and write the header block, flushing it through.
    pub fn write_header_block(&self, header: &FileHeader) -> Result<()> {
        let block = header.store()?;
        self.write_data(0, &block)?;
        let inner = self.inner.lock().unwrap();
        if inner.file.is_some() {
            inner.map.flush_range(0, HEADER_BLOCK).map_err(Error::Sync)?;
        }
        Ok(())
    }

    /// Flush the whole map to the backing file.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if inner.file.is_none() {
            return Ok(());
        }
        inner.map.flush().map_err(Error::Sync)
    }
}
