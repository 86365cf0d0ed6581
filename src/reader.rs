//! Streaming reads of node records: header parsing with chunk-table
//! chaining, chunked data streaming, child iteration over both layouts,
//! and recursive value assembly under read locks.

use crate::btree::{BinaryTree, RecordFragmentIo, TreeLeaf};
use crate::codec::{self, DecodedEntry, EntryDecoder, WireValue};
use crate::engine::StoreContext;
use crate::error::{Error, Result};
use crate::path::{self, PathKey};
use crate::storage::{NodeAllocation, RecordAddress};
use crate::value::{NodeValue, ValueType};

/// Upper bound on records fetched by a single streaming read.
pub const MAX_CHUNK_RECORDS: u32 = 200;

/// Everything read from a record's header.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordInfo {
    pub address: RecordAddress,
    pub value_type: ValueType,
    pub has_key_tree: bool,
    pub header_len: u32,
    pub last_chunk_size: u16,
    pub allocation: NodeAllocation,
}

impl RecordInfo {
    /// Bytes stored across the allocation, header included.
    pub fn total_byte_length(&self, record_size: u32) -> u64 {
        let total = self.allocation.total_records() as u64;
        if total <= 1 {
            self.last_chunk_size as u64
        } else {
            (total - 1) * record_size as u64 + self.last_chunk_size as u64
        }
    }

    /// Bytes of record body (after the header).
    pub fn data_len(&self, record_size: u32) -> u64 {
        self.total_byte_length(record_size) - self.header_len as u64
    }
}

/// Information about a node, as surfaced to collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub path: String,
    pub key: Option<PathKey>,
    pub exists: bool,
    pub value_type: Option<ValueType>,
    pub address: Option<RecordAddress>,
    /// Present for tiny/inline children; external values must be read
    pub value: Option<NodeValue>,
}

impl NodeInfo {
    pub fn missing(path: &str) -> Self {
        Self {
            path: path.to_string(),
            key: None,
            exists: false,
            value_type: None,
            address: None,
            value: None,
        }
    }
}

/// Read and parse a record's header at `address`, chaining into further
/// records of the first range when the chunk table overflows the first.
pub(crate) fn read_record_info(ctx: &StoreContext, address: RecordAddress) -> Result<RecordInfo> {
    let record_size = ctx.file.record_size() as usize;
    let mut buf = vec![0u8; record_size];
    ctx.file
        .read_data(ctx.file.file_index(address), &mut buf)?;
    let mut chained: u32 = 1;
    loop {
        if let Some(parsed) = codec::try_parse_header(address, &buf)? {
            log::trace!(
                "record at {}: type {:?}, {} range(s), {} header byte(s)",
                address,
                parsed.value_type,
                parsed.allocation.ranges.len(),
                parsed.header_len
            );
            return Ok(RecordInfo {
                address,
                value_type: parsed.value_type,
                has_key_tree: parsed.has_key_tree,
                header_len: parsed.header_len,
                last_chunk_size: parsed.last_chunk_size,
                allocation: parsed.allocation,
            });
        }
        // The chunk table continues in the next record of the first range
        let next_record = address.record as u32 + chained;
        if next_record > u16::MAX as u32 || buf.len() > 64 * 1024 {
            return Err(Error::corrupt(format!(
                "unterminated chunk table in record at {}",
                address
            )));
        }
        let next = RecordAddress::new(address.page, next_record as u16);
        let mut more = vec![0u8; record_size];
        ctx.file.read_data(ctx.file.file_index(next), &mut more)?;
        buf.extend_from_slice(&more);
        chained += 1;
    }
}

/// Precomputed read pieces covering a record's body, each at most
/// [`MAX_CHUNK_RECORDS`] records long and contiguous in the file.
pub(crate) struct ChunkCursor {
    pieces: Vec<(u64, u32)>,
    next: usize,
}

impl ChunkCursor {
    pub fn new(ctx: &StoreContext, info: &RecordInfo) -> Self {
        let rs = ctx.file.record_size();
        let total = info.total_byte_length(rs);
        let header_len = info.header_len as u64;
        let mut pieces = Vec::new();
        let mut stream_pos: u64 = 0;
        for range in &info.allocation.ranges {
            let mut rec: u32 = 0;
            while rec < range.length as u32 && stream_pos < total {
                let chunk_records = (range.length as u32 - rec).min(MAX_CHUNK_RECORDS);
                let start = RecordAddress::new(range.page, range.record + rec as u16);
                let mut index = ctx.file.file_index(start);
                let mut len = (chunk_records as u64 * rs as u64).min(total - stream_pos);
                let end_pos = stream_pos + len;
                if end_pos > header_len {
                    if stream_pos < header_len {
                        let skip = header_len - stream_pos;
                        index += skip;
                        len -= skip;
                    }
                    pieces.push((index, len as u32));
                }
                stream_pos = end_pos;
                rec += chunk_records;
            }
        }
        Self { pieces, next: 0 }
    }

    pub fn next_chunk(&mut self, ctx: &StoreContext) -> Result<Option<Vec<u8>>> {
        let Some(&(index, len)) = self.pieces.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let mut buf = vec![0u8; len as usize];
        ctx.file.read_data(index, &mut buf)?;
        Ok(Some(buf))
    }
}

/// Read a record's entire body into memory.
pub(crate) fn read_all_data(ctx: &StoreContext, info: &RecordInfo) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(info.data_len(ctx.file.record_size()) as usize);
    let mut cursor = ChunkCursor::new(ctx, info);
    while let Some(chunk) = cursor.next_chunk(ctx)? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

fn tree_key_to_path_key(parent_type: ValueType, key: &[u8]) -> Result<PathKey> {
    if parent_type == ValueType::Array {
        if key.len() != 4 {
            return Err(Error::corrupt("array tree key must be 4 bytes"));
        }
        Ok(PathKey::Index(u32::from_be_bytes(key.try_into().unwrap())))
    } else {
        let name = std::str::from_utf8(key)
            .map_err(|_| Error::corrupt("tree key is not valid UTF-8"))?;
        Ok(PathKey::Name(name.to_string()))
    }
}

pub(crate) fn path_key_to_tree_key(parent_type: ValueType, key: &PathKey) -> Vec<u8> {
    match (parent_type, key) {
        (ValueType::Array, PathKey::Index(i)) => crate::btree::index_key(*i),
        (_, PathKey::Name(n)) => n.as_bytes().to_vec(),
        (_, PathKey::Index(i)) => crate::btree::index_key(*i),
    }
}

enum IterState<'a> {
    Tree {
        tree: BinaryTree<RecordFragmentIo<'a>>,
        /// Remaining leaf walk; unused in keyed mode
        leaf: Option<TreeLeaf>,
        pos: usize,
        /// Next filter key to look up, when a key filter is set
        filter_pos: usize,
        started: bool,
    },
    Linear {
        cursor: ChunkCursor,
        carry: Vec<u8>,
        decoder: EntryDecoder,
        exhausted: bool,
    },
}

/// Pull-style iterator over a record's child entries. Dropping it early
/// is the cancellation signal; nothing is read past the last item asked
/// for.
pub(crate) struct ChildIterator<'a> {
    ctx: &'a StoreContext,
    parent_path: String,
    parent_type: ValueType,
    key_filter: Option<Vec<PathKey>>,
    /// Whether discovered child addresses get registered in the address
    /// cache. The merge engine turns this off: it streams pre-rewrite
    /// entries whose addresses may already be superseded.
    prime_cache: bool,
    state: IterState<'a>,
}

impl<'a> ChildIterator<'a> {
    pub fn new(
        ctx: &'a StoreContext,
        parent_path: &str,
        info: &RecordInfo,
        key_filter: Option<Vec<PathKey>>,
    ) -> Result<Self> {
        if !info.value_type.is_composite() {
            return Err(Error::corrupt(format!(
                "node at \"{}\" has no children to iterate",
                parent_path
            )));
        }
        let state = if info.has_key_tree {
            let io = RecordFragmentIo::new(
                &ctx.file,
                &info.allocation,
                info.header_len,
                info.data_len(ctx.file.record_size()) as u32,
            );
            IterState::Tree {
                tree: BinaryTree::new(io),
                leaf: None,
                pos: 0,
                filter_pos: 0,
                started: false,
            }
        } else {
            IterState::Linear {
                cursor: ChunkCursor::new(ctx, info),
                carry: Vec::new(),
                decoder: EntryDecoder::new(info.value_type),
                exhausted: false,
            }
        };
        Ok(Self {
            ctx,
            parent_path: parent_path.to_string(),
            parent_type: info.value_type,
            key_filter,
            prime_cache: true,
            state,
        })
    }

    /// Stop registering discovered addresses in the node address cache.
    pub fn without_cache_updates(mut self) -> Self {
        self.prime_cache = false;
        self
    }

    fn next_inner(&mut self) -> Result<Option<NodeInfo>> {
        match &mut self.state {
            IterState::Tree {
                tree,
                leaf,
                pos,
                filter_pos,
                started,
            } => {
                if let Some(filter) = &self.key_filter {
                    // Keyed lookup per filter entry
                    while *filter_pos < filter.len() {
                        let key = filter[*filter_pos].clone();
                        *filter_pos += 1;
                        let tree_key = path_key_to_tree_key(self.parent_type, &key);
                        if let Some(bytes) = tree.find(&tree_key)? {
                            let Some((wire, _)) = WireValue::decode(&bytes)? else {
                                return Err(Error::corrupt("truncated tree leaf value"));
                            };
                            let info = entry_to_info(self.ctx, &self.parent_path, key, &wire, self.prime_cache)?;
                            return Ok(Some(info));
                        }
                    }
                    return Ok(None);
                }
                // Full leaf walk
                loop {
                    if !*started {
                        *leaf = Some(tree.first_leaf()?);
                        *pos = 0;
                        *started = true;
                    }
                    let Some(current) = leaf.as_ref() else {
                        return Ok(None);
                    };
                    if let Some(entry) = current.entries.get(*pos) {
                        *pos += 1;
                        let key = tree_key_to_path_key(self.parent_type, &entry.key)?;
                        let Some((wire, _)) = WireValue::decode(&entry.value)? else {
                            return Err(Error::corrupt("truncated tree leaf value"));
                        };
                        let info = entry_to_info(self.ctx, &self.parent_path, key, &wire, self.prime_cache)?;
                        return Ok(Some(info));
                    }
                    *leaf = tree.next_leaf(current)?;
                    *pos = 0;
                    if leaf.is_none() {
                        return Ok(None);
                    }
                }
            }
            IterState::Linear {
                cursor,
                carry,
                decoder,
                exhausted,
            } => loop {
                let decoded = {
                    let kit = self.ctx.kit.lock().unwrap();
                    decoder.decode_next(carry.as_slice(), &kit)?
                };
                match decoded {
                    DecodedEntry::Entry {
                        key,
                        value,
                        consumed,
                    } => {
                        carry.drain(..consumed);
                        let wanted = match &self.key_filter {
                            None => true,
                            Some(keys) => keys.contains(&key),
                        };
                        if !wanted {
                            continue;
                        }
                        let info = entry_to_info(self.ctx, &self.parent_path, key, &value, self.prime_cache)?;
                        return Ok(Some(info));
                    }
                    DecodedEntry::NeedMore => {
                        if *exhausted {
                            if carry.is_empty() {
                                return Ok(None);
                            }
                            return Err(Error::corrupt(format!(
                                "record body of \"{}\" ends mid-entry",
                                self.parent_path
                            )));
                        }
                        match cursor.next_chunk(self.ctx)? {
                            Some(chunk) => carry.extend_from_slice(&chunk),
                            None => *exhausted = true,
                        }
                    }
                }
            },
        }
    }
}

impl Iterator for ChildIterator<'_> {
    type Item = Result<NodeInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_inner().transpose()
    }
}

fn entry_to_info(
    ctx: &StoreContext,
    parent_path: &str,
    key: PathKey,
    value: &WireValue,
    prime_cache: bool,
) -> Result<NodeInfo> {
    let child_path = path::child_path(parent_path, &key);
    let address = value.address();
    let inline_value = match value {
        WireValue::Record { .. } => None,
        other => Some(other.to_node_value()?),
    };
    if let Some(addr) = address {
        if prime_cache {
            let mut cache = ctx.cache.lock().unwrap();
            cache.update_from_read(&child_path, addr, value.vtype());
        }
    }
    Ok(NodeInfo {
        path: child_path,
        key: Some(key),
        exists: true,
        value_type: Some(value.vtype()),
        address,
        value: inline_value,
    })
}

/// Include/exclude/child-objects pruning for value assembly. Filter paths
/// are slash-joined relative key trails; a `*` segment matches any key at
/// its depth.
#[derive(Debug, Clone, Default)]
pub struct ValueFilter {
    pub include: Vec<Vec<String>>,
    pub exclude: Vec<Vec<String>>,
    pub child_objects: Option<bool>,
}

impl ValueFilter {
    pub fn new(include: &[&str], exclude: &[&str], child_objects: Option<bool>) -> Self {
        let split = |paths: &[&str]| {
            paths
                .iter()
                .map(|p| p.split('/').map(str::to_string).collect())
                .collect()
        };
        Self {
            include: split(include),
            exclude: split(exclude),
            child_objects,
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty() && self.child_objects.is_none()
    }

    /// When every included trail starts with a concrete key, those keys
    /// bound the child stream.
    fn include_keys(&self) -> Option<Vec<PathKey>> {
        if self.include.is_empty() {
            return None;
        }
        let mut keys = Vec::with_capacity(self.include.len());
        for trail in &self.include {
            let first = trail.first()?;
            if first == "*" {
                return None;
            }
            keys.push(parse_filter_key(first)?);
        }
        Some(keys)
    }

    /// The filter that applies to one child, or `None` to skip it.
    fn child(&self, key: &PathKey, is_composite: bool) -> Option<ValueFilter> {
        let key_str = key.to_string();
        let matches = |seg: &str| seg == "*" || seg == key_str;

        if self
            .exclude
            .iter()
            .any(|trail| trail.len() == 1 && matches(&trail[0]))
        {
            return None;
        }
        let include: Vec<Vec<String>> = if self.include.is_empty() {
            Vec::new()
        } else {
            let sub: Vec<Vec<String>> = self
                .include
                .iter()
                .filter(|trail| trail.first().is_some_and(|s| matches(s)))
                .map(|trail| trail[1..].to_vec())
                .filter(|tail| !tail.is_empty())
                .collect();
            let any_match = self
                .include
                .iter()
                .any(|trail| trail.first().is_some_and(|s| matches(s)));
            if !any_match {
                return None;
            }
            sub
        };
        if is_composite && self.child_objects == Some(false) {
            return None;
        }
        let exclude = self
            .exclude
            .iter()
            .filter(|trail| trail.len() > 1 && matches(&trail[0]))
            .map(|trail| trail[1..].to_vec())
            .collect();
        Some(ValueFilter {
            include,
            exclude,
            child_objects: self.child_objects,
        })
    }
}

fn parse_filter_key(seg: &str) -> Option<PathKey> {
    if let Some(inner) = seg.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        inner.parse().ok().map(PathKey::Index)
    } else {
        Some(PathKey::Name(seg.to_string()))
    }
}

/// Assemble the native value of a node, recursing into external children
/// under read locks.
pub(crate) fn read_node_value(
    ctx: &StoreContext,
    node_path: &str,
    info: &RecordInfo,
    filter: &ValueFilter,
    tid: u64,
) -> Result<NodeValue> {
    if !info.value_type.is_composite() {
        let data = read_all_data(ctx, info)?;
        let wire = WireValue::Inline {
            vtype: info.value_type,
            bytes: data,
        };
        return wire.to_node_value();
    }

    let key_filter = filter.include_keys();
    let mut object = std::collections::BTreeMap::new();
    let mut array: Vec<(u32, NodeValue)> = Vec::new();
    let iter = ChildIterator::new(ctx, node_path, info, key_filter)?;
    for child in iter {
        let child = child?;
        let key = child.key.clone().expect("child entries always carry a key");
        let is_composite = child.value_type.is_some_and(|t| t.is_composite());
        let Some(child_filter) = filter.child(&key, is_composite) else {
            continue;
        };

        let value = if let Some(addr) = child.address {
            if addr == info.address {
                return Err(Error::corrupt(format!(
                    "record at {} references itself as child \"{}\"",
                    addr, key
                )));
            }
            let lock = ctx
                .locks
                .lock(&child.path, tid, false, "read child value")?;
            let result = read_record_info(ctx, addr)
                .and_then(|child_info| {
                    read_node_value(ctx, &child.path, &child_info, &child_filter, tid)
                });
            lock.release();
            result?
        } else {
            child
                .value
                .ok_or_else(|| Error::corrupt("child entry carries neither value nor address"))?
        };

        match &key {
            PathKey::Index(i) => array.push((*i, value)),
            PathKey::Name(name) => {
                object.insert(name.clone(), value);
            }
        }
    }

    Ok(if info.value_type == ValueType::Array {
        array.sort_by_key(|(i, _)| *i);
        NodeValue::Array(array.into_iter().map(|(_, v)| v).collect())
    } else {
        NodeValue::Object(object)
    })
}
