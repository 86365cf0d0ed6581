//! The storage engine: every collaborator-facing operation, the shared
//! component state, and node location along the cached ancestor chain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use regex::Regex;

use crate::cache::NodeAddressCache;
use crate::error::{Error, Result};
use crate::fst::FreeSpaceTable;
use crate::kit::KeyIndexTable;
use crate::lock::{LockManager, NodeLock};
use crate::path::{self, PathKey};
use crate::reader::{
    read_node_value, read_record_info, ChildIterator, NodeInfo, ValueFilter,
};
use crate::storage::{FileHeader, PagedFile, RecordAddress};
use crate::value::{NodeValue, ValueType};
use crate::{writer, DbSettings};

/// Old and new state along a written path, handed to the observer after
/// a successful update.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// The path the write targeted
    pub path: String,
    /// The highest subscribed ancestor the values were captured at
    pub top_path: String,
    pub old_value: NodeValue,
    pub new_value: NodeValue,
}

/// Collaborator hook for subscriptions: names the highest subscribed
/// ancestor of a written path, and receives the pre/post state.
pub trait ChangeObserver: Send + Sync {
    fn top_event_path(&self, _path: &str) -> Option<String> {
        None
    }
    fn notify(&self, _event: &ChangeEvent) {}
}

/// Shared state of one open database. Explicit per-engine fields: several
/// databases can coexist in a process and tear down deterministically.
pub(crate) struct StoreContext {
    pub settings: DbSettings,
    pub file: PagedFile,
    pub header: Mutex<FileHeader>,
    pub fst: Mutex<FreeSpaceTable>,
    pub kit: Mutex<KeyIndexTable>,
    pub cache: Mutex<NodeAddressCache>,
    pub locks: LockManager,
    pub observer: Option<Box<dyn ChangeObserver>>,
    pub next_tid: AtomicU64,
}

fn root_address(ctx: &StoreContext) -> Result<RecordAddress> {
    ctx.header
        .lock()
        .unwrap()
        .root
        .ok_or_else(|| Error::corrupt("missing root record pointer"))
}

/// Resolve a path to its node, walking down from the nearest cached
/// ancestor (or the root) under per-hop read locks. A stale cache entry
/// triggers one retry from the root.
pub(crate) fn locate(ctx: &StoreContext, path: &str, tid: u64) -> Result<NodeInfo> {
    if path.is_empty() {
        let root = root_address(ctx)?;
        let info = read_record_info(ctx, root)?;
        return Ok(NodeInfo {
            path: String::new(),
            key: None,
            exists: true,
            value_type: Some(info.value_type),
            address: Some(root),
            value: None,
        });
    }
    if let Some((addr, vt)) = ctx.cache.lock().unwrap().find(path) {
        return Ok(NodeInfo {
            path: path.to_string(),
            key: path::last_key(path)?,
            exists: true,
            value_type: Some(vt),
            address: Some(addr),
            value: None,
        });
    }

    let keys = path::parse(path)?;
    for attempt in 0..2 {
        let (start_path, start_addr) = if attempt == 0 {
            match ctx.cache.lock().unwrap().find_ancestor(path) {
                Some((p, a, _)) => (p, a),
                None => (String::new(), root_address(ctx)?),
            }
        } else {
            (String::new(), root_address(ctx)?)
        };
        let from_cache = !start_path.is_empty();

        match walk_down(ctx, &start_path, start_addr, &keys, tid) {
            Ok(Some(info)) => return Ok(info),
            Ok(None) if !from_cache => return Ok(NodeInfo::missing(path)),
            Err(e) if !from_cache => return Err(e),
            // The cached ancestor led nowhere; drop it and walk fresh
            Ok(None) | Err(_) => {
                log::debug!(
                    "cached ancestor \"{}\" went stale while locating \"{}\"",
                    start_path,
                    path
                );
                ctx.cache.lock().unwrap().invalidate(&start_path, false);
            }
        }
    }
    unreachable!("second locate attempt never starts from the cache")
}

fn walk_down(
    ctx: &StoreContext,
    start_path: &str,
    start_addr: RecordAddress,
    keys: &[PathKey],
    tid: u64,
) -> Result<Option<NodeInfo>> {
    let mut cur_path = start_path.to_string();
    let mut cur_addr = start_addr;
    let depth = path::parse(&cur_path)?.len();
    for (i, key) in keys.iter().enumerate().skip(depth) {
        let lock = ctx.locks.lock(&cur_path, tid, false, "locate hop")?;
        let step = (|| -> Result<Option<NodeInfo>> {
            let info = read_record_info(ctx, cur_addr)?;
            if !info.value_type.is_composite() {
                return Ok(None);
            }
            let mut children =
                ChildIterator::new(ctx, &cur_path, &info, Some(vec![key.clone()]))?;
            children.next().transpose()
        })();
        lock.release();
        let Some(child) = step? else {
            return Ok(None);
        };
        if i + 1 == keys.len() {
            return Ok(Some(child));
        }
        match child.address {
            Some(addr) => {
                cur_path = child.path;
                cur_addr = addr;
            }
            // Inline children have no descendants
            None => return Ok(None),
        }
    }
    Ok(None)
}

/// Counters exposed for diagnostics and leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub pages: u32,
    pub total_records: u64,
    pub allocated_records: u64,
    pub free_records: u64,
}

/// A record's placement, for callers that need to observe storage-level
/// behavior (address moves, tree promotion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSummary {
    pub address: RecordAddress,
    pub has_key_tree: bool,
    pub total_records: u32,
}

/// Child iterator handed to collaborators. Dropping it cancels the
/// stream; the read lock on the parent is held for its lifetime.
pub struct Children<'a> {
    inner: Option<(ChildIterator<'a>, NodeLock)>,
}

impl Iterator for Children<'_> {
    type Item = Result<NodeInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        let (iter, _) = self.inner.as_mut()?;
        let item = iter.next();
        if item.is_none() {
            self.inner = None;
        }
        item
    }
}

/// One filter condition for [`StorageEngine::matches`].
pub struct QueryCriterion {
    pub key: String,
    pub op: QueryOp,
}

impl QueryCriterion {
    pub fn new(key: impl Into<String>, op: QueryOp) -> Self {
        Self {
            key: key.into(),
            op,
        }
    }
}

#[allow(clippy::type_complexity)]
pub enum QueryOp {
    Lt(NodeValue),
    Lte(NodeValue),
    Eq(NodeValue),
    Neq(NodeValue),
    Gt(NodeValue),
    Gte(NodeValue),
    In(Vec<NodeValue>),
    NotIn(Vec<NodeValue>),
    Matches(Regex),
    NotMatches(Regex),
    Between(NodeValue, NodeValue),
    NotBetween(NodeValue, NodeValue),
    Has(String),
    NotHas(String),
    Contains(NodeValue),
    NotContains(NodeValue),
    Exists,
    NotExists,
    Custom(Box<dyn Fn(&NodeValue) -> bool + Send + Sync>),
}

fn compare(a: &NodeValue, b: &NodeValue) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (NodeValue::Number(x), NodeValue::Number(y)) => x.partial_cmp(y),
        (NodeValue::String(x), NodeValue::String(y)) => Some(x.cmp(y)),
        (NodeValue::DateTime(x), NodeValue::DateTime(y)) => Some(x.cmp(y)),
        (NodeValue::Boolean(x), NodeValue::Boolean(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn evaluate(op: &QueryOp, value: Option<&NodeValue>) -> bool {
    use std::cmp::Ordering::*;
    match op {
        QueryOp::Exists => return value.is_some(),
        QueryOp::NotExists => return value.is_none(),
        _ => {}
    }
    let Some(v) = value else {
        return false;
    };
    match op {
        QueryOp::Lt(b) => compare(v, b) == Some(Less),
        QueryOp::Lte(b) => matches!(compare(v, b), Some(Less | Equal)),
        QueryOp::Eq(b) => v == b,
        QueryOp::Neq(b) => v != b,
        QueryOp::Gt(b) => compare(v, b) == Some(Greater),
        QueryOp::Gte(b) => matches!(compare(v, b), Some(Greater | Equal)),
        QueryOp::In(list) => list.contains(v),
        QueryOp::NotIn(list) => !list.contains(v),
        QueryOp::Matches(re) => v.as_str().is_some_and(|s| re.is_match(s)),
        QueryOp::NotMatches(re) => v.as_str().is_some_and(|s| !re.is_match(s)),
        QueryOp::Between(a, b) => {
            matches!(compare(v, a), Some(Greater | Equal))
                && matches!(compare(v, b), Some(Less | Equal))
        }
        QueryOp::NotBetween(a, b) => {
            let (Some(low), Some(high)) = (compare(v, a), compare(v, b)) else {
                return false;
            };
            low == Less || high == Greater
        }
        QueryOp::Has(prop) => v.as_object().is_some_and(|o| o.contains_key(prop)),
        QueryOp::NotHas(prop) => v.as_object().is_some_and(|o| !o.contains_key(prop)),
        QueryOp::Contains(x) => v.as_array().is_some_and(|a| a.contains(x)),
        QueryOp::NotContains(x) => v.as_array().is_some_and(|a| !a.contains(x)),
        QueryOp::Custom(f) => f(v),
        QueryOp::Exists | QueryOp::NotExists => unreachable!(),
    }
}

/// A hierarchical, schemaless node store in a single paged file.
pub struct StorageEngine {
    ctx: StoreContext,
}

impl StorageEngine {
    pub(crate) fn open_from(
        file: PagedFile,
        header: FileHeader,
        settings: DbSettings,
        observer: Option<Box<dyn ChangeObserver>>,
    ) -> Result<Self> {
        let kit = KeyIndexTable::from_bytes(&header.kit_bytes)?;
        let page_size = file.page_size();
        let ctx = StoreContext {
            locks: LockManager::new(settings.lock_timeout),
            settings,
            file,
            header: Mutex::new(header),
            fst: Mutex::new(FreeSpaceTable::new(page_size)),
            kit: Mutex::new(kit),
            cache: Mutex::new(NodeAddressCache::default()),
            observer,
            next_tid: AtomicU64::new(1),
        };
        let engine = StorageEngine { ctx };

        let root = engine.ctx.header.lock().unwrap().root;
        match root {
            None => {
                // Fresh database: the root is an eagerly created empty object
                writer::write_record(&engine.ctx, "", ValueType::Object, &[], false, None)?;
            }
            Some(addr) => {
                // Rebuild the free-space table from the reachable tree
                let tid = engine.new_tid();
                let info = read_record_info(&engine.ctx, addr)?;
                let mut live = info.allocation.ranges.clone();
                live.extend(writer::collect_subtree_ranges(
                    &engine.ctx,
                    "",
                    &info,
                    tid,
                    false,
                )?);
                let pages = engine.ctx.file.page_count();
                *engine.ctx.fst.lock().unwrap() =
                    FreeSpaceTable::from_live_ranges(page_size, pages, &live);
                log::debug!(
                    "reopened database: {} page(s), {} live record(s)",
                    pages,
                    engine.ctx.fst.lock().unwrap().allocated_record_count()
                );
            }
        }
        Ok(engine)
    }

    fn new_tid(&self) -> u64 {
        self.ctx.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    /// Resolve a path to node information without reading its value.
    pub fn locate(&self, path: &str) -> Result<NodeInfo> {
        locate(&self.ctx, path, self.new_tid())
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.locate(path)?.exists)
    }

    /// The value stored at a path, or `Null` when nothing is there.
    pub fn get_value(&self, path: &str) -> Result<NodeValue> {
        self.get_value_with(path, &ValueFilter::default())
    }

    /// Like [`StorageEngine::get_value`], pruned by an include/exclude
    /// filter.
    pub fn get_value_with(&self, path: &str, filter: &ValueFilter) -> Result<NodeValue> {
        let tid = self.new_tid();
        let node = locate(&self.ctx, path, tid)?;
        if !node.exists {
            return Ok(NodeValue::Null);
        }
        if let Some(value) = node.value {
            return Ok(value);
        }
        let Some(addr) = node.address else {
            return Ok(NodeValue::Null);
        };
        let lock = self.ctx.locks.lock(path, tid, false, "read value")?;
        let result = read_record_info(&self.ctx, addr)
            .and_then(|info| read_node_value(&self.ctx, path, &info, filter, tid));
        lock.release();
        result
    }

    /// Stream a node's children, optionally restricted to a set of keys.
    /// Fails with [`Error::NodeNotFound`] when the path doesn't exist.
    pub fn get_children(&self, path: &str, key_filter: Option<&[PathKey]>) -> Result<Children<'_>> {
        let tid = self.new_tid();
        let node = locate(&self.ctx, path, tid)?;
        if !node.exists {
            return Err(Error::NodeNotFound {
                path: path.to_string(),
            });
        }
        let Some(addr) = node.address else {
            // Inline values (empty composites, tiny primitives) have no children
            return Ok(Children { inner: None });
        };
        let lock = self.ctx.locks.lock(path, tid, false, "stream children")?;
        let info = read_record_info(&self.ctx, addr)?;
        if !info.value_type.is_composite() {
            lock.release();
            return Ok(Children { inner: None });
        }
        let iter = ChildIterator::new(&self.ctx, path, &info, key_filter.map(|k| k.to_vec()))?;
        Ok(Children {
            inner: Some((iter, lock)),
        })
    }

    /// Information about one child of a node; `exists` is false when the
    /// child isn't there.
    pub fn get_child_info(&self, path: &str, key: &PathKey) -> Result<NodeInfo> {
        let child_path = path::child_path(path, key);
        self.locate(&child_path)
    }

    /// Store a value at a path. With `merge`, top-level children of an
    /// existing object survive unless the new value names them; a null
    /// child deletes. Without `merge` the value replaces whatever was
    /// there. A null `value` deletes the node.
    pub fn update(&self, path: &str, value: NodeValue, merge: bool) -> Result<()> {
        path::parse(path)?;
        let tid = self.new_tid();
        writer::update(&self.ctx, path, value, merge, tid)
    }

    /// `update` without merging: a full replace.
    pub fn set(&self, path: &str, value: NodeValue) -> Result<()> {
        self.update(path, value, false)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.update(path, NodeValue::Null, false)
    }

    /// Append a value under a generated, time-ordered 24-character key
    /// and return the key.
    pub fn push(&self, path: &str, value: NodeValue) -> Result<String> {
        let key = crate::id::generate_push_id();
        let child = path::child_path(path, &PathKey::name(&key));
        self.set(&child, value)?;
        Ok(key)
    }

    /// Read-modify-write under one write lock. The callback gets the
    /// current value (`Null` when absent); returning `None` cancels the
    /// transaction without writing.
    pub fn transaction<F>(&self, path: &str, f: F) -> Result<()>
    where
        F: FnOnce(NodeValue) -> Option<NodeValue>,
    {
        let tid = self.new_tid();
        let lock = self.ctx.locks.lock(path, tid, true, "transaction")?;
        let node = locate(&self.ctx, path, tid)?;
        let current = if !node.exists {
            NodeValue::Null
        } else if let Some(v) = node.value {
            v
        } else if let Some(addr) = node.address {
            let info = read_record_info(&self.ctx, addr)?;
            read_node_value(&self.ctx, path, &info, &ValueFilter::default(), tid)?
        } else {
            NodeValue::Null
        };
        let Some(new_value) = f(current) else {
            log::debug!("transaction on \"{}\" cancelled by callback", path);
            return Ok(());
        };
        let result = writer::update(&self.ctx, path, new_value, false, tid);
        drop(lock);
        result
    }

    /// Whether the node's children satisfy every criterion.
    pub fn matches(&self, path: &str, criteria: &[QueryCriterion]) -> Result<bool> {
        let tid = self.new_tid();
        let node = locate(&self.ctx, path, tid)?;
        if !node.exists {
            return Ok(false);
        }

        let mut found: std::collections::HashMap<String, NodeValue> =
            std::collections::HashMap::new();
        if let Some(addr) = node.address {
            let keys: Vec<PathKey> = criteria
                .iter()
                .map(|c| PathKey::Name(c.key.clone()))
                .collect();
            let lock = self.ctx.locks.lock(path, tid, false, "match children")?;
            let result = (|| -> Result<()> {
                let info = read_record_info(&self.ctx, addr)?;
                if !info.value_type.is_composite() {
                    return Ok(());
                }
                for child in ChildIterator::new(&self.ctx, path, &info, Some(keys))? {
                    let child = child?;
                    let key = child.key.as_ref().unwrap().to_string();
                    let value = match (child.value.clone(), child.address) {
                        (Some(v), _) => v,
                        (None, Some(child_addr)) => {
                            let child_lock =
                                self.ctx
                                    .locks
                                    .lock(&child.path, tid, false, "match child value")?;
                            let r = read_record_info(&self.ctx, child_addr).and_then(|ci| {
                                read_node_value(
                                    &self.ctx,
                                    &child.path,
                                    &ci,
                                    &ValueFilter::default(),
                                    tid,
                                )
                            });
                            child_lock.release();
                            r?
                        }
                        (None, None) => continue,
                    };
                    found.insert(key, value);
                }
                Ok(())
            })();
            lock.release();
            result?;
        }

        Ok(criteria
            .iter()
            .all(|c| evaluate(&c.op, found.get(&c.key))))
    }

    /// Storage counters; the allocated count equals the records reachable
    /// from the root after any error-free write.
    pub fn storage_stats(&self) -> StorageStats {
        let fst = self.ctx.fst.lock().unwrap();
        StorageStats {
            pages: fst.page_count(),
            total_records: fst.total_records(),
            allocated_records: fst.allocated_record_count(),
            free_records: fst.free_record_count(),
        }
    }

    /// Whether an address is currently in the free set.
    pub fn is_free(&self, address: RecordAddress) -> bool {
        self.ctx.fst.lock().unwrap().is_free(address)
    }

    /// The storage placement of the record holding `path`, or `None` for
    /// nodes stored inline in their parent.
    pub fn node_record(&self, path: &str) -> Result<Option<RecordSummary>> {
        let tid = self.new_tid();
        let node = locate(&self.ctx, path, tid)?;
        let Some(addr) = node.address else {
            return Ok(None);
        };
        let info = read_record_info(&self.ctx, addr)?;
        Ok(Some(RecordSummary {
            address: addr,
            has_key_tree: info.has_key_tree,
            total_records: info.allocation.total_records(),
        }))
    }

    /// Flush the backing file.
    pub fn flush(&self) -> Result<()> {
        self.ctx.file.flush()
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.file.flush() {
            log::warn!("flush on close failed: {}", e);
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("file", &self.ctx.file)
            .field("stats", &self.storage_stats())
            .finish()
    }
}
