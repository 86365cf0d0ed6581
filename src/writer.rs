//! The node writer and merge engine.
//!
//! Every write funnels through [`update`]: deletes and inline-sized
//! values are routed into their parent record as child-entry changes;
//! everything else gets (or keeps) a record of its own. A record is
//! mutated in place when its embedded tree can absorb the change batch,
//! rewritten otherwise. When a record's address changes, the parent chain
//! is patched by migrating the held lock upward and applying an address
//! swap; freed storage is only released after the parent points at the
//! new address, so an interrupted update can leak records but never break
//! reachability.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};

use crate::btree::{
    BinaryTree, RecordFragmentIo, TreeBuilder, TreeOp, TreeWriteError, FILL_FACTOR_APPEND,
    FILL_FACTOR_PACKED, TREE_PROMOTION_THRESHOLD,
};
use crate::codec::{self, WireValue};
use crate::engine::{locate, ChangeEvent, StoreContext};
use crate::error::{Error, Result};
use crate::lock::NodeLock;
use crate::path::{self, PathKey};
use crate::reader::{
    read_node_value, read_record_info, ChildIterator, NodeInfo, RecordInfo, ValueFilter,
};
use crate::storage::{NodeAllocation, StorageRange};
use crate::value::{NodeValue, ValueType};

/// A change to one child of a record.
#[derive(Debug, Clone)]
pub(crate) enum MergeValue {
    Value(NodeValue),
    /// Address swap from a recursive parent patch. The child's storage
    /// has already moved; the old record must not be deallocated here.
    NodeRef(ValueType, crate::storage::RecordAddress),
    Remove,
}

enum UpdateKind {
    Changes(Vec<(PathKey, MergeValue)>),
    Full { value: NodeValue, merge: bool },
}

/// Store `value` at `path`. With `merge`, existing children not named by
/// the value survive; without it the previous value is replaced whole.
/// A null value deletes the node.
pub(crate) fn update(
    ctx: &StoreContext,
    event_path: &str,
    value: NodeValue,
    merge: bool,
    tid: u64,
) -> Result<()> {
    let max_inline = ctx.settings.max_inline_value_size as usize;
    let (target, kind) = if event_path.is_empty() {
        let value = if value.is_null() {
            NodeValue::Object(Default::default())
        } else {
            value
        };
        if !matches!(value, NodeValue::Object(_)) {
            return Err(Error::UnsupportedValue(
                "the root node must hold an object".into(),
            ));
        }
        (String::new(), UpdateKind::Full { value, merge })
    } else {
        let parent = path::parent_path(event_path).unwrap();
        let key = path::last_key(event_path)?.unwrap();
        if value.is_null() {
            (parent, UpdateKind::Changes(vec![(key, MergeValue::Remove)]))
        } else if value.fits_inline(max_inline) {
            (
                parent,
                UpdateKind::Changes(vec![(key, MergeValue::Value(value))]),
            )
        } else {
            (event_path.to_string(), UpdateKind::Full { value, merge })
        }
    };

    // The highest subscribed ancestor wants old/new values around the
    // write; start the lock there so the pre-state read is covered.
    let top_path = ctx
        .observer
        .as_ref()
        .and_then(|o| o.top_event_path(event_path));
    let lock_start = top_path.clone().unwrap_or_else(|| target.clone());
    let mut lock = ctx.locks.lock(&lock_start, tid, true, "update node")?;

    let old_top = match &top_path {
        Some(tp) => Some(read_event_value(ctx, tp, event_path, tid)?),
        None => None,
    };

    if lock.path() != target {
        lock.move_to(&target, true)?;
    }

    let result = match kind {
        UpdateKind::Changes(changes) => apply_changes(ctx, &mut lock, &target, changes, tid),
        UpdateKind::Full { value, merge } => apply_full(ctx, &mut lock, &target, value, merge, tid),
    };
    result?;
    persist_kit(ctx)?;

    if let (Some(observer), Some(tp)) = (&ctx.observer, &top_path) {
        let new_top = read_event_value(ctx, tp, event_path, tid)?;
        observer.notify(&ChangeEvent {
            path: event_path.to_string(),
            top_path: tp.clone(),
            old_value: old_top.unwrap_or(NodeValue::Null),
            new_value: new_top,
        });
    }
    drop(lock);
    Ok(())
}

/// Read the value an event subscriber sees at `top_path`, bounded to the
/// changed trail when the subscription sits above the written path.
fn read_event_value(
    ctx: &StoreContext,
    top_path: &str,
    changed_path: &str,
    tid: u64,
) -> Result<NodeValue> {
    let node = locate(ctx, top_path, tid)?;
    if !node.exists {
        return Ok(NodeValue::Null);
    }
    if let Some(v) = node.value {
        return Ok(v);
    }
    let Some(addr) = node.address else {
        return Ok(NodeValue::Null);
    };
    let filter = if changed_path != top_path && path::is_ancestor(top_path, changed_path) {
        let rel = &changed_path[top_path.len()..];
        let rel = rel.trim_start_matches('/');
        ValueFilter::new(&[rel], &[], None)
    } else {
        ValueFilter::default()
    };
    let info = read_record_info(ctx, addr)?;
    read_node_value(ctx, top_path, &info, &filter, tid)
}

/// Merge a set of child changes into the record at `path`, creating the
/// node (and its missing ancestors, by recursion) when necessary. The
/// caller's lock must currently sit on `path`; it migrates upward as the
/// parent chain is patched.
fn apply_changes(
    ctx: &StoreContext,
    lock: &mut NodeLock,
    path: &str,
    changes: Vec<(PathKey, MergeValue)>,
    tid: u64,
) -> Result<()> {
    let node = locate(ctx, path, tid)?;

    if node.exists {
        if let Some(addr) = node.address {
            let info = read_record_info(ctx, addr)?;
            if info.value_type.is_composite() {
                let outcome = merge_record(ctx, path, &info, changes, tid)?;
                if let Some(new_info) = &outcome.moved_to {
                    patch_parent(ctx, lock, path, new_info, tid)?;
                }
                ctx.fst.lock().unwrap().release(&outcome.deallocate);
                return Ok(());
            }
        }
    }

    // The node is missing, inline, or a primitive record: build it fresh
    // from the non-removal changes.
    let children: Vec<(PathKey, MergeValue)> = changes
        .into_iter()
        .filter(|(_, m)| !matches!(m, MergeValue::Remove))
        .collect();
    if children.is_empty() {
        // Removing children from a node that has none is a no-op
        return Ok(());
    }

    let mut dealloc: Vec<StorageRange> = Vec::new();
    if node.exists {
        if let Some(addr) = node.address {
            let info = read_record_info(ctx, addr)?;
            dealloc.extend(collect_subtree_ranges(ctx, path, &info, tid, true)?);
        }
    }

    let vtype = if children
        .iter()
        .all(|(k, _)| matches!(k, PathKey::Index(_)))
    {
        ValueType::Array
    } else {
        ValueType::Object
    };
    ctx.cache.lock().unwrap().invalidate(path, false);
    let (body, has_tree) = serialize_children(ctx, path, vtype, children, tid)?;
    let new_info = write_record(ctx, path, vtype, &body, has_tree, None)?;
    if node.address != Some(new_info.address) {
        patch_parent(ctx, lock, path, &new_info, tid)?;
    }
    ctx.fst.lock().unwrap().release(&dealloc);
    Ok(())
}

/// Store a complete value at `path`, merging into an existing composite
/// record when asked to.
fn apply_full(
    ctx: &StoreContext,
    lock: &mut NodeLock,
    path: &str,
    value: NodeValue,
    merge: bool,
    tid: u64,
) -> Result<()> {
    let node = locate(ctx, path, tid)?;
    let existing = match node.address {
        Some(addr) if node.exists => Some(read_record_info(ctx, addr)?),
        _ => None,
    };

    if merge && value.is_composite() {
        if let Some(info) = &existing {
            if info.value_type.is_composite() {
                return apply_changes(ctx, lock, path, value_to_changes(value), tid);
            }
        }
    }

    // Overwrite: the previous value's entire subtree is released once the
    // new record is reachable
    let mut dealloc: Vec<StorageRange> = Vec::new();
    if let Some(info) = &existing {
        dealloc.extend(collect_subtree_ranges(ctx, path, info, tid, false)?);
    }
    ctx.cache.lock().unwrap().invalidate(path, false);
    let new_info = write_node_value(ctx, path, &value, tid, existing.as_ref())?;
    let moved = existing.as_ref().map(|i| i.address) != Some(new_info.address);
    if moved {
        if let Some(info) = &existing {
            dealloc.extend(info.allocation.ranges.iter().copied());
        }
        if !path.is_empty() {
            patch_parent(ctx, lock, path, &new_info, tid)?;
        }
    }
    ctx.fst.lock().unwrap().release(&dealloc);
    Ok(())
}

/// Swap the parent's child entry to a node's new address. Internal: never
/// fires subscriptions, and rides the same lock up the tree.
fn patch_parent(
    ctx: &StoreContext,
    lock: &mut NodeLock,
    path: &str,
    new_info: &RecordInfo,
    tid: u64,
) -> Result<()> {
    if path.is_empty() {
        // The root pointer was updated when the record was written
        return Ok(());
    }
    lock.move_to_parent()?;
    let parent = path::parent_path(path).unwrap();
    let key = path::last_key(path)?.unwrap();
    apply_changes(
        ctx,
        lock,
        &parent,
        vec![(
            key,
            MergeValue::NodeRef(new_info.value_type, new_info.address),
        )],
        tid,
    )
}

fn value_to_changes(value: NodeValue) -> Vec<(PathKey, MergeValue)> {
    match value {
        NodeValue::Object(map) => map
            .into_iter()
            .map(|(k, v)| {
                let mv = if v.is_null() {
                    MergeValue::Remove
                } else {
                    MergeValue::Value(v)
                };
                (PathKey::Name(k), mv)
            })
            .collect(),
        NodeValue::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (PathKey::Index(i as u32), MergeValue::Value(v)))
            .collect(),
        _ => Vec::new(),
    }
}

struct MergeOutcome {
    /// Set when the record was rewritten at a new address
    moved_to: Option<RecordInfo>,
    deallocate: Vec<StorageRange>,
}

/// Apply child changes to an existing composite record: a tree
/// transaction when the layout allows it, a rewrite otherwise.
fn merge_record(
    ctx: &StoreContext,
    path: &str,
    info: &RecordInfo,
    changes: Vec<(PathKey, MergeValue)>,
    tid: u64,
) -> Result<MergeOutcome> {
    let max_inline = ctx.settings.max_inline_value_size as usize;
    let mut dealloc: Vec<StorageRange> = Vec::new();

    // Current state of only the affected children
    let keys: Vec<PathKey> = changes.iter().map(|(k, _)| k.clone()).collect();
    let mut existing: HashMap<PathKey, NodeInfo> = HashMap::new();
    for child in ChildIterator::new(ctx, path, info, Some(keys))?.without_cache_updates() {
        let child = child?;
        existing.insert(child.key.clone().unwrap(), child);
    }

    // Resolve every change to its wire form, scheduling replaced child
    // storage for release and writing new external children first
    let mut resolved: Vec<(PathKey, Option<WireValue>)> = Vec::with_capacity(changes.len());
    for (key, mv) in changes {
        let child_path = path::child_path(path, &key);
        let old_external = existing.get(&key).and_then(|n| n.address);
        match mv {
            MergeValue::Remove => {
                if let Some(addr) = old_external {
                    dealloc.extend(release_child_subtree(ctx, &child_path, addr, info, tid)?);
                }
                ctx.cache.lock().unwrap().invalidate(&child_path, true);
                if existing.contains_key(&key) {
                    resolved.push((key, None));
                }
            }
            MergeValue::Value(v) => {
                if let Some(addr) = old_external {
                    dealloc.extend(release_child_subtree(ctx, &child_path, addr, info, tid)?);
                }
                ctx.cache.lock().unwrap().invalidate(&child_path, false);
                let wire = match WireValue::from_inline_value(&v, max_inline)? {
                    Some(w) => w,
                    None => {
                        let child_info = write_node_value(ctx, &child_path, &v, tid, None)?;
                        WireValue::Record {
                            vtype: child_info.value_type,
                            address: child_info.address,
                        }
                    }
                };
                resolved.push((key, Some(wire)));
            }
            MergeValue::NodeRef(vtype, address) => {
                resolved.push((key, Some(WireValue::Record { vtype, address })));
            }
        }
    }

    if info.has_key_tree {
        let ops: Vec<TreeOp> = resolved
            .iter()
            .map(|(key, wire)| {
                let tree_key = crate::reader::path_key_to_tree_key(info.value_type, key);
                match wire {
                    None => TreeOp::Remove { key: tree_key },
                    Some(w) => {
                        let mut bytes = Vec::with_capacity(w.encoded_len());
                        w.encode(&mut bytes);
                        if existing.contains_key(key) {
                            TreeOp::Update {
                                key: tree_key,
                                value: bytes,
                            }
                        } else {
                            TreeOp::Add {
                                key: tree_key,
                                value: bytes,
                            }
                        }
                    }
                }
            })
            .collect();
        let io = RecordFragmentIo::new(
            &ctx.file,
            &info.allocation,
            info.header_len,
            info.data_len(ctx.file.record_size()) as u32,
        );
        let mut tree = BinaryTree::new(io);
        match tree.transaction(&ops) {
            Ok(()) => {
                log::trace!("merged {} change(s) into tree record at {}", ops.len(), info.address);
                return Ok(MergeOutcome {
                    moved_to: None,
                    deallocate: dealloc,
                });
            }
            Err(TreeWriteError::Fatal(e)) => return Err(e),
            Err(TreeWriteError::NoSpace) => {
                // Rebuild the tree with the changes applied
                let mut builder = TreeBuilder::new(tree_fill_factor(info.value_type, || {
                    resolved.iter().map(|(k, _)| k)
                }));
                for entry in tree.entries()? {
                    builder.insert(entry.key, entry.value);
                }
                for (key, wire) in &resolved {
                    let tree_key = crate::reader::path_key_to_tree_key(info.value_type, key);
                    match wire {
                        None => builder.remove(&tree_key),
                        Some(w) => {
                            let mut bytes = Vec::with_capacity(w.encoded_len());
                            w.encode(&mut bytes);
                            builder.insert(tree_key, bytes);
                        }
                    }
                }
                let body = builder.serialize()?;
                let new_info = write_record(
                    ctx,
                    path,
                    info.value_type,
                    &body,
                    true,
                    Some(&info.allocation),
                )?;
                let moved = new_info.address != info.address;
                if moved {
                    dealloc.extend(info.allocation.ranges.iter().copied());
                }
                return Ok(MergeOutcome {
                    moved_to: moved.then_some(new_info),
                    deallocate: dealloc,
                });
            }
        }
    }

    // Linear layout: rebuild the whole child map, preserving unchanged
    // external children as plain address references
    let mut all: Vec<(PathKey, WireValue)> = Vec::new();
    for child in ChildIterator::new(ctx, path, info, None)?.without_cache_updates() {
        let child = child?;
        let key = child.key.clone().unwrap();
        let wire = match child.address {
            Some(address) => WireValue::Record {
                vtype: child.value_type.unwrap(),
                address,
            },
            None => WireValue::from_inline_value(child.value.as_ref().unwrap(), max_inline)?
                .ok_or_else(|| Error::corrupt("inline child no longer fits inline"))?,
        };
        all.push((key, wire));
    }
    for (key, wire) in resolved {
        let pos = all.iter().position(|(k, _)| *k == key);
        match (pos, wire) {
            (Some(i), None) => {
                all.remove(i);
            }
            (Some(i), Some(w)) => all[i].1 = w,
            (None, Some(w)) => all.push((key, w)),
            (None, None) => {}
        }
    }
    all.sort_by(|(a, _), (b, _)| a.cmp(b));

    let (body, has_tree) = serialize_wire_children(ctx, info.value_type, all)?;
    let new_info = write_record(
        ctx,
        path,
        info.value_type,
        &body,
        has_tree,
        Some(&info.allocation),
    )?;
    let moved = new_info.address != info.address;
    if moved {
        dealloc.extend(info.allocation.ranges.iter().copied());
    }
    Ok(MergeOutcome {
        moved_to: moved.then_some(new_info),
        deallocate: dealloc,
    })
}

/// Read-lock a replaced external child and gather its whole allocation
/// for release.
fn release_child_subtree(
    ctx: &StoreContext,
    child_path: &str,
    addr: crate::storage::RecordAddress,
    parent_info: &RecordInfo,
    tid: u64,
) -> Result<Vec<StorageRange>> {
    if addr == parent_info.address {
        return Err(Error::corrupt(format!(
            "record at {} references itself as child \"{}\"",
            addr, child_path
        )));
    }
    let lock = ctx
        .locks
        .lock(child_path, tid, false, "collect replaced child")?;
    let child_info = read_record_info(ctx, addr)?;
    let ranges = collect_subtree_ranges(ctx, child_path, &child_info, tid, true);
    lock.release();
    ranges
}

/// All ranges used by a node and (recursively) its external descendants.
pub(crate) fn collect_subtree_ranges(
    ctx: &StoreContext,
    path: &str,
    info: &RecordInfo,
    tid: u64,
    include_self: bool,
) -> Result<Vec<StorageRange>> {
    let mut out: Vec<StorageRange> = if include_self {
        info.allocation.ranges.clone()
    } else {
        Vec::new()
    };
    if info.value_type.is_composite() {
        let children: Vec<NodeInfo> = ChildIterator::new(ctx, path, info, None)?
            .without_cache_updates()
            .collect::<Result<_>>()?;
        for child in children {
            if let Some(addr) = child.address {
                out.extend(release_child_subtree(ctx, &child.path, addr, info, tid)?);
            }
        }
    }
    Ok(out)
}

/// Write a brand-new record tree for `value` at `path`, child records
/// first. Only the top record may reuse `current`'s allocation.
fn write_node_value(
    ctx: &StoreContext,
    path: &str,
    value: &NodeValue,
    tid: u64,
    current: Option<&RecordInfo>,
) -> Result<RecordInfo> {
    let vtype = value
        .value_type()
        .ok_or_else(|| Error::UnsupportedValue("cannot store null".into()))?;
    let current_alloc = current.map(|i| &i.allocation);
    match value {
        NodeValue::Object(map) => {
            let children: Vec<(PathKey, MergeValue)> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (PathKey::Name(k.clone()), MergeValue::Value(v.clone())))
                .collect();
            let (body, has_tree) = serialize_children(ctx, path, vtype, children, tid)?;
            write_record(ctx, path, vtype, &body, has_tree, current_alloc)
        }
        NodeValue::Array(items) => {
            if items.iter().any(|v| v.is_null()) && !ctx.settings.remove_void_properties {
                return Err(Error::UnsupportedValue(
                    "arrays cannot hold null entries".into(),
                ));
            }
            let children: Vec<(PathKey, MergeValue)> = items
                .iter()
                .filter(|v| !v.is_null())
                .enumerate()
                .map(|(i, v)| (PathKey::Index(i as u32), MergeValue::Value(v.clone())))
                .collect();
            let (body, has_tree) = serialize_children(ctx, path, vtype, children, tid)?;
            write_record(ctx, path, vtype, &body, has_tree, current_alloc)
        }
        NodeValue::String(s) => write_record(ctx, path, vtype, s.as_bytes(), false, current_alloc),
        NodeValue::Reference(p) => {
            write_record(ctx, path, vtype, p.as_bytes(), false, current_alloc)
        }
        NodeValue::Binary(b) => write_record(ctx, path, vtype, b, false, current_alloc),
        NodeValue::Number(n) => {
            let mut body = [0u8; 8];
            BigEndian::write_f64(&mut body, *n);
            write_record(ctx, path, vtype, &body, false, current_alloc)
        }
        NodeValue::DateTime(ms) => {
            let mut body = [0u8; 8];
            BigEndian::write_i64(&mut body, *ms);
            write_record(ctx, path, vtype, &body, false, current_alloc)
        }
        NodeValue::Boolean(b) => {
            write_record(ctx, path, vtype, &[*b as u8], false, current_alloc)
        }
        NodeValue::Null => unreachable!("guarded above"),
    }
}

/// Resolve child values to wire form (writing new external records along
/// the way) and serialize them as a record body.
fn serialize_children(
    ctx: &StoreContext,
    path: &str,
    parent_type: ValueType,
    children: Vec<(PathKey, MergeValue)>,
    tid: u64,
) -> Result<(Vec<u8>, bool)> {
    let max_inline = ctx.settings.max_inline_value_size as usize;
    let mut resolved: Vec<(PathKey, WireValue)> = Vec::with_capacity(children.len());
    for (key, mv) in children {
        match mv {
            MergeValue::Remove => continue,
            MergeValue::NodeRef(vtype, address) => {
                resolved.push((key, WireValue::Record { vtype, address }));
            }
            MergeValue::Value(v) => {
                let wire = match WireValue::from_inline_value(&v, max_inline)? {
                    Some(w) => w,
                    None => {
                        let child_path = path::child_path(path, &key);
                        let child_info = write_node_value(ctx, &child_path, &v, tid, None)?;
                        WireValue::Record {
                            vtype: child_info.value_type,
                            address: child_info.address,
                        }
                    }
                };
                resolved.push((key, wire));
            }
        }
    }
    resolved.sort_by(|(a, _), (b, _)| a.cmp(b));
    serialize_wire_children(ctx, parent_type, resolved)
}

/// Serialize resolved children: an embedded tree past the promotion
/// threshold, the linear layout below it.
fn serialize_wire_children(
    ctx: &StoreContext,
    parent_type: ValueType,
    children: Vec<(PathKey, WireValue)>,
) -> Result<(Vec<u8>, bool)> {
    if children.len() > TREE_PROMOTION_THRESHOLD {
        let mut builder = TreeBuilder::new(tree_fill_factor(parent_type, || {
            children.iter().map(|(k, _)| k)
        }));
        for (key, wire) in &children {
            let tree_key = crate::reader::path_key_to_tree_key(parent_type, key);
            let mut bytes = Vec::with_capacity(wire.encoded_len());
            wire.encode(&mut bytes);
            builder.insert(tree_key, bytes);
        }
        return Ok((builder.serialize()?, true));
    }
    let mut body = Vec::new();
    let mut kit = ctx.kit.lock().unwrap();
    for (key, wire) in &children {
        codec::encode_entry(key, wire, &mut kit, &mut body)?;
    }
    Ok((body, false))
}

/// Append-friendly trees get room to grow; everything else packs tight.
fn tree_fill_factor<'a, F, I>(parent_type: ValueType, keys: F) -> u8
where
    F: Fn() -> I,
    I: Iterator<Item = &'a PathKey>,
{
    if parent_type == ValueType::Array {
        return FILL_FACTOR_APPEND;
    }
    let all_numeric = keys().all(|k| match k {
        PathKey::Index(_) => true,
        PathKey::Name(n) => !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()),
    });
    if all_numeric {
        FILL_FACTOR_APPEND
    } else {
        FILL_FACTOR_PACKED
    }
}

/// Allocate (or reuse), build the header, and write a record's bytes.
/// The previous allocation is never released here; that stays with the
/// caller so failures leak instead of corrupting.
pub(crate) fn write_record(
    ctx: &StoreContext,
    path: &str,
    value_type: ValueType,
    body: &[u8],
    has_key_tree: bool,
    current: Option<&NodeAllocation>,
) -> Result<RecordInfo> {
    let rs = ctx.file.record_size();
    let page_size = ctx.file.page_size();

    // Required records, assuming worst-case chunk table fragmentation
    let minimal = (4 + body.len() as u64).div_ceil(rs as u64) as u32;
    let required = if minimal > 1 {
        let worst = codec::worst_case_header_size(minimal, page_size);
        ((worst + body.len()) as u64).div_ceil(rs as u64) as u32
    } else {
        1
    };

    let mut allocation = match current {
        Some(cur) if cur.total_records() == required => cur.clone(),
        _ => {
            let ranges = ctx.fst.lock().unwrap().allocate(required, &ctx.file)?;
            let mut alloc = NodeAllocation::new(ranges);
            alloc.normalize();
            alloc
        }
    };

    // Settle the real header size against the allocation shape, trimming
    // surplus records the worst-case estimate reserved. The trimmed tail
    // is only released once the record is fully written.
    let mut trimmed: Vec<StorageRange> = Vec::new();
    let header_len = loop {
        let header_len = codec::header_size(allocation.ranges.len(), allocation.ranges[0].length);
        let needed = ((header_len + body.len()) as u64).div_ceil(rs as u64).max(1) as u32;
        match needed.cmp(&allocation.total_records()) {
            std::cmp::Ordering::Less => {
                trimmed.extend(allocation.trim(needed));
            }
            std::cmp::Ordering::Equal => break header_len,
            std::cmp::Ordering::Greater => {
                // The shape needs a bigger table than reserved; extend
                let extra = needed - allocation.total_records();
                let more = ctx.fst.lock().unwrap().allocate(extra, &ctx.file)?;
                allocation.ranges.extend(more);
                allocation.normalize();
            }
        }
    };

    let total_records = allocation.total_records();
    let total_bytes = header_len + body.len();
    let last_chunk = (total_bytes as u64 - (total_records as u64 - 1) * rs as u64) as u16;
    let header = codec::build_record_header(value_type, has_key_tree, &allocation, last_chunk);
    debug_assert_eq!(header.len(), header_len);

    // One write per range
    let mut stream = header;
    stream.extend_from_slice(body);
    let mut pos = 0usize;
    for range in &allocation.ranges {
        let span = (range.length as usize * rs as usize).min(stream.len() - pos);
        ctx.file
            .write_data(ctx.file.file_index(range.address()), &stream[pos..pos + span])?;
        pos += span;
        if pos >= stream.len() {
            break;
        }
    }

    ctx.fst.lock().unwrap().release(&trimmed);

    let address = allocation.address();
    log::trace!(
        "wrote record for \"{}\" at {}: {} byte(s) over {} record(s)",
        path,
        address,
        total_bytes,
        total_records
    );

    if path.is_empty() {
        let mut header_block = ctx.header.lock().unwrap();
        if header_block.root != Some(address) {
            header_block.root = Some(address);
            ctx.file.write_header_block(&header_block)?;
        }
    } else {
        ctx.cache
            .lock()
            .unwrap()
            .update(path, address, value_type);
    }

    Ok(RecordInfo {
        address,
        value_type,
        has_key_tree,
        header_len: header_len as u32,
        last_chunk_size: last_chunk,
        allocation,
    })
}

/// Write the key-index table through to the header block when it changed
/// during this update.
fn persist_kit(ctx: &StoreContext) -> Result<()> {
    let mut kit = ctx.kit.lock().unwrap();
    if !kit.take_dirty() {
        return Ok(());
    }
    let bytes = kit.to_bytes();
    drop(kit);
    let mut header = ctx.header.lock().unwrap();
    header.kit_bytes = bytes;
    ctx.file.write_header_block(&header)
}
