//! Read and in-place mutation operations over a serialized binary tree.

use byteorder::{BigEndian, ByteOrder};

use super::{TreeEntry, TreeIo, TreeOp, TreeWriteError, LEAF_BLOCK, LEAF_DATA};
use crate::error::{Error, Result};

/// Trees deeper than this are assumed corrupt.
const MAX_DEPTH: usize = 64;

const KIND_BRANCH: u8 = 0;
const KIND_LEAF: u8 = 1;

/// A loaded leaf node with its position in the tree.
#[derive(Debug, Clone)]
pub struct TreeLeaf {
    pub offset: u32,
    pub next: Option<u32>,
    pub entries: Vec<TreeEntry>,
}

struct Branch {
    first_child: u32,
    /// (separator key, child offset); the child holds keys >= separator
    separators: Vec<(Vec<u8>, u32)>,
}

enum Node {
    Branch(Branch),
    Leaf(TreeLeaf),
}

/// Operations over a serialized tree through a [`TreeIo`] backend.
pub struct BinaryTree<I: TreeIo> {
    io: I,
}

impl<I: TreeIo> BinaryTree<I> {
    pub fn new(io: I) -> Self {
        Self { io }
    }

    /// Look up the value bytes stored for a key.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf = self.find_leaf(key)?;
        Ok(leaf
            .entries
            .into_iter()
            .find(|e| e.key == key)
            .map(|e| e.value))
    }

    /// The leftmost leaf; walk the chain with [`BinaryTree::next_leaf`].
    pub fn first_leaf(&mut self) -> Result<TreeLeaf> {
        let mut offset = 0u32;
        for _ in 0..MAX_DEPTH {
            match self.load_node(offset)? {
                Node::Leaf(leaf) => return Ok(leaf),
                Node::Branch(b) => offset = b.first_child,
            }
        }
        Err(Error::corrupt("tree depth is unreasonably large"))
    }

    pub fn next_leaf(&mut self, leaf: &TreeLeaf) -> Result<Option<TreeLeaf>> {
        let Some(next) = leaf.next else {
            return Ok(None);
        };
        match self.load_node(next)? {
            Node::Leaf(leaf) => Ok(Some(leaf)),
            Node::Branch(_) => Err(Error::corrupt("leaf chain points at a branch node")),
        }
    }

    /// Every entry in key order.
    pub fn entries(&mut self) -> Result<Vec<TreeEntry>> {
        let mut out = Vec::new();
        let mut leaf = self.first_leaf()?;
        loop {
            out.extend(leaf.entries.iter().cloned());
            match self.next_leaf(&leaf)? {
                Some(next) => leaf = next,
                None => return Ok(out),
            }
        }
    }

    /// Apply a batch of mutations strictly in place. Either every
    /// operation lands or nothing is written: all modified leaves are
    /// staged and size-checked before the first write. An operation that
    /// would outgrow its leaf's slack fails the batch with
    /// [`TreeWriteError::NoSpace`] and the caller rebuilds the tree.
    pub fn transaction(&mut self, ops: &[TreeOp]) -> std::result::Result<(), TreeWriteError> {
        use std::collections::BTreeMap;

        // Stage: leaf offset -> mutated leaf
        let mut staged: BTreeMap<u32, TreeLeaf> = BTreeMap::new();
        for op in ops {
            let key = op.key();
            let leaf_offset = self.find_leaf(key)?.offset;
            let leaf = match staged.entry(leaf_offset) {
                std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::btree_map::Entry::Vacant(e) => {
                    let loaded = self.find_leaf(key)?;
                    e.insert(loaded)
                }
            };
            match op {
                TreeOp::Add { key, value } | TreeOp::Update { key, value } => {
                    match leaf
                        .entries
                        .binary_search_by(|e| e.key.as_slice().cmp(key.as_slice()))
                    {
                        Ok(i) => leaf.entries[i].value = value.clone(),
                        Err(i) => leaf.entries.insert(
                            i,
                            TreeEntry {
                                key: key.clone(),
                                value: value.clone(),
                            },
                        ),
                    }
                }
                TreeOp::Remove { key } => {
                    if let Ok(i) = leaf
                        .entries
                        .binary_search_by(|e| e.key.as_slice().cmp(key.as_slice()))
                    {
                        leaf.entries.remove(i);
                    }
                }
            }
        }

        // Validate every staged leaf before touching storage
        let mut blocks: Vec<(u32, Vec<u8>)> = Vec::with_capacity(staged.len());
        for (offset, leaf) in &staged {
            let used: usize = leaf
                .entries
                .iter()
                .map(|e| 1 + e.key.len() + 2 + e.value.len())
                .sum();
            if used > LEAF_DATA {
                log::debug!(
                    "tree transaction needs {} bytes in leaf at {}, only {} available",
                    used,
                    offset,
                    LEAF_DATA
                );
                return Err(TreeWriteError::NoSpace);
            }
            blocks.push((*offset, serialize_leaf(leaf)));
        }
        for (offset, block) in blocks {
            self.io.write(offset, &block)?;
        }
        Ok(())
    }

    /// The leaf whose key range covers `key`.
    fn find_leaf(&mut self, key: &[u8]) -> Result<TreeLeaf> {
        let mut offset = 0u32;
        for _ in 0..MAX_DEPTH {
            match self.load_node(offset)? {
                Node::Leaf(leaf) => return Ok(leaf),
                Node::Branch(b) => {
                    let mut child = b.first_child;
                    for (sep, sep_child) in &b.separators {
                        if key >= sep.as_slice() {
                            child = *sep_child;
                        } else {
                            break;
                        }
                    }
                    offset = child;
                }
            }
        }
        Err(Error::corrupt("tree depth is unreasonably large"))
    }

    fn load_node(&mut self, offset: u32) -> Result<Node> {
        if offset >= self.io.len() {
            return Err(Error::corrupt("tree node offset past end of record body"));
        }
        let mut head = [0u8; 3];
        self.io.read(offset, &mut head)?;
        let count = BigEndian::read_u16(&head[1..3]) as usize;
        match head[0] {
            KIND_LEAF => {
                let mut block = vec![0u8; LEAF_BLOCK - 3];
                self.io.read(offset + 3, &mut block)?;
                let next = BigEndian::read_u32(&block[0..4]);
                let mut pos = 6;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let klen = *block
                        .get(pos)
                        .ok_or_else(|| Error::corrupt("tree leaf entry truncated"))?
                        as usize;
                    let key = block
                        .get(pos + 1..pos + 1 + klen)
                        .ok_or_else(|| Error::corrupt("tree leaf entry truncated"))?
                        .to_vec();
                    pos += 1 + klen;
                    let vlen = BigEndian::read_u16(
                        block
                            .get(pos..pos + 2)
                            .ok_or_else(|| Error::corrupt("tree leaf entry truncated"))?,
                    ) as usize;
                    let value = block
                        .get(pos + 2..pos + 2 + vlen)
                        .ok_or_else(|| Error::corrupt("tree leaf entry truncated"))?
                        .to_vec();
                    pos += 2 + vlen;
                    entries.push(TreeEntry { key, value });
                }
                Ok(Node::Leaf(TreeLeaf {
                    offset,
                    next: (next != u32::MAX).then_some(next),
                    entries,
                }))
            }
            KIND_BRANCH => {
                let mut size_buf = [0u8; 6];
                self.io.read(offset + 3, &mut size_buf)?;
                let size = BigEndian::read_u16(&size_buf[0..2]) as usize;
                let first_child = BigEndian::read_u32(&size_buf[2..6]);
                if size < 9 {
                    return Err(Error::corrupt("tree branch node size too small"));
                }
                let mut body = vec![0u8; size - 9];
                self.io.read(offset + 9, &mut body)?;
                let mut pos = 0;
                let mut separators = Vec::with_capacity(count);
                for _ in 0..count {
                    let klen = *body
                        .get(pos)
                        .ok_or_else(|| Error::corrupt("tree branch entry truncated"))?
                        as usize;
                    let key = body
                        .get(pos + 1..pos + 1 + klen)
                        .ok_or_else(|| Error::corrupt("tree branch entry truncated"))?
                        .to_vec();
                    pos += 1 + klen;
                    let child = BigEndian::read_u32(
                        body.get(pos..pos + 4)
                            .ok_or_else(|| Error::corrupt("tree branch entry truncated"))?,
                    );
                    pos += 4;
                    separators.push((key, child));
                }
                Ok(Node::Branch(Branch {
                    first_child,
                    separators,
                }))
            }
            other => Err(Error::corrupt(format!(
                "unknown tree node kind {} at offset {}",
                other, offset
            ))),
        }
    }
}

fn serialize_leaf(leaf: &TreeLeaf) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEAF_BLOCK);
    out.push(KIND_LEAF);
    out.extend_from_slice(&(leaf.entries.len() as u16).to_be_bytes());
    out.extend_from_slice(&leaf.next.unwrap_or(u32::MAX).to_be_bytes());
    let used: usize = leaf
        .entries
        .iter()
        .map(|e| 1 + e.key.len() + 2 + e.value.len())
        .sum();
    out.extend_from_slice(&((LEAF_DATA - used) as u16).to_be_bytes());
    for e in &leaf.entries {
        out.push(e.key.len() as u8);
        out.extend_from_slice(&e.key);
        out.extend_from_slice(&(e.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&e.value);
    }
    out.resize(LEAF_BLOCK, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::super::{index_key, TreeBuilder};
    use super::*;

    fn build(entries: &[(&[u8], &[u8])], fill: u8) -> Vec<u8> {
        let mut b = TreeBuilder::new(fill);
        for (k, v) in entries {
            b.insert(k.to_vec(), v.to_vec());
        }
        b.serialize().unwrap()
    }

    #[test]
    fn single_leaf_find() {
        let bytes = build(&[(b"alpha", b"1"), (b"beta", b"2"), (b"gamma", b"3")], 95);
        let mut tree = BinaryTree::new(bytes);
        assert_eq!(tree.find(b"beta").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.find(b"delta").unwrap(), None);
        let leaf = tree.first_leaf().unwrap();
        assert_eq!(leaf.entries.len(), 3);
        assert!(leaf.next.is_none());
    }

    #[test]
    fn multi_level_find_and_walk() {
        // Enough entries to force several leaves and at least one branch
        let keys: Vec<Vec<u8>> = (0..500u32).map(index_key).collect();
        let mut b = TreeBuilder::new(95);
        for k in &keys {
            b.insert(k.clone(), format!("v{}", BigEndian::read_u32(k)).into_bytes());
        }
        let mut tree = BinaryTree::new(b.serialize().unwrap());

        for (i, k) in keys.iter().enumerate() {
            assert_eq!(
                tree.find(k).unwrap(),
                Some(format!("v{}", i).into_bytes()),
                "key {}",
                i
            );
        }
        assert_eq!(tree.find(&index_key(500)).unwrap(), None);

        // The leaf chain yields every entry in key order
        let entries = tree.entries().unwrap();
        assert_eq!(entries.len(), 500);
        assert!(entries.windows(2).all(|w| w[0].key < w[1].key));
    }

    #[test]
    fn empty_tree() {
        let bytes = TreeBuilder::new(95).serialize().unwrap();
        let mut tree = BinaryTree::new(bytes);
        assert_eq!(tree.find(b"anything").unwrap(), None);
        assert!(tree.entries().unwrap().is_empty());
    }

    #[test]
    fn in_place_update_within_slack() {
        let bytes = build(&[(b"a", b"one"), (b"b", b"two")], 50);
        let mut tree = BinaryTree::new(bytes);
        tree.transaction(&[
            TreeOp::Update {
                key: b"a".to_vec(),
                value: b"ONE!".to_vec(),
            },
            TreeOp::Add {
                key: b"c".to_vec(),
                value: b"three".to_vec(),
            },
            TreeOp::Remove { key: b"b".to_vec() },
        ])
        .unwrap();
        assert_eq!(tree.find(b"a").unwrap(), Some(b"ONE!".to_vec()));
        assert_eq!(tree.find(b"b").unwrap(), None);
        assert_eq!(tree.find(b"c").unwrap(), Some(b"three".to_vec()));
    }

    #[test]
    fn transaction_fails_when_leaf_overflows() {
        let bytes = build(&[(b"a", b"x")], 95);
        let mut tree = BinaryTree::new(bytes);
        // A single leaf only has LEAF_DATA bytes; blow past it
        let huge = vec![0u8; 200];
        let ops: Vec<TreeOp> = (0..4)
            .map(|i| TreeOp::Add {
                key: vec![b'k', i as u8],
                value: huge.clone(),
            })
            .collect();
        let err = tree.transaction(&ops);
        assert!(matches!(err, Err(TreeWriteError::NoSpace)));
        // Nothing was written
        assert_eq!(tree.find(b"a").unwrap(), Some(b"x".to_vec()));
        assert_eq!(tree.find(&[b'k', 0]).unwrap(), None);
    }

    #[test]
    fn rebuild_from_entries() {
        let bytes = build(&[(b"a", b"1"), (b"b", b"2")], 95);
        let mut tree = BinaryTree::new(bytes);
        let mut builder = TreeBuilder::new(95);
        for e in tree.entries().unwrap() {
            builder.insert(e.key, e.value);
        }
        builder.insert(b"c".to_vec(), b"3".to_vec());
        let mut rebuilt = BinaryTree::new(builder.serialize().unwrap());
        assert_eq!(rebuilt.find(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(rebuilt.find(b"c").unwrap(), Some(b"3".to_vec()));
    }
}
