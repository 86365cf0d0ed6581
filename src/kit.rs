//! The key-index table: a file-wide interning dictionary for property
//! names. Interned keys are referenced from child entry headers by a
//! 15-bit index instead of their inline bytes. The serialized table lives
//! in the file header block; once that region is full, new keys simply
//! stay inline.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::path::MAX_KEY_LEN;
use crate::storage::KIT_CAPACITY;

/// Highest index addressable by the 15-bit wire form.
pub const MAX_KEY_INDEX: usize = 32767;

#[derive(Debug, Default)]
pub struct KeyIndexTable {
    keys: Vec<String>,
    index: HashMap<String, u16>,
    /// Serialized size so far: 2 count bytes plus len byte + bytes per key
    bytes_used: usize,
    dirty: bool,
}

impl KeyIndexTable {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            index: HashMap::new(),
            bytes_used: 2,
            dirty: false,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut ret = Self::new();
        if bytes.is_empty() {
            return Ok(ret);
        }
        let Some(count) = bytes.get(..2).map(|b| u16::from_be_bytes([b[0], b[1]])) else {
            return Err(Error::corrupt("key-index table too short"));
        };
        let mut pos = 2;
        for _ in 0..count {
            let Some(&len) = bytes.get(pos) else {
                return Err(Error::corrupt("key-index table truncated"));
            };
            pos += 1;
            let Some(raw) = bytes.get(pos..pos + len as usize) else {
                return Err(Error::corrupt("key-index table truncated"));
            };
            pos += len as usize;
            let key = std::str::from_utf8(raw)
                .map_err(|_| Error::corrupt("key-index table holds a non-UTF-8 key"))?;
            ret.push_key(key.to_string());
        }
        ret.dirty = false;
        Ok(ret)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes_used);
        out.extend_from_slice(&(self.keys.len() as u16).to_be_bytes());
        for key in &self.keys {
            out.push(key.len() as u8);
            out.extend_from_slice(key.as_bytes());
        }
        out
    }

    fn push_key(&mut self, key: String) -> u16 {
        let idx = self.keys.len() as u16;
        self.bytes_used += 1 + key.len();
        self.index.insert(key.clone(), idx);
        self.keys.push(key);
        self.dirty = true;
        idx
    }

    /// Look up or intern a key. `None` means the caller should fall back
    /// to inline key bytes.
    pub fn get_or_add(&mut self, key: &str) -> Option<u16> {
        if let Some(&idx) = self.index.get(key) {
            return Some(idx);
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN || !key.is_ascii() {
            return None;
        }
        if self.keys.len() > MAX_KEY_INDEX {
            return None;
        }
        if self.bytes_used + 1 + key.len() > KIT_CAPACITY {
            return None;
        }
        let idx = self.push_key(key.to_string());
        log::trace!("interned key \"{}\" at index {}", key, idx);
        Some(idx)
    }

    /// Resolve an interned index back to its key name.
    pub fn get(&self, idx: u16) -> Option<&str> {
        self.keys.get(idx as usize).map(|s| s.as_str())
    }

    /// Whether the table changed since the last serialization; clears the
    /// flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut kit = KeyIndexTable::new();
        let a = kit.get_or_add("name").unwrap();
        let b = kit.get_or_add("max_players").unwrap();
        assert_ne!(a, b);
        assert_eq!(kit.get_or_add("name"), Some(a));
        assert_eq!(kit.get(a), Some("name"));
        assert_eq!(kit.get(b), Some("max_players"));
        assert!(kit.take_dirty());
        assert!(!kit.take_dirty());
    }

    #[test]
    fn serialization_round_trip() {
        let mut kit = KeyIndexTable::new();
        kit.get_or_add("title").unwrap();
        kit.get_or_add("n").unwrap();
        let bytes = kit.to_bytes();
        let loaded = KeyIndexTable::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.get(0), Some("title"));
        assert_eq!(loaded.get(1), Some("n"));
        assert_eq!(loaded.to_bytes(), bytes);
    }

    #[test]
    fn ineligible_keys_fall_back_inline() {
        let mut kit = KeyIndexTable::new();
        assert_eq!(kit.get_or_add(""), None);
        assert_eq!(kit.get_or_add(&"k".repeat(MAX_KEY_LEN + 1)), None);
        assert_eq!(kit.get_or_add("né"), None);
    }
}
