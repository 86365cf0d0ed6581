//! Binary record format: the record header with its chunk table, and the
//! child entries stored in a record body.
//!
//! Record header, starting at the first record of an allocation:
//!
//! - byte 0: high nibble flags (key-tree, record lock bits), low nibble
//!   value type
//! - chunk table entries, each led by a type byte:
//!   - `0x00` terminator, followed by the u16 byte length of the last chunk
//!   - `0x01` u16: extra length of the first range beyond its implicit
//!     single record
//!   - `0x02` u32 page + u16 record + u16 length: an additional range
//!   - `0x03` reserved for contiguous-pages runs; never produced, rejected
//!
//! Child entry, inside an OBJECT/ARRAY body (arrays omit the key info):
//!
//! - key info: bit 7 set → 15-bit key-index-table index; bit 7 clear →
//!   inline key length − 1 followed by that many ASCII bytes
//! - value info byte 0: value type nibble | tiny payload nibble
//! - value info byte 1: bits 7..6 location (deleted/tiny/inline/record),
//!   bits 5..0 inline length − 1
//! - payload: none (tiny), `length` bytes (inline), or a 6-byte record
//!   address (external)
//!
//! Decoding is incremental: an entry truncated at a chunk boundary comes
//! back as [`DecodedEntry::NeedMore`], a normal signal on the streaming
//! hot path, not an error.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::kit::KeyIndexTable;
use crate::path::{self, PathKey};
use crate::storage::{NodeAllocation, RecordAddress, StorageRange};
use crate::value::{NodeValue, ValueType};

pub const FLAG_KEY_TREE: u8 = 0x40;
pub const FLAG_READ_LOCK: u8 = 0x20;
pub const FLAG_WRITE_LOCK: u8 = 0x10;

const CT_END: u8 = 0x00;
const CT_FIRST_EXTRA: u8 = 0x01;
const CT_RANGE: u8 = 0x02;
const CT_PAGES: u8 = 0x03;

const LOC_DELETED: u8 = 0;
const LOC_TINY: u8 = 1;
const LOC_INLINE: u8 = 2;
const LOC_RECORD: u8 = 3;

/// Fully parsed record header.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHeader {
    pub value_type: ValueType,
    pub has_key_tree: bool,
    pub allocation: NodeAllocation,
    pub last_chunk_size: u16,
    pub header_len: u32,
}

/// Exact serialized header size for an allocation shape.
pub fn header_size(range_count: usize, first_range_len: u16) -> usize {
    1 + if first_range_len > 1 { 3 } else { 0 } + 9 * range_count.saturating_sub(1) + 3
}

/// Upper bound on the header size for any allocation shape the
/// free-space table can return for `total_records`.
pub fn worst_case_header_size(total_records: u32, page_size: u32) -> usize {
    let spanned_pages = total_records.div_ceil(page_size) as usize;
    let ranges = crate::fst::MAX_FRAGMENTS - 1 + spanned_pages;
    1 + 3 + 9 * ranges.saturating_sub(1) + 3
}

/// Serialize a record header for `allocation`.
pub fn build_record_header(
    value_type: ValueType,
    has_key_tree: bool,
    allocation: &NodeAllocation,
    last_chunk_size: u16,
) -> Vec<u8> {
    let first = allocation.ranges[0];
    let mut out = Vec::with_capacity(header_size(allocation.ranges.len(), first.length));
    let flags = if has_key_tree { FLAG_KEY_TREE } else { 0 };
    out.push(flags | value_type as u8);
    if first.length > 1 {
        out.push(CT_FIRST_EXTRA);
        out.extend_from_slice(&(first.length - 1).to_be_bytes());
    }
    for r in &allocation.ranges[1..] {
        out.push(CT_RANGE);
        out.extend_from_slice(&r.page.to_be_bytes());
        out.extend_from_slice(&r.record.to_be_bytes());
        out.extend_from_slice(&r.length.to_be_bytes());
    }
    out.push(CT_END);
    out.extend_from_slice(&last_chunk_size.to_be_bytes());
    out
}

/// Parse a record header from the bytes at `addr`. Returns `None` when
/// the chunk table continues past the end of `buf`; the caller reads the
/// next record of the first range and retries.
pub fn try_parse_header(addr: RecordAddress, buf: &[u8]) -> Result<Option<ParsedHeader>> {
    let Some(&b0) = buf.first() else {
        return Ok(None);
    };
    if b0 & 0x80 != 0 {
        return Err(Error::corrupt(format!(
            "undefined record flag bit set in record at {}",
            addr
        )));
    }
    let Some(value_type) = ValueType::from_nibble(b0 & 0x0F) else {
        return Err(Error::corrupt(format!(
            "invalid value type nibble {:#x} in record at {}",
            b0 & 0x0F,
            addr
        )));
    };
    let has_key_tree = b0 & FLAG_KEY_TREE != 0;

    let mut pos = 1usize;
    let mut first_len: u16 = 1;
    let mut extra_ranges: Vec<StorageRange> = Vec::new();
    let last_chunk_size = loop {
        let Some(&entry_type) = buf.get(pos) else {
            return Ok(None);
        };
        match entry_type {
            CT_END => {
                let Some(len) = buf.get(pos + 1..pos + 3) else {
                    return Ok(None);
                };
                pos += 3;
                break BigEndian::read_u16(len);
            }
            CT_FIRST_EXTRA => {
                let Some(extra) = buf.get(pos + 1..pos + 3) else {
                    return Ok(None);
                };
                first_len = 1 + BigEndian::read_u16(extra);
                pos += 3;
            }
            CT_RANGE => {
                let Some(raw) = buf.get(pos + 1..pos + 9) else {
                    return Ok(None);
                };
                extra_ranges.push(StorageRange::new(
                    BigEndian::read_u32(&raw[0..4]),
                    BigEndian::read_u16(&raw[4..6]),
                    BigEndian::read_u16(&raw[6..8]),
                ));
                pos += 9;
            }
            CT_PAGES => {
                return Err(Error::corrupt(format!(
                    "reserved chunk table entry type 3 in record at {}",
                    addr
                )));
            }
            other => {
                return Err(Error::corrupt(format!(
                    "unknown chunk table entry type {} in record at {}",
                    other, addr
                )));
            }
        }
    };

    let mut ranges = Vec::with_capacity(1 + extra_ranges.len());
    ranges.push(StorageRange::new(addr.page, addr.record, first_len));
    ranges.extend(extra_ranges);
    Ok(Some(ParsedHeader {
        value_type,
        has_key_tree,
        allocation: NodeAllocation::new(ranges),
        last_chunk_size,
        header_len: pos as u32,
    }))
}

/// A child's value in wire form: decided, but not yet byte-serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Tiny { vtype: ValueType, payload: u8 },
    Inline { vtype: ValueType, bytes: Vec<u8> },
    Record { vtype: ValueType, address: RecordAddress },
}

impl WireValue {
    pub fn vtype(&self) -> ValueType {
        match self {
            WireValue::Tiny { vtype, .. }
            | WireValue::Inline { vtype, .. }
            | WireValue::Record { vtype, .. } => *vtype,
        }
    }

    pub fn address(&self) -> Option<RecordAddress> {
        match self {
            WireValue::Record { address, .. } => Some(*address),
            _ => None,
        }
    }

    /// Wire form for a value small enough to live in its parent record.
    /// `None` means the value needs a record of its own.
    pub fn from_inline_value(value: &NodeValue, max_inline: usize) -> Result<Option<WireValue>> {
        let wire = match value {
            NodeValue::Null => {
                return Err(Error::UnsupportedValue(
                    "null cannot be stored as a child value".into(),
                ))
            }
            NodeValue::Boolean(b) => WireValue::Tiny {
                vtype: ValueType::Boolean,
                payload: *b as u8,
            },
            NodeValue::Number(n) => {
                if n.fract() == 0.0 && (0.0..=15.0).contains(n) {
                    WireValue::Tiny {
                        vtype: ValueType::Number,
                        payload: *n as u8,
                    }
                } else {
                    let mut bytes = vec![0u8; 8];
                    BigEndian::write_f64(&mut bytes, *n);
                    WireValue::Inline {
                        vtype: ValueType::Number,
                        bytes,
                    }
                }
            }
            NodeValue::DateTime(ms) => {
                let mut bytes = vec![0u8; 8];
                BigEndian::write_i64(&mut bytes, *ms);
                WireValue::Inline {
                    vtype: ValueType::DateTime,
                    bytes,
                }
            }
            NodeValue::String(s) => return Ok(text_wire(ValueType::String, s, max_inline)),
            NodeValue::Reference(p) => return Ok(text_wire(ValueType::Reference, p, max_inline)),
            NodeValue::Binary(b) => {
                if b.is_empty() {
                    WireValue::Tiny {
                        vtype: ValueType::Binary,
                        payload: 0,
                    }
                } else if b.len() < max_inline {
                    WireValue::Inline {
                        vtype: ValueType::Binary,
                        bytes: b.clone(),
                    }
                } else {
                    return Ok(None);
                }
            }
            NodeValue::Object(o) => {
                if o.is_empty() {
                    WireValue::Tiny {
                        vtype: ValueType::Object,
                        payload: 0,
                    }
                } else {
                    return Ok(None);
                }
            }
            NodeValue::Array(a) => {
                if a.is_empty() {
                    WireValue::Tiny {
                        vtype: ValueType::Array,
                        payload: 0,
                    }
                } else {
                    return Ok(None);
                }
            }
        };
        Ok(Some(wire))
    }

    /// Decode a tiny or inline wire value back into a native value.
    pub fn to_node_value(&self) -> Result<NodeValue> {
        match self {
            WireValue::Tiny { vtype, payload } => Ok(match vtype {
                ValueType::Boolean => NodeValue::Boolean(*payload != 0),
                ValueType::Number => NodeValue::Number(*payload as f64),
                ValueType::String => NodeValue::String(String::new()),
                ValueType::Reference => NodeValue::Reference(String::new()),
                ValueType::Binary => NodeValue::Binary(Vec::new()),
                ValueType::Object => NodeValue::Object(Default::default()),
                ValueType::Array => NodeValue::Array(Vec::new()),
                ValueType::DateTime => {
                    return Err(Error::corrupt("tiny datetime value is not defined"))
                }
            }),
            WireValue::Inline { vtype, bytes } => match vtype {
                ValueType::Number => {
                    if bytes.len() != 8 {
                        return Err(Error::corrupt("inline number payload must be 8 bytes"));
                    }
                    Ok(NodeValue::Number(BigEndian::read_f64(bytes)))
                }
                ValueType::DateTime => {
                    if bytes.len() != 8 {
                        return Err(Error::corrupt("inline datetime payload must be 8 bytes"));
                    }
                    Ok(NodeValue::DateTime(BigEndian::read_i64(bytes)))
                }
                ValueType::String => Ok(NodeValue::String(utf8(bytes)?)),
                ValueType::Reference => Ok(NodeValue::Reference(utf8(bytes)?)),
                ValueType::Binary => Ok(NodeValue::Binary(bytes.clone())),
                ValueType::Boolean => Ok(NodeValue::Boolean(bytes.first().copied() != Some(0))),
                ValueType::Object | ValueType::Array => Err(Error::UnsupportedValue(
                    "non-empty composites are never stored inline".into(),
                )),
            },
            WireValue::Record { .. } => Err(Error::corrupt(
                "external value cannot be decoded without reading its record",
            )),
        }
    }

    pub fn encoded_len(&self) -> usize {
        2 + match self {
            WireValue::Tiny { .. } => 0,
            WireValue::Inline { bytes, .. } => bytes.len(),
            WireValue::Record { .. } => 6,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            WireValue::Tiny { vtype, payload } => {
                out.push((*vtype as u8) << 4 | (payload & 0x0F));
                out.push(LOC_TINY << 6);
            }
            WireValue::Inline { vtype, bytes } => {
                debug_assert!(!bytes.is_empty() && bytes.len() <= 64);
                out.push((*vtype as u8) << 4);
                out.push(LOC_INLINE << 6 | (bytes.len() as u8 - 1));
                out.extend_from_slice(bytes);
            }
            WireValue::Record { vtype, address } => {
                out.push((*vtype as u8) << 4);
                out.push(LOC_RECORD << 6);
                out.extend_from_slice(&address.page.to_be_bytes());
                out.extend_from_slice(&address.record.to_be_bytes());
            }
        }
    }

    /// Decode a value-info + payload. `None` = more bytes needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(WireValue, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let (v0, v1) = (buf[0], buf[1]);
        let Some(vtype) = ValueType::from_nibble(v0 >> 4) else {
            return Err(Error::corrupt(format!(
                "invalid child value type nibble {:#x}",
                v0 >> 4
            )));
        };
        match v1 >> 6 {
            LOC_TINY => Ok(Some((
                WireValue::Tiny {
                    vtype,
                    payload: v0 & 0x0F,
                },
                2,
            ))),
            LOC_INLINE => {
                let len = (v1 & 0x3F) as usize + 1;
                let Some(bytes) = buf.get(2..2 + len) else {
                    return Ok(None);
                };
                Ok(Some((
                    WireValue::Inline {
                        vtype,
                        bytes: bytes.to_vec(),
                    },
                    2 + len,
                )))
            }
            LOC_RECORD => {
                let Some(raw) = buf.get(2..8) else {
                    return Ok(None);
                };
                Ok(Some((
                    WireValue::Record {
                        vtype,
                        address: RecordAddress::new(
                            BigEndian::read_u32(&raw[0..4]),
                            BigEndian::read_u16(&raw[4..6]),
                        ),
                    },
                    8,
                )))
            }
            LOC_DELETED => Err(Error::corrupt(
                "deleted child placeholder encountered while reading",
            )),
            _ => unreachable!(),
        }
    }
}

fn text_wire(vtype: ValueType, s: &str, max_inline: usize) -> Option<WireValue> {
    if s.is_empty() {
        Some(WireValue::Tiny { vtype, payload: 0 })
    } else if s.len() < max_inline {
        Some(WireValue::Inline {
            vtype,
            bytes: s.as_bytes().to_vec(),
        })
    } else {
        None
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::corrupt("inline text payload is not valid UTF-8"))
}

/// Serialize the key info of a child entry. Array entries carry none.
pub fn encode_key(key: &PathKey, kit: &mut KeyIndexTable, out: &mut Vec<u8>) -> Result<()> {
    match key {
        PathKey::Index(_) => Ok(()),
        PathKey::Name(name) => {
            path::validate_key(name)?;
            if let Some(idx) = kit.get_or_add(name) {
                out.push(0x80 | (idx >> 8) as u8);
                out.push((idx & 0xFF) as u8);
            } else {
                out.push((name.len() - 1) as u8);
                out.extend_from_slice(name.as_bytes());
            }
            Ok(())
        }
    }
}

/// Serialize one full child entry.
pub fn encode_entry(
    key: &PathKey,
    value: &WireValue,
    kit: &mut KeyIndexTable,
    out: &mut Vec<u8>,
) -> Result<()> {
    encode_key(key, kit, out)?;
    value.encode(out);
    Ok(())
}

/// A decoded child entry with the number of bytes it consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEntry {
    Entry {
        key: PathKey,
        value: WireValue,
        consumed: usize,
    },
    /// The entry straddles the end of the buffer; feed more bytes
    NeedMore,
}

/// Incremental decoder over a linear record body.
#[derive(Debug)]
pub struct EntryDecoder {
    parent_type: ValueType,
    next_index: u32,
}

impl EntryDecoder {
    pub fn new(parent_type: ValueType) -> Self {
        debug_assert!(parent_type.is_composite());
        Self {
            parent_type,
            next_index: 0,
        }
    }

    /// Decode the next entry from the front of `buf`. Consumes nothing on
    /// [`DecodedEntry::NeedMore`], so the caller can retry with the same
    /// bytes plus the next chunk.
    pub fn decode_next(&mut self, buf: &[u8], kit: &KeyIndexTable) -> Result<DecodedEntry> {
        let (key, key_len) = match self.parent_type {
            ValueType::Array => (PathKey::Index(self.next_index), 0),
            _ => {
                let Some(&k0) = buf.first() else {
                    return Ok(DecodedEntry::NeedMore);
                };
                if k0 & 0x80 != 0 {
                    let Some(&k1) = buf.get(1) else {
                        return Ok(DecodedEntry::NeedMore);
                    };
                    let idx = ((k0 & 0x7F) as u16) << 8 | k1 as u16;
                    let Some(name) = kit.get(idx) else {
                        return Err(Error::corrupt(format!("unknown key index {}", idx)));
                    };
                    (PathKey::Name(name.to_string()), 2)
                } else {
                    let len = (k0 & 0x7F) as usize + 1;
                    let Some(raw) = buf.get(1..1 + len) else {
                        return Ok(DecodedEntry::NeedMore);
                    };
                    if !raw.is_ascii() {
                        return Err(Error::corrupt("inline key is not ASCII"));
                    }
                    (
                        PathKey::Name(String::from_utf8(raw.to_vec()).unwrap()),
                        1 + len,
                    )
                }
            }
        };

        let Some((value, value_len)) = WireValue::decode(&buf[key_len..])? else {
            return Ok(DecodedEntry::NeedMore);
        };
        if self.parent_type == ValueType::Array {
            self.next_index += 1;
        }
        Ok(DecodedEntry::Entry {
            key,
            value,
            consumed: key_len + value_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_single_record() {
        let addr = RecordAddress::new(2, 7);
        let alloc = NodeAllocation::single(addr, 1);
        let bytes = build_record_header(ValueType::Object, false, &alloc, 100);
        assert_eq!(bytes.len(), 4);
        let parsed = try_parse_header(addr, &bytes).unwrap().unwrap();
        assert_eq!(parsed.value_type, ValueType::Object);
        assert!(!parsed.has_key_tree);
        assert_eq!(parsed.allocation, alloc);
        assert_eq!(parsed.last_chunk_size, 100);
        assert_eq!(parsed.header_len, 4);
    }

    #[test]
    fn header_round_trip_fragmented() {
        let addr = RecordAddress::new(0, 3);
        let alloc = NodeAllocation::new(vec![
            StorageRange::new(0, 3, 5),
            StorageRange::new(4, 0, 2),
            StorageRange::new(9, 10, 1),
        ]);
        let bytes = build_record_header(ValueType::Array, true, &alloc, 17);
        assert_eq!(bytes.len(), header_size(3, 5));
        let parsed = try_parse_header(addr, &bytes).unwrap().unwrap();
        assert!(parsed.has_key_tree);
        assert_eq!(parsed.allocation, alloc);
        assert_eq!(parsed.last_chunk_size, 17);
    }

    #[test]
    fn header_needs_more_when_truncated() {
        let addr = RecordAddress::new(0, 0);
        let alloc = NodeAllocation::new(vec![
            StorageRange::new(0, 0, 2),
            StorageRange::new(1, 0, 2),
        ]);
        let bytes = build_record_header(ValueType::Object, false, &alloc, 9);
        for cut in 0..bytes.len() {
            assert!(try_parse_header(addr, &bytes[..cut]).unwrap().is_none());
        }
        assert!(try_parse_header(addr, &bytes).unwrap().is_some());
    }

    #[test]
    fn header_rejects_reserved_type() {
        let buf = [ValueType::Object as u8, CT_PAGES, 0, 0, 0, 0, 0, 0];
        assert!(try_parse_header(RecordAddress::new(0, 0), &buf).is_err());
    }

    #[test]
    fn tiny_values() {
        for (v, vt, payload) in [
            (NodeValue::Boolean(true), ValueType::Boolean, 1),
            (NodeValue::Boolean(false), ValueType::Boolean, 0),
            (NodeValue::Number(0.0), ValueType::Number, 0),
            (NodeValue::Number(15.0), ValueType::Number, 15),
            (NodeValue::str(""), ValueType::String, 0),
            (NodeValue::Array(vec![]), ValueType::Array, 0),
            (NodeValue::Object(Default::default()), ValueType::Object, 0),
            (NodeValue::Binary(vec![]), ValueType::Binary, 0),
            (NodeValue::Reference(String::new()), ValueType::Reference, 0),
        ] {
            let wire = WireValue::from_inline_value(&v, 50).unwrap().unwrap();
            assert_eq!(
                wire,
                WireValue::Tiny { vtype: vt, payload },
                "value {:?}",
                v
            );
            assert_eq!(wire.to_node_value().unwrap(), v);
        }
        // 16 no longer fits the tiny nibble
        let wire = WireValue::from_inline_value(&NodeValue::Number(16.0), 50)
            .unwrap()
            .unwrap();
        assert!(matches!(wire, WireValue::Inline { .. }));
    }

    #[test]
    fn inline_value_round_trips() {
        let values = [
            NodeValue::Number(12345.6789),
            NodeValue::Number(-3.0),
            NodeValue::DateTime(1_722_470_400_000),
            NodeValue::str("hello world"),
            NodeValue::Binary(vec![1, 2, 3, 0xFF]),
            NodeValue::Reference("users/ewout".into()),
        ];
        for v in values {
            let wire = WireValue::from_inline_value(&v, 50).unwrap().unwrap();
            let mut buf = Vec::new();
            wire.encode(&mut buf);
            assert_eq!(buf.len(), wire.encoded_len());
            let (decoded, used) = WireValue::decode(&buf).unwrap().unwrap();
            assert_eq!(used, buf.len());
            assert_eq!(decoded.to_node_value().unwrap(), v, "value {:?}", v);
        }
    }

    #[test]
    fn oversized_values_go_external() {
        let v = NodeValue::str("x".repeat(50));
        assert_eq!(WireValue::from_inline_value(&v, 50).unwrap(), None);
        let v = NodeValue::str("x".repeat(49));
        assert!(WireValue::from_inline_value(&v, 50).unwrap().is_some());
    }

    #[test]
    fn entry_decoding_with_interned_and_inline_keys() {
        let mut kit = KeyIndexTable::new();
        let mut buf = Vec::new();
        // Interned key
        encode_entry(
            &PathKey::name("name"),
            &WireValue::Inline {
                vtype: ValueType::String,
                bytes: b"g".to_vec(),
            },
            &mut kit,
            &mut buf,
        )
        .unwrap();
        // External child
        encode_entry(
            &PathKey::name("config"),
            &WireValue::Record {
                vtype: ValueType::Object,
                address: RecordAddress::new(5, 2),
            },
            &mut kit,
            &mut buf,
        )
        .unwrap();

        let mut decoder = EntryDecoder::new(ValueType::Object);
        let DecodedEntry::Entry {
            key,
            value,
            consumed,
        } = decoder.decode_next(&buf, &kit).unwrap()
        else {
            panic!("expected full entry");
        };
        assert_eq!(key, PathKey::name("name"));
        assert_eq!(value.to_node_value().unwrap(), NodeValue::str("g"));

        let DecodedEntry::Entry { key, value, .. } =
            decoder.decode_next(&buf[consumed..], &kit).unwrap()
        else {
            panic!("expected full entry");
        };
        assert_eq!(key, PathKey::name("config"));
        assert_eq!(value.address(), Some(RecordAddress::new(5, 2)));
    }

    #[test]
    fn entry_decoding_is_incremental() {
        let mut kit = KeyIndexTable::new();
        let mut buf = Vec::new();
        encode_entry(
            &PathKey::name("description"),
            &WireValue::Inline {
                vtype: ValueType::String,
                bytes: b"truncation test".to_vec(),
            },
            &mut kit,
            &mut buf,
        )
        .unwrap();
        let mut decoder = EntryDecoder::new(ValueType::Object);
        for cut in 0..buf.len() {
            assert_eq!(
                decoder.decode_next(&buf[..cut], &kit).unwrap(),
                DecodedEntry::NeedMore,
                "cut at {}",
                cut
            );
        }
        assert!(matches!(
            decoder.decode_next(&buf, &kit).unwrap(),
            DecodedEntry::Entry { .. }
        ));
    }

    #[test]
    fn array_entries_count_their_index() {
        let mut kit = KeyIndexTable::new();
        let mut buf = Vec::new();
        for n in [3.0, 200.5] {
            let wire = WireValue::from_inline_value(&NodeValue::Number(n), 50)
                .unwrap()
                .unwrap();
            encode_entry(&PathKey::Index(0), &wire, &mut kit, &mut buf).unwrap();
        }
        let mut decoder = EntryDecoder::new(ValueType::Array);
        let DecodedEntry::Entry { key, consumed, .. } = decoder.decode_next(&buf, &kit).unwrap()
        else {
            panic!()
        };
        assert_eq!(key, PathKey::Index(0));
        let DecodedEntry::Entry { key, value, .. } =
            decoder.decode_next(&buf[consumed..], &kit).unwrap()
        else {
            panic!()
        };
        assert_eq!(key, PathKey::Index(1));
        assert_eq!(value.to_node_value().unwrap(), NodeValue::Number(200.5));
    }

    #[test]
    fn deleted_location_is_rejected() {
        let buf = [(ValueType::String as u8) << 4, LOC_DELETED << 6 | 3, 0, 0, 0];
        assert!(WireValue::decode(&buf).is_err());
    }
}
