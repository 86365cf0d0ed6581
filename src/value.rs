//! The value model stored at nodes.

use std::collections::BTreeMap;

/// Wire-stable 4-bit value type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Object = 1,
    Array = 2,
    Number = 3,
    Boolean = 4,
    String = 5,
    DateTime = 6,
    Binary = 8,
    Reference = 9,
}

impl ValueType {
    /// Decode a type nibble. Zero is the tombstone placeholder and is not a
    /// live value type.
    pub fn from_nibble(nibble: u8) -> Option<ValueType> {
        match nibble {
            1 => Some(ValueType::Object),
            2 => Some(ValueType::Array),
            3 => Some(ValueType::Number),
            4 => Some(ValueType::Boolean),
            5 => Some(ValueType::String),
            6 => Some(ValueType::DateTime),
            8 => Some(ValueType::Binary),
            9 => Some(ValueType::Reference),
            _ => None,
        }
    }

    pub fn is_composite(self) -> bool {
        matches!(self, ValueType::Object | ValueType::Array)
    }
}

/// A value in the hierarchy.
///
/// `Null` only ever appears as a deletion marker inside update patches and
/// as the result of reading a nonexistent path; it is never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Null,
    Object(BTreeMap<String, NodeValue>),
    Array(Vec<NodeValue>),
    Number(f64),
    Boolean(bool),
    /// Millisecond epoch timestamp
    DateTime(i64),
    String(String),
    Binary(Vec<u8>),
    /// A path reference to elsewhere in the hierarchy
    Reference(String),
}

impl NodeValue {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            NodeValue::Null => None,
            NodeValue::Object(_) => Some(ValueType::Object),
            NodeValue::Array(_) => Some(ValueType::Array),
            NodeValue::Number(_) => Some(ValueType::Number),
            NodeValue::Boolean(_) => Some(ValueType::Boolean),
            NodeValue::DateTime(_) => Some(ValueType::DateTime),
            NodeValue::String(_) => Some(ValueType::String),
            NodeValue::Binary(_) => Some(ValueType::Binary),
            NodeValue::Reference(_) => Some(ValueType::Reference),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NodeValue::Null)
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, NodeValue::Object(_) | NodeValue::Array(_))
    }

    /// Whether this value can live inside its parent's record instead of
    /// getting a record of its own. Strings, references and binaries are
    /// bounded by `max_inline`; composites only qualify when empty.
    pub fn fits_inline(&self, max_inline: usize) -> bool {
        match self {
            NodeValue::Null => false,
            NodeValue::Number(_) | NodeValue::Boolean(_) | NodeValue::DateTime(_) => true,
            NodeValue::String(s) | NodeValue::Reference(s) => s.len() < max_inline,
            NodeValue::Binary(b) => b.len() < max_inline,
            NodeValue::Object(o) => o.is_empty(),
            NodeValue::Array(a) => a.is_empty(),
        }
    }

    pub fn object(entries: impl IntoIterator<Item = (&'static str, NodeValue)>) -> NodeValue {
        NodeValue::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn str(s: impl Into<String>) -> NodeValue {
        NodeValue::String(s.into())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            NodeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, NodeValue>> {
        match self {
            NodeValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[NodeValue]> {
        match self {
            NodeValue::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<f64> for NodeValue {
    fn from(v: f64) -> Self {
        NodeValue::Number(v)
    }
}

impl From<i64> for NodeValue {
    fn from(v: i64) -> Self {
        NodeValue::Number(v as f64)
    }
}

impl From<bool> for NodeValue {
    fn from(v: bool) -> Self {
        NodeValue::Boolean(v)
    }
}

impl From<&str> for NodeValue {
    fn from(v: &str) -> Self {
        NodeValue::String(v.to_string())
    }
}

impl From<String> for NodeValue {
    fn from(v: String) -> Self {
        NodeValue::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_fit_rules() {
        assert!(NodeValue::Number(12345.678).fits_inline(8));
        assert!(NodeValue::Boolean(true).fits_inline(1));
        assert!(NodeValue::str("short").fits_inline(6));
        assert!(!NodeValue::str("toolong").fits_inline(7));
        assert!(NodeValue::Object(BTreeMap::new()).fits_inline(1));
        assert!(!NodeValue::object([("a", NodeValue::Boolean(true))]).fits_inline(64));
        assert!(NodeValue::Array(vec![]).fits_inline(1));
        assert!(!NodeValue::Array(vec![NodeValue::Number(1.0)]).fits_inline(64));
    }

    #[test]
    fn type_nibbles_round_trip() {
        for t in [
            ValueType::Object,
            ValueType::Array,
            ValueType::Number,
            ValueType::Boolean,
            ValueType::String,
            ValueType::DateTime,
            ValueType::Binary,
            ValueType::Reference,
        ] {
            assert_eq!(ValueType::from_nibble(t as u8), Some(t));
        }
        assert_eq!(ValueType::from_nibble(0), None);
        assert_eq!(ValueType::from_nibble(7), None);
    }
}
