use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::writer::WriterId;
use madara_base::History;

/// File-type tag carried by a typed byte buffer (spec §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum FileType {
    Text,
    Xml,
    Jpeg,
    Unknown,
}

/// Wire-level type discriminant. Stable across versions; referenced by
/// `madara-net`'s record framing (`type:u32`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u32)]
pub enum RecordTypeTag {
    Integer = 1,
    Double = 2,
    String = 3,
    IntegerArray = 4,
    DoubleArray = 5,
    Blob = 6,
    FileText = 7,
    FileXml = 8,
    FileJpeg = 9,
    Any = 10,
}

impl RecordTypeTag {
    pub fn from_u32(v: u32) -> Option<Self> {
        use RecordTypeTag::*;
        Some(match v {
            1 => Integer,
            2 => Double,
            3 => String,
            4 => IntegerArray,
            5 => DoubleArray,
            6 => Blob,
            7 => FileText,
            8 => FileXml,
            9 => FileJpeg,
            10 => Any,
            _ => return None,
        })
    }
}

/// The tagged variant value carried by a Record, independent of its
/// replication metadata. Arrays, strings and blobs are reference-counted so
/// repeated reads never copy (spec §3); any mutating path must replace the
/// `Arc` rather than mutate through it (invariant I5).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RecordValue {
    Integer(i64),
    Double(OrderedFloat<f64>),
    Text(Arc<str>),
    IntegerArray(Arc<Vec<i64>>),
    DoubleArray(Arc<Vec<OrderedFloat<f64>>>),
    Blob(Arc<Vec<u8>>),
    File(FileType, Arc<Vec<u8>>),
    Any(Arc<str>, Arc<Vec<u8>>),
}

impl Eq for RecordValue {}

impl RecordValue {
    pub fn type_tag(&self) -> RecordTypeTag {
        match self {
            RecordValue::Integer(_) => RecordTypeTag::Integer,
            RecordValue::Double(_) => RecordTypeTag::Double,
            RecordValue::Text(_) => RecordTypeTag::String,
            RecordValue::IntegerArray(_) => RecordTypeTag::IntegerArray,
            RecordValue::DoubleArray(_) => RecordTypeTag::DoubleArray,
            RecordValue::Blob(_) => RecordTypeTag::Blob,
            RecordValue::File(FileType::Text, _) => RecordTypeTag::FileText,
            RecordValue::File(FileType::Xml, _) => RecordTypeTag::FileXml,
            RecordValue::File(FileType::Jpeg, _) => RecordTypeTag::FileJpeg,
            RecordValue::File(FileType::Unknown, _) => RecordTypeTag::Blob,
            RecordValue::Any(_, _) => RecordTypeTag::Any,
        }
    }

    pub fn zero_integer() -> Self {
        RecordValue::Integer(0)
    }

    pub fn as_integer(&self) -> i64 {
        match self {
            RecordValue::Integer(i) => *i,
            RecordValue::Double(d) => d.0 as i64,
            RecordValue::Text(s) => s.parse().unwrap_or(0),
            RecordValue::IntegerArray(a) => a.first().copied().unwrap_or(0),
            RecordValue::DoubleArray(a) => a.first().map(|d| d.0 as i64).unwrap_or(0),
            _ => 0,
        }
    }

    pub fn as_double(&self) -> f64 {
        match self {
            RecordValue::Integer(i) => *i as f64,
            RecordValue::Double(d) => d.0,
            RecordValue::Text(s) => s.parse().unwrap_or(0.0),
            RecordValue::IntegerArray(a) => a.first().map(|i| *i as f64).unwrap_or(0.0),
            RecordValue::DoubleArray(a) => a.first().map(|d| d.0).unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Array-element-count or byte-length, as used by the `value_size`
    /// wire field and the `#size` system call.
    pub fn size(&self) -> usize {
        match self {
            RecordValue::Integer(_) => 1,
            RecordValue::Double(_) => 1,
            RecordValue::Text(s) => s.len(),
            RecordValue::IntegerArray(a) => a.len(),
            RecordValue::DoubleArray(a) => a.len(),
            RecordValue::Blob(b) => b.len(),
            RecordValue::File(_, b) => b.len(),
            RecordValue::Any(_, b) => b.len(),
        }
    }

    pub fn is_double(&self) -> bool {
        matches!(self, RecordValue::Double(_) | RecordValue::DoubleArray(_))
    }

    pub fn is_numeric_array(&self) -> bool {
        matches!(
            self,
            RecordValue::IntegerArray(_) | RecordValue::DoubleArray(_)
        )
    }

    pub fn to_display_string(&self, delim: &str) -> String {
        match self {
            RecordValue::Integer(i) => i.to_string(),
            RecordValue::Double(d) => d.0.to_string(),
            RecordValue::Text(s) => s.to_string(),
            RecordValue::IntegerArray(a) => a
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(delim),
            RecordValue::DoubleArray(a) => a
                .iter()
                .map(|d| d.0.to_string())
                .collect::<Vec<_>>()
                .join(delim),
            RecordValue::Blob(b) => format!("<{} bytes>", b.len()),
            RecordValue::File(t, b) => format!("<{t:?} {} bytes>", b.len()),
            RecordValue::Any(tag, b) => format!("<any:{tag} {} bytes>", b.len()),
        }
    }

    /// Truthiness per spec §4.2. Resolves Open Question Q1 in favour of
    /// plain non-emptiness (see DESIGN.md): a string is truthy iff it is
    /// non-empty, not the legacy "size > 1" (NUL-inclusive) check.
    pub fn is_truthy(&self) -> bool {
        match self {
            RecordValue::Integer(i) => *i != 0,
            RecordValue::Double(d) => d.0 != 0.0,
            RecordValue::Text(s) => !s.is_empty(),
            RecordValue::IntegerArray(a) => !a.is_empty(),
            RecordValue::DoubleArray(a) => !a.is_empty(),
            RecordValue::Blob(b) => !b.is_empty(),
            RecordValue::File(_, b) => !b.is_empty(),
            RecordValue::Any(_, b) => !b.is_empty(),
        }
    }
}

impl From<i64> for RecordValue {
    fn from(v: i64) -> Self {
        RecordValue::Integer(v)
    }
}

impl From<f64> for RecordValue {
    fn from(v: f64) -> Self {
        RecordValue::Double(OrderedFloat(v))
    }
}

impl From<String> for RecordValue {
    fn from(v: String) -> Self {
        RecordValue::Text(Arc::from(v.as_str()))
    }
}

impl From<&str> for RecordValue {
    fn from(v: &str) -> Self {
        RecordValue::Text(Arc::from(v))
    }
}

impl From<Vec<i64>> for RecordValue {
    fn from(v: Vec<i64>) -> Self {
        RecordValue::IntegerArray(Arc::new(v))
    }
}

impl From<Vec<f64>> for RecordValue {
    fn from(v: Vec<f64>) -> Self {
        RecordValue::DoubleArray(Arc::new(v.into_iter().map(OrderedFloat).collect()))
    }
}

/// Visibility/change-tracking status for a map entry (spec I3/I4).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Uncreated,
    Modified,
}

/// A Record: a value plus the replication metadata the Context attaches to
/// every keyed entry (spec §3). Literal/ephemeral records built outside a
/// Context (e.g. ExprTree constants) carry zeroed metadata and `history =
/// None`; they are never inserted into a map directly.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub value: RecordValue,
    pub clock: u64,
    pub toi: u64,
    pub quality: u32,
    pub write_quality: u32,
    pub writer: WriterId,
    pub status: Status,
    pub history: Option<History<RecordValue>>,
}

impl Record {
    pub fn new(value: RecordValue) -> Self {
        Record {
            value,
            clock: 0,
            toi: 0,
            quality: 0,
            write_quality: 0,
            writer: WriterId::default(),
            status: Status::Uncreated,
            history: None,
        }
    }

    pub fn zero() -> Self {
        Record::new(RecordValue::zero_integer())
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history = Some(History::new(capacity));
        self
    }

    pub fn exists(&self) -> bool {
        self.status != Status::Uncreated
    }

    pub fn is_truthy(&self) -> bool {
        self.value.is_truthy()
    }

    pub fn push_history(&mut self) {
        if let Some(h) = &mut self.history {
            h.push(self.value.clone(), self.toi);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_record_is_uncreated_integer() {
        let r = Record::zero();
        assert_eq!(r.value, RecordValue::Integer(0));
        assert!(!r.exists());
    }

    #[test]
    fn truthiness_empty_string_is_false_nonempty_is_true() {
        assert!(!RecordValue::from("").is_truthy());
        assert!(RecordValue::from("x").is_truthy());
        assert!(!RecordValue::Integer(0).is_truthy());
        assert!(RecordValue::Integer(-1).is_truthy());
    }

    #[test]
    fn arrays_truthy_iff_nonempty() {
        assert!(!RecordValue::from(Vec::<i64>::new()).is_truthy());
        assert!(RecordValue::from(vec![0i64]).is_truthy());
    }
}
