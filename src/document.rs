//! Logical documents and the records inside them.
//!
//! A document is a whole JSON value addressed by a `DocKey`. Reconciliation
//! needs to see it as a set of records keyed by id:
//!
//! ```text
//! [ {"id": "t1", ...}, {"id": 2, ...} ]   -> Array shape, keyed by "id"
//! { "tok-a": {...}, "tok-b": {...} }      -> Object shape, keyed by member name
//! anything else                           -> Opaque, merged as a whole
//! ```
//!
//! Integer and string ids with the same text (`1` and `"1"`) are the same
//! record: a tier that stores rows as text must not fork a record in two.

use crate::error::ValidationError;
use crate::storage::ChecksumCodec;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

const MAX_DOC_KEY_LEN: usize = 200;

/// Validated name of a logical document, e.g. `templates` or `reports/17`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocKey(String);

impl DocKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        let reject = |reason: &'static str| ValidationError::InvalidDocKey {
            key: key.clone(),
            reason,
        };
        if key.is_empty() {
            return Err(reject("empty"));
        }
        if key.len() > MAX_DOC_KEY_LEN {
            return Err(reject("longer than 200 bytes"));
        }
        for segment in key.split('/') {
            if segment.is_empty() {
                return Err(reject("empty path segment"));
            }
            if segment == "." || segment == ".." {
                return Err(reject("relative path segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(reject("only ASCII letters, digits, '-', '_', '.' and '/' allowed"));
            }
        }
        Ok(DocKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the object holding this document in a tier
    pub fn object_key(&self) -> String {
        format!("{}.json", self.0)
    }

    /// Inverse of `object_key`; `None` for objects that are not documents
    pub fn from_object_key(object_key: &str) -> Option<Self> {
        let stem = object_key.strip_suffix(".json")?;
        DocKey::new(stem).ok()
    }

    /// Document nested under this one, e.g. `reports` + `17` = `reports/17`
    pub fn child(&self, name: &str) -> Result<Self, ValidationError> {
        DocKey::new(format!("{}/{}", self.0, name))
    }

    /// Object-key prefix of documents nested under this key
    pub fn directory_prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DocKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocKey::new(s)
    }
}

impl TryFrom<String> for DocKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DocKey::new(value)
    }
}

impl From<DocKey> for String {
    fn from(key: DocKey) -> Self {
        key.0
    }
}

/// Identity of a record within a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    /// Explicit id (canonical text of a string or integer id, or member name)
    Id(String),
    /// Array element without a usable id, identified by its content hash
    Anonymous(String),
}

impl RecordKey {
    /// Canonical key for an `id` value: non-empty string or integer
    pub fn from_id(id: &Value) -> Option<Self> {
        match id {
            Value::String(s) if !s.is_empty() => Some(RecordKey::Id(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(RecordKey::Id(n.to_string())),
            _ => None,
        }
    }

    pub fn id(id: impl Into<String>) -> Self {
        RecordKey::Id(id.into())
    }

    fn anonymous(record: &Value) -> Self {
        let bytes = serde_json::to_vec(record).unwrap_or_default();
        RecordKey::Anonymous(ChecksumCodec::hash(&bytes))
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKey::Id(id) => f.write_str(id),
            RecordKey::Anonymous(hash) => write!(f, "~{}", &hash[..hash.len().min(12)]),
        }
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Parse a record timestamp: RFC 3339, naive date-time (UTC), date, or epoch ms
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Recency of a record: `updatedAt`, falling back to `createdAt`
pub fn record_timestamp(record: &Value) -> Option<DateTime<Utc>> {
    let obj = record.as_object()?;
    obj.get("updatedAt")
        .and_then(parse_timestamp)
        .or_else(|| obj.get("createdAt").and_then(parse_timestamp))
}

/// Whether a candidate with timestamp `candidate` replaces an incumbent.
///
/// Only a strictly later timestamp wins; a missing timestamp is older than
/// any present one. Equal timestamps keep the incumbent, so visiting
/// candidates in precedence order makes precedence the tie-break.
pub(crate) fn supersedes(candidate: Option<DateTime<Utc>>, incumbent: Option<DateTime<Utc>>) -> bool {
    match (candidate, incumbent) {
        (Some(c), Some(i)) => c > i,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

// ============================================================================
// Record view of a document
// ============================================================================

/// How a document's records are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Array,
    Object,
    Opaque,
}

/// A document split into keyed records, in stored order
#[derive(Debug, Clone)]
pub(crate) struct RecordSet {
    pub shape: Shape,
    pub records: Vec<(RecordKey, Value)>,
    /// The whole value, for opaque documents
    pub opaque: Option<Value>,
}

impl RecordSet {
    /// Split `value` into records. Duplicate ids within one document keep
    /// the most recent copy at the position of the first occurrence.
    pub fn decompose(value: Value) -> Self {
        match value {
            Value::Array(items) => {
                let mut records: Vec<(RecordKey, Value)> = Vec::with_capacity(items.len());
                let mut positions: HashMap<RecordKey, usize> = HashMap::new();
                for item in items {
                    let key = item
                        .get("id")
                        .and_then(RecordKey::from_id)
                        .unwrap_or_else(|| RecordKey::anonymous(&item));
                    match positions.get(&key) {
                        Some(&pos) => {
                            if supersedes(record_timestamp(&item), record_timestamp(&records[pos].1)) {
                                records[pos].1 = item;
                            }
                        }
                        None => {
                            positions.insert(key.clone(), records.len());
                            records.push((key, item));
                        }
                    }
                }
                RecordSet {
                    shape: Shape::Array,
                    records,
                    opaque: None,
                }
            }
            Value::Object(map) => RecordSet {
                shape: Shape::Object,
                records: map
                    .into_iter()
                    .map(|(k, v)| (RecordKey::Id(k), v))
                    .collect(),
                opaque: None,
            },
            other => RecordSet {
                shape: Shape::Opaque,
                records: Vec::new(),
                opaque: Some(other),
            },
        }
    }

    /// Reassemble a document of `shape` from ordered records
    pub fn compose(shape: Shape, records: Vec<(RecordKey, Value)>) -> Value {
        match shape {
            Shape::Array => Value::Array(records.into_iter().map(|(_, v)| v).collect()),
            Shape::Object | Shape::Opaque => {
                let mut map = Map::new();
                for (key, value) in records {
                    map.insert(key.to_string(), value);
                }
                Value::Object(map)
            }
        }
    }

    /// Records keyed for order-insensitive comparison
    pub fn keyed(&self) -> HashMap<&RecordKey, &Value> {
        self.records.iter().map(|(k, v)| (k, v)).collect()
    }
}

/// Number of records in a document (array length, member count, or 1)
pub fn record_count(value: &Value) -> u64 {
    match value {
        Value::Array(items) => items.len() as u64,
        Value::Object(map) => map.len() as u64,
        Value::Null => 0,
        _ => 1,
    }
}

/// Check a payload before it is written to any tier.
///
/// Arrays must hold objects with a string or integer `id`, unique under the
/// string/integer equivalence. Objects are keyed maps and always accepted.
pub fn validate_payload(doc_key: &DocKey, payload: &Value) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidDocument {
        doc_key: doc_key.to_string(),
        reason,
    };
    match payload {
        Value::Array(items) => {
            let mut seen = HashSet::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let obj = item
                    .as_object()
                    .ok_or_else(|| invalid(format!("element {} is not an object", index)))?;
                let id = obj
                    .get("id")
                    .ok_or_else(|| invalid(format!("element {} has no id", index)))?;
                let key = RecordKey::from_id(id).ok_or_else(|| {
                    invalid(format!(
                        "element {} has an id that is neither a non-empty string nor an integer",
                        index
                    ))
                })?;
                if !seen.insert(key) {
                    return Err(invalid(format!("duplicate id {}", id)));
                }
            }
            Ok(())
        }
        Value::Object(_) => Ok(()),
        _ => Err(invalid("top-level value must be an array or an object".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_doc_key_grammar() {
        assert!(DocKey::new("templates").is_ok());
        assert!(DocKey::new("reports/17").is_ok());
        assert!(DocKey::new("analysis_cache/run-2024.01").is_ok());

        for bad in ["", "/templates", "reports/", "a//b", "../etc", "reports/..", "sp ace"] {
            assert!(DocKey::new(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_doc_key_object_key_roundtrip() {
        let key = DocKey::new("reports/17").unwrap();
        assert_eq!(key.object_key(), "reports/17.json");
        assert_eq!(DocKey::from_object_key("reports/17.json"), Some(key));
        assert_eq!(DocKey::from_object_key("reports/17.json.tmp"), None);
    }

    #[test]
    fn test_integer_and_string_ids_are_same_record() {
        assert_eq!(RecordKey::from_id(&json!(1)), RecordKey::from_id(&json!("1")));
        assert_eq!(RecordKey::from_id(&json!("")), None);
        assert_eq!(RecordKey::from_id(&json!(1.5)), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let date = parse_timestamp(&json!("2024-02-01")).unwrap();
        let rfc = parse_timestamp(&json!("2024-02-01T00:00:00Z")).unwrap();
        let naive = parse_timestamp(&json!("2024-02-01T00:00:00.000")).unwrap();
        let millis = parse_timestamp(&json!(1_706_745_600_000i64)).unwrap();
        assert_eq!(date, rfc);
        assert_eq!(naive, rfc);
        assert_eq!(millis, rfc);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }

    #[test]
    fn test_record_timestamp_falls_back_to_created_at() {
        let updated = json!({"id": 1, "createdAt": "2024-01-01", "updatedAt": "2024-03-01"});
        let created = json!({"id": 1, "createdAt": "2024-01-01"});
        let garbage = json!({"id": 1, "updatedAt": "n/a", "createdAt": "2024-01-05"});
        assert_eq!(record_timestamp(&updated), parse_timestamp(&json!("2024-03-01")));
        assert_eq!(record_timestamp(&created), parse_timestamp(&json!("2024-01-01")));
        assert_eq!(record_timestamp(&garbage), parse_timestamp(&json!("2024-01-05")));
        assert_eq!(record_timestamp(&json!({"id": 1})), None);
    }

    #[test]
    fn test_supersedes_rules() {
        let early = parse_timestamp(&json!("2024-01-01"));
        let late = parse_timestamp(&json!("2024-02-01"));
        assert!(supersedes(late, early));
        assert!(!supersedes(early, late));
        assert!(!supersedes(early, early));
        assert!(supersedes(early, None));
        assert!(!supersedes(None, early));
        assert!(!supersedes(None, None));
    }

    #[test]
    fn test_decompose_dedups_within_document() {
        let set = RecordSet::decompose(json!([
            {"id": 1, "v": "old", "updatedAt": "2024-01-01"},
            {"id": 2, "v": "x"},
            {"id": "1", "v": "new", "updatedAt": "2024-05-01"}
        ]));
        assert_eq!(set.shape, Shape::Array);
        assert_eq!(set.records.len(), 2);
        assert_eq!(set.records[0].0, RecordKey::id("1"));
        assert_eq!(set.records[0].1["v"], "new");
    }

    #[test]
    fn test_object_and_opaque_shapes() {
        let obj = RecordSet::decompose(json!({"s1": {"user": "a"}, "s2": {"user": "b"}}));
        assert_eq!(obj.shape, Shape::Object);
        assert_eq!(obj.records.len(), 2);

        let opaque = RecordSet::decompose(json!(42));
        assert_eq!(opaque.shape, Shape::Opaque);
        assert_eq!(opaque.opaque, Some(json!(42)));
    }

    #[test]
    fn test_validate_payload() {
        let key = DocKey::new("templates").unwrap();
        assert!(validate_payload(&key, &json!([{"id": "t1"}, {"id": 2}])).is_ok());
        assert!(validate_payload(&key, &json!({"k": 1})).is_ok());
        assert!(validate_payload(&key, &json!([])).is_ok());

        assert!(validate_payload(&key, &json!([{"id": 1}, {"id": "1"}])).is_err());
        assert!(validate_payload(&key, &json!([{"name": "no id"}])).is_err());
        assert!(validate_payload(&key, &json!([1, 2])).is_err());
        assert!(validate_payload(&key, &json!("text")).is_err());
    }

    #[test]
    fn test_record_count() {
        assert_eq!(record_count(&json!([1, 2, 3])), 3);
        assert_eq!(record_count(&json!({"a": 1})), 1);
        assert_eq!(record_count(&json!(null)), 0);
    }
}
