//! Query keys and their canonical serialized form
//!
//! A [`QueryKey`] is either a single string or an ordered sequence of
//! JSON segments. The registry stores entries under the key's
//! [`SerializedKey`], a canonical JSON rendering in which object segments
//! always list their fields in sorted order, so two semantically equal keys
//! always land in the same cache slot.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier for one cacheable unit of data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryKey {
    /// Plain string key, e.g. `"current-user"`
    Single(String),

    /// Structured key, e.g. `["todos", {"page": 1}]`
    Segments(Vec<Value>),
}

/// Build a sequence [`QueryKey`] from JSON-like segments
///
/// ```
/// use ouroboros_query::query_key;
///
/// let key = query_key!["todos", {"page": 1}];
/// assert_eq!(key.serialize().as_str(), r#"["todos",{"page":1}]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:tt),* $(,)?) => {
        $crate::QueryKey::Segments(vec![$($crate::__private::json!($segment)),*])
    };
}

impl QueryKey {
    /// Create a sequence key from any iterator of segments
    pub fn segments<I, V>(segments: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        QueryKey::Segments(segments.into_iter().map(Into::into).collect())
    }

    /// Canonical serialization used as the registry map key
    pub fn serialize(&self) -> SerializedKey {
        let mut out = String::new();
        match self {
            QueryKey::Single(s) => write_canonical(&Value::String(s.clone()), &mut out),
            QueryKey::Segments(segments) => {
                out.push('[');
                for (i, segment) in segments.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_canonical(segment, &mut out);
                }
                out.push(']');
            }
        }
        SerializedKey(out)
    }

    /// Parse a serialized key back into its structured form
    pub fn parse(serialized: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(serialized) {
            Ok(Value::String(s)) => Ok(QueryKey::Single(s)),
            Ok(Value::Array(segments)) => Ok(QueryKey::Segments(segments)),
            Ok(other) => Err(QueryError::InvalidKey(format!(
                "expected string or array, found {}",
                other
            ))),
            Err(e) => Err(QueryError::InvalidKey(e.to_string())),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(s: &str) -> Self {
        QueryKey::Single(s.to_string())
    }
}

impl From<String> for QueryKey {
    fn from(s: String) -> Self {
        QueryKey::Single(s)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        QueryKey::Segments(segments)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

/// Canonical string form of a [`QueryKey`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SerializedKey(String);

impl SerializedKey {
    /// Borrow the canonical string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already serialized key without validating it
    pub fn from_raw(raw: impl Into<String>) -> Self {
        SerializedKey(raw.into())
    }

    /// Recover the structured key
    pub fn to_key(&self) -> Result<QueryKey> {
        QueryKey::parse(&self.0)
    }
}

impl fmt::Display for SerializedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&QueryKey> for SerializedKey {
    fn from(key: &QueryKey) -> Self {
        key.serialize()
    }
}

/// Check whether a stored key falls under `partial`
///
/// String partials require exact equality. Sequence partials match when
/// they are a structural prefix of the stored sequence under deep
/// equality. A stored key that fails to parse never matches.
pub fn match_key(serialized: &SerializedKey, partial: &QueryKey) -> bool {
    match partial {
        QueryKey::Single(_) => *serialized == partial.serialize(),
        QueryKey::Segments(prefix) => match serde_json::from_str::<Value>(serialized.as_str()) {
            Ok(Value::Array(stored)) => {
                prefix.len() <= stored.len()
                    && prefix.iter().zip(stored.iter()).all(|(p, s)| p == s)
            }
            _ => false,
        },
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_key_serialization() {
        let key = QueryKey::from("current-user");
        assert_eq!(key.serialize().as_str(), "\"current-user\"");
    }

    #[test]
    fn test_object_segments_are_sorted() {
        let a = QueryKey::Segments(vec![json!("todos"), json!({"page": 1, "filter": "done"})]);
        let b = query_key!["todos", {"filter": "done", "page": 1}];

        assert_eq!(a.serialize(), b.serialize());
        assert_eq!(
            a.serialize().as_str(),
            r#"["todos",{"filter":"done","page":1}]"#
        );
    }

    #[test]
    fn test_nested_objects_are_sorted() {
        let key = query_key!["search", {"z": {"b": 2, "a": [3, {"y": 1, "x": 0}]}}];
        assert_eq!(
            key.serialize().as_str(),
            r#"["search",{"z":{"a":[3,{"x":0,"y":1}],"b":2}}]"#
        );
    }

    #[test]
    fn test_string_and_sequence_keys_differ() {
        let single = QueryKey::from("todos");
        let sequence = query_key!["todos"];
        assert_ne!(single.serialize(), sequence.serialize());
    }

    #[test]
    fn test_parse_round_trip() {
        let key = query_key!["todos", {"page": 1}];
        let parsed = key.serialize().to_key().unwrap();
        assert_eq!(parsed, key);

        assert!(QueryKey::parse("42").is_err());
        assert!(QueryKey::parse("[unterminated").is_err());
    }

    #[test]
    fn test_prefix_matching() {
        let stored = query_key!["todos", {"page": 1}].serialize();

        assert!(match_key(&stored, &query_key!["todos"]));
        assert!(match_key(&stored, &query_key!["todos", {"page": 1}]));
        assert!(!match_key(&stored, &query_key!["todos", {"page": 2}]));
        assert!(!match_key(&stored, &query_key!["posts"]));
        assert!(!match_key(&stored, &query_key!["todos", {"page": 1}, "extra"]));
    }

    #[test]
    fn test_object_segment_deep_equality() {
        let stored = query_key!["todos", {"page": 1, "tags": ["a", "b"]}].serialize();

        assert!(match_key(&stored, &query_key!["todos", {"tags": ["a", "b"], "page": 1}]));
        assert!(!match_key(&stored, &query_key!["todos", {"tags": ["b", "a"], "page": 1}]));
        assert!(!match_key(&stored, &query_key!["todos", {"page": 1}]));
    }

    #[test]
    fn test_empty_prefix_matches_all_sequences() {
        let stored = query_key!["anything", 1].serialize();
        assert!(match_key(&stored, &QueryKey::Segments(Vec::new())));
    }

    #[test]
    fn test_string_partial_requires_exact_match() {
        let stored = QueryKey::from("todos").serialize();
        assert!(match_key(&stored, &QueryKey::from("todos")));
        assert!(!match_key(&stored, &QueryKey::from("todo")));

        let sequence = query_key!["todos"].serialize();
        assert!(!match_key(&sequence, &QueryKey::from("todos")));
    }

    #[test]
    fn test_malformed_key_never_matches() {
        let malformed = SerializedKey::from_raw("[\"todos\",");
        assert!(!match_key(&malformed, &query_key!["todos"]));

        let not_a_sequence = SerializedKey::from_raw("{\"todos\":1}");
        assert!(!match_key(&not_a_sequence, &query_key!["todos"]));
    }
}
