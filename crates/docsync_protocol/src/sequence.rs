//! Opaque change-feed sequence values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a change feed.
///
/// Servers emit either integers or opaque strings (`"1234:56"`, or the long
/// tokens of clustered servers). The replicator never interprets them beyond
/// equality; it echoes them back in `since` and stores them in checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sequence {
    /// Numeric sequence.
    Integer(u64),
    /// Opaque string sequence.
    Text(String),
}

impl Sequence {
    /// The sequence before any change.
    pub fn zero() -> Self {
        Sequence::Integer(0)
    }

    /// Returns true for integer zero or an empty string.
    pub fn is_zero(&self) -> bool {
        match self {
            Sequence::Integer(n) => *n == 0,
            Sequence::Text(s) => s.is_empty() || s == "0",
        }
    }

    /// Converts a JSON value into a sequence, if it is a number or string.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(Sequence::Integer),
            serde_json::Value::String(s) => Some(Sequence::Text(s.clone())),
            _ => None,
        }
    }

    /// Returns the sequence as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Sequence::Integer(n) => serde_json::Value::from(*n),
            Sequence::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sequence::Integer(n) => write!(f, "{n}"),
            Sequence::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Sequence::Integer(value)
    }
}

impl From<&str> for Sequence {
    fn from(value: &str) -> Self {
        Sequence::Text(value.to_string())
    }
}

impl From<String> for Sequence {
    fn from(value: String) -> Self {
        Sequence::Text(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_numbers_and_strings() {
        let n: Sequence = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(n, Sequence::Integer(42));
        let s: Sequence = serde_json::from_value(json!("1234:56")).unwrap();
        assert_eq!(s, Sequence::Text("1234:56".into()));
    }

    #[test]
    fn display_is_raw() {
        assert_eq!(Sequence::from(7).to_string(), "7");
        assert_eq!(Sequence::from("1234:56").to_string(), "1234:56");
    }

    #[test]
    fn zero_detection() {
        assert!(Sequence::default().is_zero());
        assert!(Sequence::from("").is_zero());
        assert!(!Sequence::from(1).is_zero());
    }

    #[test]
    fn json_conversion() {
        assert_eq!(Sequence::from_json(&json!(3)), Some(Sequence::Integer(3)));
        assert_eq!(Sequence::from_json(&json!(null)), None);
        assert_eq!(Sequence::from("a").to_json(), json!("a"));
    }
}
