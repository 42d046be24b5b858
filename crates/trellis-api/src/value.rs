//! Dynamically typed column values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single column value as stored in a record.
///
/// Serialized untagged so that records round-trip through plain JSON
/// (`{"title": "Home", "sorting": 128, "published": true}`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for values an editor would show as "nothing entered".
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Checkbox-style truthiness: blank, `false`, `0` and `"0"` are all off.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Integer(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty() && s != "0",
            other => !other.is_blank(),
        }
    }

    /// Render the value the way it appears in palette names and subpalette keys.
    pub fn to_key_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(true) => "1".to_string(),
            Value::Boolean(false) => String::new(),
            Value::Integer(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_follows_checkbox_semantics() {
        assert!(Value::from(true).is_truthy());
        assert!(Value::from("1").is_truthy());
        assert!(Value::from(3).is_truthy());
        assert!(!Value::from("0").is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::Null.is_truthy());
    }

    #[test]
    fn blank_is_weaker_than_falsy() {
        assert!(Value::Null.is_blank());
        assert!(Value::from("").is_blank());
        assert!(!Value::from(0).is_blank());
        assert!(!Value::from(false).is_blank());
    }

    #[test]
    fn untagged_json_round_trip() {
        let json = r#"{"a":1,"b":"x","c":true,"d":null,"e":[1.5]}"#;
        let parsed: BTreeMap<String, Value> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed["a"], Value::Integer(1));
        assert_eq!(parsed["b"], Value::from("x"));
        assert_eq!(parsed["c"], Value::Boolean(true));
        assert_eq!(parsed["d"], Value::Null);
        assert_eq!(parsed["e"], Value::Array(vec![Value::Float(1.5)]));
    }

    #[test]
    fn key_strings() {
        assert_eq!(Value::from(true).to_key_string(), "1");
        assert_eq!(Value::from(42).to_key_string(), "42");
        assert_eq!(Value::from("news").to_key_string(), "news");
        assert_eq!(Value::Null.to_key_string(), "");
    }
}
