//! Typed view over untrusted spec fragments

use serde_json::Value;

/// Classified object key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// `$`-prefixed operator or stage name
    Operator(String),
    /// The identity field `_id`
    Identity,
    /// Anything else; a field name in filter context
    Name(String),
}

impl Key {
    pub fn classify(key: &str) -> Self {
        if key.starts_with('$') {
            Key::Operator(key.to_string())
        } else if key == "_id" {
            Key::Identity
        } else {
            Key::Name(key.to_string())
        }
    }
}

/// A spec fragment, classified once so recursive walks are exhaustive
#[derive(Debug, Clone, PartialEq)]
pub enum SpecNode {
    Scalar(Value),
    /// `"$path"` with the sigil removed
    FieldRef(String),
    /// `"$$ROOT"`, `"$$NOW"`, ...
    SystemVar(String),
    Object(Vec<(Key, SpecNode)>),
    Array(Vec<SpecNode>),
}

impl SpecNode {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => {
                let s = s.trim();
                if s.starts_with("$$") {
                    SpecNode::SystemVar(s.to_string())
                } else if s.len() > 1 && s.starts_with('$') {
                    SpecNode::FieldRef(s[1..].to_string())
                } else {
                    SpecNode::Scalar(value.clone())
                }
            }
            Value::Object(map) => SpecNode::Object(
                map.iter()
                    .map(|(k, v)| (Key::classify(k), SpecNode::from_value(v)))
                    .collect(),
            ),
            Value::Array(items) => SpecNode::Array(items.iter().map(SpecNode::from_value).collect()),
            other => SpecNode::Scalar(other.clone()),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, SpecNode::Scalar(_))
    }
}
