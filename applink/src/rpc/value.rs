//! Tagged variant tree for RPC payloads.
//!
//! RPC parameters are dynamic string-keyed trees. They convert to and
//! from JSON at the wire edge; inside the core they stay typed so the
//! schema visitor can tell an integer from a double.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

/// One node of an RPC parameter tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RpcValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<RpcValue>),
    Map(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    /// Empty map, the usual shape of an RPC parameter set.
    #[must_use]
    pub fn object() -> Self {
        Self::Map(BTreeMap::new())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[RpcValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Member lookup on a map node.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Inserts a member, turning a non-map node into a map first.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<RpcValue>) {
        if !matches!(self, Self::Map(_)) {
            *self = Self::object();
        }
        if let Self::Map(map) = self {
            map.insert(key.into(), value.into());
        }
    }

    /// Parses a JSON document into a tree.
    pub fn from_json_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice::<JsonValue>(data).map(Self::from)
    }

    /// Serializes the tree as a JSON document.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&JsonValue::from(self.clone()))
    }
}

impl From<bool> for RpcValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for RpcValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for RpcValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for RpcValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for RpcValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for RpcValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for RpcValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<JsonValue> for RpcValue {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Double(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Self::String(s),
            JsonValue::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            JsonValue::Object(members) => Self::Map(
                members
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<RpcValue> for JsonValue {
    fn from(v: RpcValue) -> Self {
        match v {
            RpcValue::Null => Self::Null,
            RpcValue::Bool(b) => Self::Bool(b),
            RpcValue::Int(i) => Self::from(i),
            // Non-finite doubles have no JSON form.
            RpcValue::Double(d) => serde_json::Number::from_f64(d).map_or(Self::Null, Self::Number),
            RpcValue::String(s) => Self::String(s),
            RpcValue::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            RpcValue::Map(members) => Self::Object(
                members
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}
