//! Event arguments: JSON plus raw binary leaves.
//!
//! On the wire a binary leaf becomes a `{"_placeholder":true,"num":i}` object
//! and its bytes travel as the i-th attachment frame after the packet.

use std::collections::BTreeMap;

use bytes::Bytes;
use enum_as_inner::EnumAsInner;
use serde_json::{json, Number};
use snafu::prelude::*;

use super::{error, ProtocolError};

/// One event argument
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Value {
    /// null
    Null,
    /// boolean
    Bool(bool),
    /// number
    Number(Number),
    /// string
    String(String),
    /// raw bytes, sent as an attachment
    Binary(Bytes),
    /// array
    Array(Vec<Value>),
    /// object
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// true if a binary leaf is anywhere inside
    pub fn has_binary(&self) -> bool {
        match self {
            Self::Binary(_) => true,
            Self::Array(items) => items.iter().any(Value::has_binary),
            Self::Object(map) => map.values().any(Value::has_binary),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

/// Replace binary leaves by placeholders, depth first, returning the JSON
/// tree and the attachments in placeholder order.
pub fn deconstruct(value: Value) -> (serde_json::Value, Vec<Bytes>) {
    let mut attachments = Vec::new();
    let json = strip(value, &mut attachments);
    (json, attachments)
}

fn strip(value: Value, attachments: &mut Vec<Bytes>) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => serde_json::Value::Number(n),
        Value::String(s) => serde_json::Value::String(s),
        Value::Binary(data) => {
            let num = attachments.len();
            attachments.push(data);
            json!({ "_placeholder": true, "num": num })
        }
        Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(|v| strip(v, attachments)).collect())
        }
        Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, strip(v, attachments)))
                .collect(),
        ),
    }
}

fn placeholder_num(map: &serde_json::Map<String, serde_json::Value>) -> Option<u64> {
    if map.len() == 2 && map.get("_placeholder") == Some(&serde_json::Value::Bool(true)) {
        map.get("num").and_then(serde_json::Value::as_u64)
    } else {
        None
    }
}

/// Put attachments back in place of their placeholders
pub fn reconstruct(json: serde_json::Value, attachments: &[Bytes]) -> Result<Value, ProtocolError> {
    let value = match json {
        serde_json::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| reconstruct(v, attachments))
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => match placeholder_num(&map) {
            Some(num) => {
                let data = usize::try_from(num)
                    .ok()
                    .and_then(|i| attachments.get(i))
                    .context(error::BadPlaceholder { num })?;
                Value::Binary(data.clone())
            }
            None => Value::Object(
                map.into_iter()
                    .map(|(k, v)| reconstruct(v, attachments).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
        },
        other => Value::from(other),
    };
    Ok(value)
}
