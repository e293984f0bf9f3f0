use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// The unit exchanged over the broadcast channel. Serialized as
/// pretty-printed JSON with a stable key order so peers on any
/// implementation, and humans reading the channel, see the same layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: BTreeSet<String>,
    pub action: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Payload,
}

/// Inline payload, typed per convention. Large data travels as an attached
/// file instead, with `data` naming the attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Map(serde_json::Map<String, serde_json::Value>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Null
    }
}

impl Payload {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            Payload::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn map_i64(&self, key: &str) -> Option<i64> {
        self.as_map()?.get(key)?.as_i64()
    }

    pub fn map_f64(&self, key: &str) -> Option<f64> {
        self.as_map()?.get(key)?.as_f64()
    }

    pub fn map_str(&self, key: &str) -> Option<&str> {
        self.as_map()?.get(key)?.as_str()
    }
}

impl Envelope {
    pub fn new(
        from: impl Into<String>,
        to: &[&str],
        action: impl Into<String>,
        kind: impl Into<String>,
        data: Payload,
    ) -> Self {
        Envelope {
            from: from.into(),
            to: to.iter().map(|s| s.to_string()).collect(),
            action: action.into(),
            kind: kind.into(),
            data,
        }
    }

    pub fn addressed_to(&self, identity: &str) -> bool {
        self.to.contains(identity)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("envelope is not valid JSON: {0}")]
    Syntax(serde_json::Error),
    #[error("envelope structure invalid or missing required field: {0}")]
    Structure(serde_json::Error),
}

/// Canonical serialization. Struct field order plus ordered sets/maps make
/// the output deterministic for a given envelope.
pub fn encode(envelope: &Envelope) -> String {
    match serde_json::to_string_pretty(envelope) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Encode envelope error: {e}");
            String::new()
        }
    }
}

pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    serde_json::from_str(text).map_err(|e| {
        if e.is_syntax() || e.is_eof() {
            DecodeError::Syntax(e)
        } else {
            DecodeError::Structure(e)
        }
    })
}
