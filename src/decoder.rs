//! Entry decoding.
//!
//! Two steps turn a store reply into handler input:
//!
//! 1. [`parse_read_reply`] walks the nested `XREADGROUP` reply and yields
//!    [`RawEntry`] values (ID plus field/value bytes).
//! 2. A [`Decoder`] resolves each entry's payload into a [`DecodedValue`]
//!    according to the [`TargetShape`] chosen once for the stream.
//!
//! ```text
//! [[stream, [[id, [field, value, ...]], [id, nil], ...]]]
//!            │
//!            ▼ parse_read_reply
//! RawEntry { id, fields }
//!            │
//!            ▼ Decoder::decode_batch (shape = record | string | uint64 | int64)
//! DecodedEntry { id, value: Ok(DecodedValue) | Err(DecodeError) }
//! ```

use deadpool_redis::redis::Value;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::entry::{DecodedEntry, DecodedValue, Fields, RawEntry, StreamId};
use crate::error::DecodeError;

/// The declared type of every payload in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum TargetShape {
    /// A JSON object
    #[default]
    Record,
    String,
    Unsigned,
    Signed,
}

impl TargetShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetShape::Record => "record",
            TargetShape::String => "string",
            TargetShape::Unsigned => "uint64",
            TargetShape::Signed => "int64",
        }
    }
}

impl fmt::Display for TargetShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetShape {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "record" | "struct" | "json" => Ok(TargetShape::Record),
            "string" | "str" => Ok(TargetShape::String),
            "uint64" | "u64" | "unsigned" => Ok(TargetShape::Unsigned),
            "int64" | "i64" | "signed" => Ok(TargetShape::Signed),
            _ => Err(DecodeError::UnsupportedShape(s.to_string())),
        }
    }
}

impl TryFrom<String> for TargetShape {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Decodes raw entries into typed values for one stream.
#[derive(Debug, Clone)]
pub struct Decoder {
    shape: TargetShape,
    payload_field: Option<String>,
}

impl Decoder {
    pub fn new(shape: TargetShape) -> Self {
        Self {
            shape,
            payload_field: None,
        }
    }

    /// Read the payload from a named field instead of the first one.
    pub fn with_payload_field(mut self, field: impl Into<String>) -> Self {
        self.payload_field = Some(field.into());
        self
    }

    pub fn shape(&self) -> TargetShape {
        self.shape
    }

    /// Decode every entry of a batch. Failures stay attached to their entry.
    pub fn decode_batch(&self, entries: Vec<RawEntry>) -> Vec<DecodedEntry> {
        entries
            .into_iter()
            .map(|entry| DecodedEntry {
                id: entry.id,
                value: self.decode_entry(&entry),
            })
            .collect()
    }

    pub fn decode_entry(&self, entry: &RawEntry) -> Result<DecodedValue, DecodeError> {
        let payload = entry
            .payload(self.payload_field.as_deref())
            .ok_or_else(|| DecodeError::MissingPayload(self.payload_field.clone()))?;
        self.decode_payload(payload)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<DecodedValue, DecodeError> {
        match self.shape {
            TargetShape::Record => {
                // arbitrary_precision keeps large integers exact
                match serde_json::from_slice::<serde_json::Value>(payload)? {
                    serde_json::Value::Object(map) => Ok(DecodedValue::Record(map)),
                    other => Err(DecodeError::NotARecord(json_kind(&other).to_string())),
                }
            }
            TargetShape::String => {
                let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
                Ok(DecodedValue::String(text.trim_matches('"').to_string()))
            }
            TargetShape::Unsigned => {
                let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
                text.parse()
                    .map(DecodedValue::Unsigned)
                    .map_err(|_| DecodeError::InvalidInteger {
                        kind: "uint64",
                        value: text.to_string(),
                    })
            }
            TargetShape::Signed => {
                let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
                text.parse()
                    .map(DecodedValue::Signed)
                    .map_err(|_| DecodeError::InvalidInteger {
                        kind: "int64",
                        value: text.to_string(),
                    })
            }
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Parse an `XREADGROUP` reply.
///
/// A nil reply (block timeout) is an empty batch. Entries of every stream in
/// the reply are returned in reply order.
pub fn parse_read_reply(reply: &Value) -> Result<Vec<RawEntry>, DecodeError> {
    match reply {
        Value::Nil => Ok(Vec::new()),
        Value::Array(streams) => {
            let mut entries = Vec::new();
            for stream in streams {
                match stream {
                    Value::Array(parts) if parts.len() == 2 => {
                        entries.extend(parse_entries(&parts[1])?);
                    }
                    other => {
                        return Err(DecodeError::Malformed(format!(
                            "expected [stream, entries], got {other:?}"
                        )))
                    }
                }
            }
            Ok(entries)
        }
        // RESP3 replies key the entries by stream name
        Value::Map(streams) => {
            let mut entries = Vec::new();
            for (_, stream_entries) in streams {
                entries.extend(parse_entries(stream_entries)?);
            }
            Ok(entries)
        }
        other => Err(DecodeError::Malformed(format!(
            "unexpected read reply: {other:?}"
        ))),
    }
}

/// Parse a list of `[id, [field, value, ...]]` entries (`XRANGE` shape).
pub fn parse_entries(value: &Value) -> Result<Vec<RawEntry>, DecodeError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(parse_entry).collect(),
        other => Err(DecodeError::Malformed(format!(
            "expected entry list, got {other:?}"
        ))),
    }
}

fn parse_entry(value: &Value) -> Result<RawEntry, DecodeError> {
    let parts = match value {
        Value::Array(parts) if parts.len() == 2 => parts,
        other => {
            return Err(DecodeError::Malformed(format!(
                "expected [id, fields], got {other:?}"
            )))
        }
    };

    let id = parse_id(&parts[0])?;
    match &parts[1] {
        // Deleted after delivery
        Value::Nil => Ok(RawEntry::tombstone(id)),
        fields => Ok(RawEntry::new(id, parse_fields(fields)?)),
    }
}

/// Parse a stream ID from a bulk or simple string.
pub fn parse_id(value: &Value) -> Result<StreamId, DecodeError> {
    let bytes = bytes_of(value)
        .ok_or_else(|| DecodeError::Malformed(format!("expected entry id, got {value:?}")))?;
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
    text.parse()
        .map_err(|e: crate::entry::ParseStreamIdError| DecodeError::Malformed(e.to_string()))
}

fn parse_fields(value: &Value) -> Result<Fields, DecodeError> {
    match value {
        Value::Array(flat) => {
            if flat.len() % 2 != 0 {
                return Err(DecodeError::Malformed(format!(
                    "odd number of field items: {}",
                    flat.len()
                )));
            }
            flat.chunks(2)
                .map(|pair| field_pair(&pair[0], &pair[1]))
                .collect()
        }
        Value::Map(pairs) => pairs.iter().map(|(k, v)| field_pair(k, v)).collect(),
        other => Err(DecodeError::Malformed(format!(
            "expected field list, got {other:?}"
        ))),
    }
}

fn field_pair(key: &Value, value: &Value) -> Result<(String, Vec<u8>), DecodeError> {
    let key = bytes_of(key)
        .ok_or_else(|| DecodeError::Malformed(format!("expected field name, got {key:?}")))?;
    let key = String::from_utf8(key.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
    let value = match value {
        Value::Int(n) => n.to_string().into_bytes(),
        other => bytes_of(other)
            .ok_or_else(|| DecodeError::Malformed(format!("expected field value, got {other:?}")))?
            .to_vec(),
    };
    Ok((key, value))
}

fn bytes_of(value: &Value) -> Option<&[u8]> {
    match value {
        Value::BulkString(bytes) => Some(bytes),
        Value::SimpleString(s) => Some(s.as_bytes()),
        Value::VerbatimString { text, .. } => Some(text.as_bytes()),
        _ => None,
    }
}
