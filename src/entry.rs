//! Core entry types for the consumer-group engine.
//!
//! A [`StreamId`] identifies one entry in a stream. Entries come back from the
//! store as [`RawEntry`] values and are turned into [`DecodedEntry`] values by
//! the [`Decoder`](crate::decoder::Decoder) before reaching a handler.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::error::DecodeError;

/// Field/value pairs of a single stream entry.
pub type Fields = Vec<(String, Vec<u8>)>;

/// A stream entry ID (`<milliseconds>-<sequence>`).
///
/// IDs are assigned by the log store and are strictly increasing within a
/// stream, so the derived ordering (milliseconds first, then sequence) is the
/// stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

/// Error returned when a string is not a valid stream ID.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid stream id: {0:?}")]
pub struct ParseStreamIdError(pub String);

impl StreamId {
    /// The smallest possible ID (`0-0`). No entry ever carries it.
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The ID immediately before this one, if any.
    ///
    /// History reads return entries strictly after the given ID, so replaying
    /// from `id.predecessor()` includes `id` itself.
    pub fn predecessor(&self) -> Option<StreamId> {
        if self.seq > 0 {
            Some(StreamId::new(self.ms, self.seq - 1))
        } else if self.ms > 0 {
            Some(StreamId::new(self.ms - 1, u64::MAX))
        } else {
            None
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseStreamIdError(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(StreamId {
                ms: ms.parse().map_err(|_| err())?,
                seq: seq.parse().map_err(|_| err())?,
            }),
            None => Ok(StreamId {
                ms: s.parse().map_err(|_| err())?,
                seq: 0,
            }),
        }
    }
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOffset {
    /// Only entries never delivered to any consumer of the group (`>`).
    New,
    /// This consumer's own pending entries with IDs after the given one.
    After(StreamId),
}

impl ReadOffset {
    /// Replay a consumer's whole pending history.
    pub fn history() -> Self {
        ReadOffset::After(StreamId::MIN)
    }

    pub fn is_new(&self) -> bool {
        matches!(self, ReadOffset::New)
    }
}

impl fmt::Display for ReadOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadOffset::New => f.write_str(">"),
            ReadOffset::After(id) => id.fmt(f),
        }
    }
}

/// An entry as returned by the store, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: StreamId,
    /// `None` when the entry was deleted after it was delivered; history
    /// reads still report its ID.
    pub fields: Option<Fields>,
}

impl RawEntry {
    pub fn new(id: StreamId, fields: Fields) -> Self {
        Self {
            id,
            fields: Some(fields),
        }
    }

    pub fn tombstone(id: StreamId) -> Self {
        Self { id, fields: None }
    }

    /// The payload bytes: the named field, or the first field when no name is
    /// given.
    pub fn payload(&self, field: Option<&str>) -> Option<&[u8]> {
        let fields = self.fields.as_ref()?;
        match field {
            Some(name) => fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_slice()),
            None => fields.first().map(|(_, value)| value.as_slice()),
        }
    }
}

/// A typed entry value.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    /// A structured record (JSON object). Numbers keep their exact literal.
    Record(Map<String, Value>),
    String(String),
    Unsigned(u64),
    Signed(i64),
}

impl DecodedValue {
    /// Deserialize a record into a concrete type.
    pub fn deserialize_record<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        match self {
            DecodedValue::Record(map) => {
                Ok(serde_json::from_value(Value::Object(map.clone()))?)
            }
            other => Err(DecodeError::NotARecord(other.kind().to_string())),
        }
    }

    pub fn as_record(&self) -> Option<&Map<String, Value>> {
        match self {
            DecodedValue::Record(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DecodedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DecodedValue::Unsigned(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::Signed(n) => Some(*n),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DecodedValue::Record(_) => "record",
            DecodedValue::String(_) => "string",
            DecodedValue::Unsigned(_) => "uint64",
            DecodedValue::Signed(_) => "int64",
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Record(map) => {
                write!(f, "{}", Value::Object(map.clone()))
            }
            DecodedValue::String(s) => f.write_str(s),
            DecodedValue::Unsigned(n) => write!(f, "{n}"),
            DecodedValue::Signed(n) => write!(f, "{n}"),
        }
    }
}

/// One decoded entry. A decode failure is local to the entry.
#[derive(Debug)]
pub struct DecodedEntry {
    pub id: StreamId,
    pub value: Result<DecodedValue, DecodeError>,
}

/// A delivered-but-unacknowledged entry as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: StreamId,
    /// Consumer identity currently owning the entry
    pub consumer: String,
    /// Time since the entry was last delivered
    pub idle: Duration,
    /// Number of times the entry has been delivered
    pub deliveries: u64,
}

/// Context handed to a handler together with the decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stream: String,
    pub group: String,
    /// Consumer identity the entry was delivered to
    pub consumer: String,
    pub id: StreamId,
    /// True when the entry is being redelivered by the reclaimer
    pub reclaimed: bool,
}
