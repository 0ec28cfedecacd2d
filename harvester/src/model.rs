use chrono::{DateTime, FixedOffset};
use harvester_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::timefmt;

/// Key carrying the server-assigned sort timestamp in each returned event.
pub const SERVER_TIMESTAMP_FIELD: &str = "server_timestamp";

/// Durable cursor committed alongside each delivered record.
///
/// `boundary` is the coarse server-side sort key; `offset` counts how many
/// already-delivered records share that exact instant. Together they resume
/// the stream without gaps even when many records carry the same timestamp.
/// Equality is by instant, so the same position parsed from different wire
/// forms compares equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub boundary: DateTime<FixedOffset>,
    pub offset: u64,
}

impl Position {
    pub fn new(boundary: DateTime<FixedOffset>, offset: u64) -> Self {
        Self { boundary, offset }
    }
}

/// One harvested record: the parsed pagination key plus the complete original
/// JSON object, passed through to the sink untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub server_timestamp: DateTime<FixedOffset>,
    pub payload: Map<String, Value>,
}

impl EventRecord {
    pub fn from_value(value: Value) -> Result<Self> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::Validation(format!(
                    "event is not a JSON object: {other}"
                )))
            }
        };

        let raw = map.get(SERVER_TIMESTAMP_FIELD).ok_or_else(|| {
            Error::Validation(format!("event has no {SERVER_TIMESTAMP_FIELD} field"))
        })?;
        let server_timestamp = timefmt::parse_value(raw)?;

        Ok(Self {
            server_timestamp,
            payload: map,
        })
    }
}

/// Query parameters for one fetch cycle, derived from the position committed
/// for the last record of the previous cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    pub from_time: DateTime<FixedOffset>,
    pub offset: u64,
    pub limit: u32,
}

/// Persisted resume state for one source key.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub position: Position,
    pub records_processed: i64,
}
