//! Timestamp wire formats accepted from the remote platform.
//!
//! The log and token endpoints have emitted three shapes over the platform's
//! lifetime: RFC 3339 strings with an explicit offset, bare epoch seconds or
//! milliseconds (numeric or numeric string), and the legacy `/Date(ms±hhmm)/`
//! token. All three are accepted on input; boundaries are always re-emitted
//! as RFC 3339 with offset, since that form is persisted and sent back as a
//! query parameter.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use harvester_core::{Error, Result};
use serde::Deserialize;
use serde_json::Value;

/// Epoch values at or above this magnitude are milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

pub fn parse_value(value: &Value) -> Result<DateTime<FixedOffset>> {
    match value {
        Value::String(s) => parse_str(s),
        Value::Number(n) => match n.as_i64() {
            Some(epoch) => parse_epoch(epoch, &n.to_string()),
            None => Err(malformed(&n.to_string(), "numeric timestamp out of range")),
        },
        other => Err(malformed(
            &other.to_string(),
            "expected a string or integer timestamp",
        )),
    }
}

pub fn parse_str(raw: &str) -> Result<DateTime<FixedOffset>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(malformed(raw, "empty value"));
    }

    if let Some(inner) = trimmed
        .strip_prefix("/Date(")
        .and_then(|rest| rest.strip_suffix(")/"))
    {
        return parse_dotnet(inner, raw);
    }

    if let Ok(epoch) = trimmed.parse::<i64>() {
        return parse_epoch(epoch, raw);
    }

    DateTime::parse_from_rfc3339(trimmed).map_err(|e| malformed(raw, &e.to_string()))
}

fn parse_epoch(epoch: i64, raw: &str) -> Result<DateTime<FixedOffset>> {
    let parsed = if epoch.abs() >= EPOCH_MILLIS_CUTOFF {
        Utc.timestamp_millis_opt(epoch)
    } else {
        Utc.timestamp_opt(epoch, 0)
    };

    match parsed.single() {
        Some(instant) => Ok(instant.fixed_offset()),
        None => Err(malformed(raw, "epoch value out of range")),
    }
}

/// `1431216000000`, `1431216000000+0200` or `1431216000000-0500`; the
/// millisecond payload may itself lead with `-` for pre-epoch instants.
fn parse_dotnet(inner: &str, raw: &str) -> Result<DateTime<FixedOffset>> {
    if inner.is_empty() {
        return Err(malformed(raw, "empty millisecond payload"));
    }

    let zone_start = inner
        .get(1..)
        .and_then(|rest| rest.find(['+', '-']).map(|i| i + 1));
    let (millis_part, zone_part) = match zone_start {
        Some(i) => inner.split_at(i),
        None => (inner, ""),
    };

    let millis: i64 = millis_part
        .parse()
        .map_err(|_| malformed(raw, "bad millisecond payload"))?;

    let offset = if zone_part.is_empty() {
        FixedOffset::east_opt(0).unwrap()
    } else {
        parse_hhmm_offset(zone_part).ok_or_else(|| malformed(raw, "bad zone suffix"))?
    };

    let instant = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| malformed(raw, "millisecond value out of range"))?;
    Ok(instant.with_timezone(&offset))
}

fn parse_hhmm_offset(s: &str) -> Option<FixedOffset> {
    let (sign, digits) = s.split_at(1);
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    let seconds = (hours * 60 + minutes) * 60;
    match sign {
        "+" => FixedOffset::east_opt(seconds),
        "-" => FixedOffset::west_opt(seconds),
        _ => None,
    }
}

fn malformed(raw: &str, details: &str) -> Error {
    Error::Timestamp {
        raw: raw.to_string(),
        details: details.to_string(),
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<DateTime<FixedOffset>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parse_value(&value).map_err(serde::de::Error::custom)
}

pub fn deserialize_opt<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<FixedOffset>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    parse_value(&value).map(Some).map_err(serde::de::Error::custom)
}
