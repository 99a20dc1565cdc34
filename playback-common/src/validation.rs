//! Turns raw stream payloads into `PlaybackEvent`s.
//!
//! Validation is pure: the ingestion instant is passed in, so the same payload
//! and instant always produce the same result. Every rejection is a schema
//! violation and can never succeed on retry.
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{EventType, PlaybackEvent, PlaybackMetadata};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("payload is not well-formed JSON: {0}")]
    MalformedPayload(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {field} must be {expected}")]
    InvalidFieldType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("invalid event_type {0:?}")]
    InvalidEventType(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("field {0} must not be negative")]
    NegativeValue(&'static str),
    #[error("field {0} is out of range")]
    OutOfRange(&'static str),
}

impl RejectionReason {
    /// Stable identifier used in dead-letter entries and metric labels.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RejectionReason::MalformedPayload(_) => "malformed_payload",
            RejectionReason::NotAnObject => "not_an_object",
            RejectionReason::MissingField(_) => "missing_field",
            RejectionReason::InvalidFieldType { .. } => "invalid_field_type",
            RejectionReason::InvalidEventType(_) => "invalid_event_type",
            RejectionReason::InvalidTimestamp(_) => "invalid_timestamp",
            RejectionReason::NegativeValue(_) => "negative_value",
            RejectionReason::OutOfRange(_) => "out_of_range",
        }
    }
}

/// Validate and normalize one raw payload.
///
/// Checks run in a fixed order: well-formed JSON object, required fields,
/// `event_type` in the closed set, parsable `timestamp`, non-negative
/// `position` and `chapter`, then `metadata` shape. The first failing check
/// decides the rejection reason.
pub fn validate(
    payload: &[u8],
    ingested_at: DateTime<Utc>,
    retention: Duration,
) -> Result<PlaybackEvent, RejectionReason> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|error| RejectionReason::MalformedPayload(error.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(RejectionReason::NotAnObject);
    };

    let user_id = required_string(&fields, "user_id")?;
    let book_id = required_string(&fields, "book_id")?;
    let raw_event_type = required_string(&fields, "event_type")?;
    let raw_timestamp = required_string(&fields, "timestamp")?;
    let event_id = optional_string(&fields, "event_id")?;

    let event_type: EventType = raw_event_type
        .parse()
        .map_err(|_| RejectionReason::InvalidEventType(raw_event_type.to_owned()))?;

    let timestamp = parse_timestamp(raw_timestamp)?;

    let position = match present(&fields, "position") {
        None => None,
        Some(value) => {
            let position = value.as_f64().ok_or(RejectionReason::InvalidFieldType {
                field: "position",
                expected: "a number",
            })?;
            if position < 0.0 {
                return Err(RejectionReason::NegativeValue("position"));
            }
            Some(position)
        }
    };

    let chapter = match present(&fields, "chapter") {
        None => None,
        Some(value) => Some(parse_chapter(value)?),
    };

    let metadata = match present(&fields, "metadata") {
        None => None,
        Some(Value::Object(metadata)) => Some(parse_metadata(metadata)?),
        Some(_) => {
            return Err(RejectionReason::InvalidFieldType {
                field: "metadata",
                expected: "an object",
            })
        }
    };

    let event_id = match event_id {
        Some(event_id) => event_id.to_owned(),
        // Deterministic, so redelivery of an id-less record stays idempotent.
        None => format!("{user_id}_{raw_timestamp}"),
    };

    Ok(PlaybackEvent {
        event_id,
        user_id: user_id.to_owned(),
        book_id: book_id.to_owned(),
        event_type,
        timestamp,
        position,
        chapter,
        metadata,
        processed_at: ingested_at,
        ttl: ingested_at + retention,
    })
}

/// `null` is treated the same as an absent field.
fn present<'a>(fields: &'a Map<String, Value>, field: &'static str) -> Option<&'a Value> {
    fields.get(field).filter(|value| !value.is_null())
}

fn required_string<'a>(
    fields: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, RejectionReason> {
    match optional_string(fields, field)? {
        Some(value) => Ok(value),
        None => Err(RejectionReason::MissingField(field)),
    }
}

fn optional_string<'a>(
    fields: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, RejectionReason> {
    match present(fields, field) {
        None => Ok(None),
        Some(Value::String(value)) if value.is_empty() => Err(RejectionReason::MissingField(field)),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(_) => Err(RejectionReason::InvalidFieldType {
            field,
            expected: "a string",
        }),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RejectionReason> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    // Offset-less ISO-8601 date-times are taken as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| RejectionReason::InvalidTimestamp(raw.to_owned()))
}

fn parse_chapter(value: &Value) -> Result<u32, RejectionReason> {
    let Value::Number(number) = value else {
        return Err(RejectionReason::InvalidFieldType {
            field: "chapter",
            expected: "an integer",
        });
    };

    if let Some(chapter) = number.as_i64() {
        if chapter < 0 {
            return Err(RejectionReason::NegativeValue("chapter"));
        }
        // Stored in a signed 32-bit column.
        return i32::try_from(chapter)
            .ok()
            .and_then(|chapter| u32::try_from(chapter).ok())
            .ok_or(RejectionReason::OutOfRange("chapter"));
    }

    if number.is_u64() {
        return Err(RejectionReason::OutOfRange("chapter"));
    }

    match number.as_f64() {
        Some(chapter) if chapter < 0.0 => Err(RejectionReason::NegativeValue("chapter")),
        _ => Err(RejectionReason::InvalidFieldType {
            field: "chapter",
            expected: "an integer",
        }),
    }
}

fn parse_metadata(fields: &Map<String, Value>) -> Result<PlaybackMetadata, RejectionReason> {
    let metadata_string = |field: &'static str, name: &'static str| match present(fields, name) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(RejectionReason::InvalidFieldType {
            field,
            expected: "a string",
        }),
    };

    Ok(PlaybackMetadata {
        device_type: metadata_string("metadata.device_type", "device_type")?,
        app_version: metadata_string("metadata.app_version", "app_version")?,
        network_type: metadata_string("metadata.network_type", "network_type")?,
    })
}
