//! Device log records as they travel through the broker

use serde_json::Value;
use thiserror::Error;

/// Longest accepted device identifier, in characters
pub const MAX_DEVICE_ID_LEN: usize = 10;

/// Record type tag the listener forwards; everything else is ignored.
pub const LOG_RECORD_TYPE: &str = "log";

/// One validated log line from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub device_id: String,
    /// Seconds since the Unix epoch, as reported by the device
    pub time: i64,
    pub text: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("payload is not a JSON object: {0}")]
    Malformed(String),

    #[error("missing field `{0}`")]
    Missing(&'static str),

    #[error("device id is not a string of at most {MAX_DEVICE_ID_LEN} characters")]
    DeviceId,

    #[error("time is not a finite number")]
    Time,

    #[error("text is not a string")]
    Text,
}

impl LogEvent {
    pub fn parse(raw: &[u8]) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| RecordError::Malformed(e.to_string()))?;
        Self::from_value(&value)
    }

    /// Extract the fields from an already parsed object. Every field must
    /// pass; a record is never accepted partially.
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        let object = value
            .as_object()
            .ok_or_else(|| RecordError::Malformed("expected an object".to_string()))?;

        let device_id = match object.get("id").ok_or(RecordError::Missing("id"))? {
            Value::String(id) if id.chars().count() <= MAX_DEVICE_ID_LEN => id.clone(),
            _ => return Err(RecordError::DeviceId),
        };

        let time = match object.get("time").ok_or(RecordError::Missing("time"))? {
            Value::Number(n) => coerce_time(n)?,
            _ => return Err(RecordError::Time),
        };

        let text = match object.get("text").ok_or(RecordError::Missing("text"))? {
            Value::String(text) => text.clone(),
            _ => return Err(RecordError::Text),
        };

        Ok(Self { device_id, time, text })
    }
}

/// Integers pass through; floats are truncated toward zero.
fn coerce_time(n: &serde_json::Number) -> Result<i64, RecordError> {
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Ok(f.trunc() as i64),
        _ => Err(RecordError::Time),
    }
}

/// Whether a parsed device packet carries a log record.
pub fn is_log_record(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some(LOG_RECORD_TYPE)
}
