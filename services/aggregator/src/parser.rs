//! Shipment event file parsing.
//!
//! Each event is stored as its own object. The key is the tracking number
//! followed by `--` and a unique id; the body is newline separated
//! `name:value` lines:
//!
//! ```text
//! status:IN TRANSIT
//! timestamp:1573410202
//! ...other fields, ignored
//! ```

use thiserror::Error;

/// Separates the tracking number from the unique suffix in a storage key
pub const KEY_DELIMITER: &str = "--";

const FIELD_SEPARATOR: char = ':';

/// One parsed status update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub tracking_number: String,
    /// Event time in epoch seconds
    pub timestamp: i64,
    pub status: String,
}

/// Result of inspecting a file that could be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Valid(StatusRecord),
    /// Wrong shape; the file is left in place for inspection
    Invalid { reason: String },
}

/// A file with the right shape but an unusable timestamp
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed timestamp {value:?} in {key}")]
    MalformedTimestamp { key: String, value: String },
}

/// Derive the tracking number from a storage key.
///
/// Everything before the first `--`, or the whole key when there is none.
pub fn tracking_number(key: &str) -> &str {
    key.split(KEY_DELIMITER).next().unwrap_or(key)
}

/// Parse the contents of the event file stored under `key`
pub fn parse_event_file(key: &str, contents: &str) -> Result<ParseOutcome, ParseError> {
    if !contents.contains('\n') {
        return Ok(invalid("no line separator"));
    }

    let mut lines: Vec<&str> = contents.split('\n').collect();
    while lines.last().map_or(false, |line| line.is_empty()) {
        lines.pop();
    }

    if let Some(position) = lines.iter().position(|line| !line.contains(FIELD_SEPARATOR)) {
        return Ok(invalid(format!(
            "line {} has no '{}' separator",
            position + 1,
            FIELD_SEPARATOR
        )));
    }

    let (status_line, timestamp_line) = match lines.as_slice() {
        [status, timestamp, ..] => (*status, *timestamp),
        _ => return Ok(invalid("expected status and timestamp lines")),
    };

    let status = field_value(status_line);
    let raw_timestamp = field_value(timestamp_line);
    let timestamp = raw_timestamp
        .parse::<i64>()
        .map_err(|_| ParseError::MalformedTimestamp {
            key: key.to_string(),
            value: raw_timestamp.to_string(),
        })?;

    Ok(ParseOutcome::Valid(StatusRecord {
        tracking_number: tracking_number(key).to_string(),
        timestamp,
        status: status.to_string(),
    }))
}

/// Value after the first separator, surrounding whitespace removed
fn field_value(line: &str) -> &str {
    line.split_once(FIELD_SEPARATOR)
        .map(|(_, value)| value.trim())
        .unwrap_or_default()
}

fn invalid(reason: impl Into<String>) -> ParseOutcome {
    ParseOutcome::Invalid {
        reason: reason.into(),
    }
}
