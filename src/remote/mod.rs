//! Remote Store Adapter
//!
//! Everything above this module sees exactly two primitives: fetch a full
//! snapshot and apply one action. Network retry and timeout policy lives in
//! the adapters.
//!
//! # Adapters
//!
//! - `http`: the production adapter talking to the spreadsheet web app
//! - `memory`: an in-process store with scriptable faults, used by tests and
//!   the CLI's offline mode

mod http;
mod memory;

pub use http::HttpRemoteStore;
pub use memory::{FetchFault, InMemoryRemote, WriteBehavior};

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PortalError, Result};
use crate::model::{Action, Dataset};

/// Result of a write whose success the transport may not be able to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The remote side acknowledged the write.
    Confirmed,
    /// The request went out but no readable answer came back.
    Ambiguous,
    /// The write is known not to have been applied.
    Failed(String),
}

impl WriteOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, WriteOutcome::Failed(_))
    }
}

/// How write bodies are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// `{ action, payload }` as JSON, response body read.
    #[default]
    Envelope,
    /// `{ action, ...payload }` as JSON, response body read.
    Flattened,
    /// Flattened body sent as `text/plain`; the response is never read.
    Opaque,
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "envelope" => Ok(WriteMode::Envelope),
            "flattened" | "flat" | "compat" => Ok(WriteMode::Flattened),
            "opaque" | "no-cors" => Ok(WriteMode::Opaque),
            other => Err(format!("unknown write mode {:?}", other)),
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Envelope => f.write_str("envelope"),
            WriteMode::Flattened => f.write_str("flattened"),
            WriteMode::Opaque => f.write_str("opaque"),
        }
    }
}

/// Read/write access to the authoritative dataset.
pub trait RemoteStore: Send + Sync + 'static {
    /// Full read of the dataset. Errors are transient by contract.
    fn fetch_snapshot(&self) -> impl Future<Output = Result<Dataset>> + Send;

    /// Applies one action remotely.
    fn apply_action(&self, action: &Action) -> impl Future<Output = WriteOutcome> + Send;
}

/// Wrapped snapshot body. Bodies without a `success` key are bare datasets.
#[derive(Debug, Deserialize)]
struct SnapshotEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes a snapshot response body in either shape.
///
/// A row that fails to decode fails the whole snapshot; it is never read as
/// an empty dataset.
pub fn parse_snapshot(body: &str) -> Result<Dataset> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| PortalError::MalformedPayload(format!("snapshot: {}", e)))?;

    let enveloped = value
        .as_object()
        .map_or(false, |object| object.contains_key("success"));
    if !enveloped {
        return decode_dataset(value);
    }

    let envelope: SnapshotEnvelope = serde_json::from_value(value)
        .map_err(|e| PortalError::MalformedPayload(format!("snapshot envelope: {}", e)))?;
    match envelope {
        SnapshotEnvelope {
            success: true,
            data: Some(data),
            ..
        } => decode_dataset(data),
        SnapshotEnvelope { success: true, .. } => Err(PortalError::MalformedPayload(
            "snapshot envelope without data".to_string(),
        )),
        SnapshotEnvelope { message, .. } => Err(PortalError::RemoteRejected(
            message.unwrap_or_else(|| "snapshot refused".to_string()),
        )),
    }
}

fn decode_dataset(value: Value) -> Result<Dataset> {
    if !value.is_object() {
        return Err(PortalError::MalformedPayload(
            "snapshot is not an object".to_string(),
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| PortalError::MalformedPayload(format!("snapshot data: {}", e)))
}

#[derive(Debug, Deserialize)]
struct WriteAck {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Interprets a readable write response body.
pub fn parse_write_ack(body: &str) -> WriteOutcome {
    match serde_json::from_str::<WriteAck>(body) {
        Ok(WriteAck { success: true, .. }) => WriteOutcome::Confirmed,
        Ok(WriteAck {
            success: false,
            message,
        }) => WriteOutcome::Failed(message.unwrap_or_else(|| "write refused".to_string())),
        Err(e) => {
            tracing::debug!(error = %e, "Write response not readable, outcome ambiguous");
            WriteOutcome::Ambiguous
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enveloped_snapshot() {
        let body = r#"{"success": true, "data": {"students": [{"nis": 1234, "status": "BELUM_MASUK"}], "sessions": [], "rooms": []}}"#;
        let dataset = parse_snapshot(body).unwrap();
        assert_eq!(dataset.students.len(), 1);
        assert_eq!(dataset.students[0].id, "1234");
    }

    #[test]
    fn test_parse_bare_snapshot() {
        let body = r#"{"students": [], "sessions": [{"id": "s-1", "pin": "ABCD"}], "rooms": []}"#;
        let dataset = parse_snapshot(body).unwrap();
        assert_eq!(dataset.sessions[0].access_code, "ABCD");
    }

    #[test]
    fn test_parse_refused_snapshot() {
        let body = r#"{"success": false, "message": "quota exceeded"}"#;
        let err = parse_snapshot(body).unwrap_err();
        assert!(matches!(err, PortalError::RemoteRejected(ref m) if m == "quota exceeded"));
    }

    #[test]
    fn test_bad_row_in_envelope_fails_whole_snapshot() {
        let body = r#"{"success": true, "data": {"students": [{"nama": "no id"}, {"nis": 1, "status": "BELUM_MASUK"}], "sessions": [], "rooms": []}}"#;
        let err = parse_snapshot(body).unwrap_err();
        assert!(matches!(err, PortalError::MalformedPayload(_)), "got {:?}", err);
        assert!(err.is_transient());

        let body = r#"{"success": true, "data": {"sessions": [{"id": "s-1", "aktif": "maybe"}]}}"#;
        assert!(matches!(
            parse_snapshot(body),
            Err(PortalError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_bad_row_in_bare_snapshot_is_malformed() {
        let body = r#"{"students": [{"nama": "no id"}], "sessions": [], "rooms": []}"#;
        assert!(matches!(
            parse_snapshot(body),
            Err(PortalError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_parse_garbage_snapshot() {
        let err = parse_snapshot("<html>Moved Temporarily</html>").unwrap_err();
        assert!(matches!(err, PortalError::MalformedPayload(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_write_ack_outcomes() {
        assert_eq!(parse_write_ack(r#"{"success": true}"#), WriteOutcome::Confirmed);
        assert_eq!(
            parse_write_ack(r#"{"success": false, "message": "NIS 1 not found"}"#),
            WriteOutcome::Failed("NIS 1 not found".to_string())
        );
        assert_eq!(parse_write_ack(""), WriteOutcome::Ambiguous);
    }

    #[test]
    fn test_write_mode_from_str() {
        assert_eq!("envelope".parse::<WriteMode>(), Ok(WriteMode::Envelope));
        assert_eq!("FLATTENED".parse::<WriteMode>(), Ok(WriteMode::Flattened));
        assert_eq!("no-cors".parse::<WriteMode>(), Ok(WriteMode::Opaque));
        assert!("carrier-pigeon".parse::<WriteMode>().is_err());
    }
}
