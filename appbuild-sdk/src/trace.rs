//! Trace identifiers.
//!
//! Every agent turn is correlated by a composite trace id of the form
//! `app-{applicationId}.req-{requestId}`. Applications that have not been
//! persisted yet use `app-temp-{applicationId}.req-{requestId}`.

use std::fmt;

use serde::{Deserialize, Serialize};

const APP_PREFIX: &str = "app-";
const TEMP_PREFIX: &str = "temp-";
const REQ_PREFIX: &str = "req-";

/// A trace id as received on the wire.
///
/// Deserialization never validates the shape: a malformed id is a
/// correlation problem for the aggregator, not a schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Build a trace id for an application and request.
    pub fn new(application_id: &str, request_id: &str) -> Self {
        Self(format!("{APP_PREFIX}{application_id}.{REQ_PREFIX}{request_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owning application id, if the trace id is well formed.
    pub fn application_id(&self) -> Option<&str> {
        extract_application_id(&self.0)
    }

    /// The request segment with its `req-` prefix removed.
    pub fn request_id(&self) -> Option<&str> {
        let (_, rest) = self.0.split_once('.')?;
        Some(rest.strip_prefix(REQ_PREFIX).unwrap_or(rest))
    }
}

impl From<String> for TraceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TraceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recover the application id from a trace id.
///
/// Splits on the first `.` and strips the `app-` prefix (and the `temp-`
/// marker of unsaved apps). Returns `None` when there is no `.`, the first
/// segment does not start with `app-`, or nothing is left after stripping.
pub fn extract_application_id(trace_id: &str) -> Option<&str> {
    let (app_part, _) = trace_id.split_once('.')?;
    let id = app_part.strip_prefix(APP_PREFIX)?;
    let id = id.strip_prefix(TEMP_PREFIX).unwrap_or(id);
    if id.is_empty() {
        return None;
    }
    Some(id)
}
