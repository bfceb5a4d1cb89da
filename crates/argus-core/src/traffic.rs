//! Traffic log records.
//!
//! A transaction is written to the log exactly once, when it reaches its final
//! state: blocked, answered by the upstream, or failed inside the engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::BlockDecision;

/// Header name to value map. Repeated headers are joined with `", "`.
pub type Headers = BTreeMap<String, String>;

/// Default number of body bytes kept in the log per request or response.
pub const DEFAULT_BODY_CAPTURE_LIMIT: usize = 64 * 1024;

/// Marker appended to a captured body that was cut at the capture limit.
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Engine-level failure kinds. These are never rule blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionFailure {
    /// The upstream refused or dropped the connection.
    UpstreamConnect,
    /// The upstream did not connect or answer within the timeout.
    UpstreamTimeout,
    /// No leaf certificate could be issued for the intercepted host.
    CertificateIssuance,
    /// The client request body could not be read.
    ClientRequest,
    /// A request or response body exceeded the buffering limit.
    BodyTooLarge,
}

impl TransactionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionFailure::UpstreamConnect => "upstream_connect_failure",
            TransactionFailure::UpstreamTimeout => "upstream_timeout",
            TransactionFailure::CertificateIssuance => "certificate_issuance_failure",
            TransactionFailure::ClientRequest => "client_request_failure",
            TransactionFailure::BodyTooLarge => "body_too_large",
        }
    }
}

impl fmt::Display for TransactionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction ready to be appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrafficEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub url: String,
    pub host: String,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    /// Engine failure annotation, `"<kind>: <detail>"`.
    pub error: Option<String>,
    pub request_headers: Headers,
    pub request_body: Option<String>,
    pub response_headers: Option<Headers>,
    pub response_body: Option<String>,
    /// Full upstream body length in bytes, before capture truncation.
    pub response_size: u64,
}

impl NewTrafficEntry {
    /// Starts an entry for a request observed at `HeaderReceived`.
    pub fn request(
        client_ip: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            client_ip: client_ip.into(),
            method: method.into(),
            url: url.into(),
            host: host.into(),
            status_code: None,
            content_type: None,
            is_blocked: false,
            block_reason: None,
            error: None,
            request_headers: Headers::new(),
            request_body: None,
            response_headers: None,
            response_body: None,
            response_size: 0,
        }
    }

    /// Sets the observation time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attaches captured request headers and body.
    pub fn with_request(mut self, headers: Headers, body: Option<String>) -> Self {
        self.request_headers = headers;
        self.request_body = body;
        self
    }

    /// Marks the entry as blocked by a rule. No status code is recorded.
    pub fn blocked(mut self, decision: &BlockDecision) -> Self {
        self.is_blocked = true;
        self.block_reason = Some(decision.reason.clone());
        self.status_code = None;
        self
    }

    /// Attaches the upstream response.
    pub fn with_response(
        mut self,
        status_code: u16,
        headers: Headers,
        body: Option<String>,
        size: u64,
    ) -> Self {
        self.content_type = headers.get("content-type").cloned();
        self.status_code = Some(status_code);
        self.response_headers = Some(headers);
        self.response_body = body;
        self.response_size = size;
        self
    }

    /// Marks the entry as an engine failure. Never sets `is_blocked`.
    pub fn failed(mut self, failure: TransactionFailure, detail: impl fmt::Display) -> Self {
        self.status_code = None;
        self.error = Some(format!("{}: {}", failure, detail));
        self
    }
}

/// A transaction as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficLogEntry {
    /// Strictly increasing in insertion order.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub url: String,
    pub host: String,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    pub error: Option<String>,
    pub request_headers: Headers,
    pub request_body: Option<String>,
    pub response_headers: Option<Headers>,
    pub response_body: Option<String>,
    pub response_size: u64,
}

impl TrafficLogEntry {
    /// Builds the stored form of an entry once the log has assigned its id.
    pub fn from_new(id: i64, entry: NewTrafficEntry) -> Self {
        Self {
            id,
            timestamp: entry.timestamp,
            client_ip: entry.client_ip,
            method: entry.method,
            url: entry.url,
            host: entry.host,
            status_code: entry.status_code,
            content_type: entry.content_type,
            is_blocked: entry.is_blocked,
            block_reason: entry.block_reason,
            error: entry.error,
            request_headers: entry.request_headers,
            request_body: entry.request_body,
            response_headers: entry.response_headers,
            response_body: entry.response_body,
            response_size: entry.response_size,
        }
    }
}

/// List view of a log entry, without headers or bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSummary {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub url: String,
    pub host: String,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    pub error: Option<String>,
    pub response_size: u64,
}

impl From<&TrafficLogEntry> for TrafficSummary {
    fn from(entry: &TrafficLogEntry) -> Self {
        Self {
            id: entry.id,
            timestamp: entry.timestamp,
            client_ip: entry.client_ip.clone(),
            method: entry.method.clone(),
            url: entry.url.clone(),
            host: entry.host.clone(),
            status_code: entry.status_code,
            content_type: entry.content_type.clone(),
            is_blocked: entry.is_blocked,
            block_reason: entry.block_reason.clone(),
            error: entry.error.clone(),
            response_size: entry.response_size,
        }
    }
}

/// Converts a body into its logged form.
///
/// Empty bodies are dropped. Bodies longer than `limit` bytes are cut on a
/// character boundary and suffixed with [`TRUNCATION_MARKER`]. Non-UTF-8
/// bytes are replaced.
pub fn capture_body(bytes: &[u8], limit: usize) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }

    if bytes.len() <= limit {
        return Some(String::from_utf8_lossy(bytes).into_owned());
    }

    let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    // A multi-byte sequence split at the limit decodes to a trailing U+FFFD.
    if text.ends_with(char::REPLACEMENT_CHARACTER) {
        text.pop();
    }
    text.push_str(TRUNCATION_MARKER);
    Some(text)
}
