//! Wire protocol types for supervisor-agent communication.
//!
//! One message shape covers the whole protocol: requests (correlated by
//! `reqId`), their responses, and one-way notifications. Commands are a small
//! closed set, not an open routing namespace.

use serde::{Deserialize, Serialize};

/// Correlation token for a request/response pair.
///
/// UUID v4 keeps tokens process-unique without coordination between the two
/// endpoints, and prevents accidental reuse across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one connected agent on the supervisor side.
///
/// Never crosses the wire; the supervisor uses it to route responses to the
/// connection that owns the outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notify,
}

/// One control-channel frame.
///
/// `req_id` is present only on request/response pairs. `error` is carried only
/// on failed responses; a response with `error` set rejects the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "reqId", default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<RequestId>,
    pub kind: MessageKind,
    pub command: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlMessage {
    pub fn request(
        req_id: RequestId,
        command: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            req_id: Some(req_id),
            kind: MessageKind::Request,
            command: command.into(),
            payload,
            error: None,
        }
    }

    pub fn response(
        req_id: RequestId,
        command: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            req_id: Some(req_id),
            kind: MessageKind::Response,
            command: command.into(),
            payload,
            error: None,
        }
    }

    pub fn error_response(
        req_id: RequestId,
        command: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            req_id: Some(req_id),
            kind: MessageKind::Response,
            command: command.into(),
            payload: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn notify(command: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            req_id: None,
            kind: MessageKind::Notify,
            command: command.into(),
            payload,
            error: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }
}

/// The closed command set spoken between supervisor and agent.
pub mod commands {
    /// Agent -> supervisor: the hosted app bound its server; payload is the URL string.
    pub const URL: &str = "url";
    /// Supervisor -> agent: polite shutdown request; payload names the signal
    /// that follows if the child does not exit in time.
    pub const CLOSE: &str = "close";
    /// Agent -> supervisor: relay an HTTP request to a sibling capability.
    pub const FETCH: &str = "fetch";
    /// Supervisor -> agent: run the app-registered health check.
    pub const HEALTHCHECK: &str = "healthcheck";
    /// Supervisor -> agent: run the app-registered readiness check.
    pub const READINESS: &str = "readiness";
    /// Supervisor -> agent: collect a metrics snapshot.
    pub const METRICS: &str = "metrics";
    /// Agent -> supervisor: forwarded log event from the child's event bus.
    pub const LOG: &str = "log";
    /// Agent -> supervisor: uncaught error; the child exits right after sending.
    pub const FATAL_ERROR: &str = "fatal_error";
}
