use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Errors raised by a gateway exchange.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// The session could not be established (connect or handshake failed).
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
    /// The session dropped while the request was in flight.
    #[error("Gateway connection lost: {0}")]
    ConnectionLost(String),
    /// No complete response arrived inside the configured window.
    #[error("Gateway request {req_id} timed out after {}s", .after.as_secs_f64())]
    Timeout { req_id: i64, after: Duration },
    /// The gateway answered with an explicit error payload.
    #[error("Gateway error {code}: {message}")]
    Protocol { code: i32, message: String },
}

/// Caller-facing error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidParameters,
    AccountNotAuthorized,
    ReadOnlyViolation,
    GatewayUnavailable,
    GatewayTimeout,
    GatewayProtocolError,
}

/// Errors returned from a tool invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Account not authorized: {0}")]
    AccountNotAuthorized(String),
    #[error("Read-only mode: {0}")]
    ReadOnlyViolation(String),
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),
    #[error("Gateway error {code}: {message}")]
    GatewayProtocolError { code: i32, message: String },
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::InvalidParameters(_) => ToolErrorKind::InvalidParameters,
            ToolError::AccountNotAuthorized(_) => ToolErrorKind::AccountNotAuthorized,
            ToolError::ReadOnlyViolation(_) => ToolErrorKind::ReadOnlyViolation,
            ToolError::GatewayUnavailable(_) => ToolErrorKind::GatewayUnavailable,
            ToolError::GatewayTimeout(_) => ToolErrorKind::GatewayTimeout,
            ToolError::GatewayProtocolError { .. } => ToolErrorKind::GatewayProtocolError,
        }
    }

    /// Policy and validation errors never warrant a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::GatewayUnavailable(_) | ToolError::GatewayTimeout(_)
        )
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ToolError::InvalidParameters(message.into())
    }

    /// Structured error payload returned to the caller.
    pub fn to_json(&self) -> Value {
        let mut payload = json!({
            "status": "error",
            "kind": self.kind(),
            "error": self.to_string(),
        });
        if let ToolError::GatewayProtocolError { code, .. } = self {
            payload["code"] = json!(code);
        }
        payload
    }
}

impl From<GatewayError> for ToolError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => ToolError::GatewayUnavailable(msg),
            GatewayError::ConnectionLost(msg) => ToolError::GatewayUnavailable(msg),
            timeout @ GatewayError::Timeout { .. } => ToolError::GatewayTimeout(timeout.to_string()),
            GatewayError::Protocol { code, message } => {
                ToolError::GatewayProtocolError { code, message }
            }
        }
    }
}
