//! Error types for the gateway and the sensor.

use thiserror::Error;

/// Static configuration is missing or invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required value was not provided.
    #[error("missing required configuration value `{0}`")]
    Missing(&'static str),

    /// A route pattern could not be compiled.
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A value was provided but cannot be used.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// A protected request is missing something the identification call needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("request carries no signal")]
    MissingSignal,

    #[error("request is missing required header `{0}`")]
    MissingHeader(&'static str),
}

/// Failure talking to an upstream (identification backend, event API, origin).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("upstream transport failure: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// Status code of a non-2xx response, if that is what failed.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A correlation attempt failed a tampering check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TamperingError {
    #[error("identification event is {age_ms}ms old, window is {window_ms}ms")]
    Stale { age_ms: i64, window_ms: u64 },

    #[error("origin mismatch: event recorded `{expected}`, request declared `{actual}`")]
    OriginMismatch { expected: String, actual: String },

    #[error("client IP mismatch: event recorded `{expected}`, request came from `{actual}`")]
    IpMismatch { expected: String, actual: String },

    #[error("identification event was already replayed")]
    Replayed,

    #[error("correlation token is invalid or expired")]
    InvalidToken,

    #[error("no identification event is recorded for this token")]
    UnknownEvent,
}

/// Sensor-side failures. Always swallowed at the patcher boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("signal collection failed: {0}")]
    Collection(String),

    #[error("agent data processing failed: {0}")]
    AgentData(String),
}

/// Failure reported by a token store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("token store failure: {0}")]
pub struct StoreError(pub String);

/// Aggregate error for the gateway request path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Tampering(#[from] TamperingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_status_accessor() {
        let err = UpstreamError::Status {
            status: 409,
            body: "not ready".to_string(),
        };
        assert_eq!(err.status(), Some(409));
        assert_eq!(UpstreamError::Transport("reset".into()).status(), None);
    }

    #[test]
    fn test_gateway_error_is_transparent() {
        let err: GatewayError = PreconditionError::MissingHeader("user-agent").into();
        assert_eq!(
            err.to_string(),
            "request is missing required header `user-agent`"
        );
    }
}
