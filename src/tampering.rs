//! Tampering checks for correlated identification events.
//!
//! An event is accepted only when it is fresh, was recorded for the same
//! origin (for body-carrying requests), came from the same client IP, and
//! has not been replayed. Checks short-circuit in that order.

use crate::error::TamperingError;
use crate::routes::HttpMethod;
use chrono::{DateTime, Utc};
use http::Uri;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// The subset of a backend identification event the verifier reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentificationEvent {
    #[serde(default)]
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub ip_address: String,
    #[serde(default)]
    pub replayed: bool,
}

/// The request asking for correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRequest {
    pub method: HttpMethod,
    /// Value of the `Origin` header, if any.
    pub origin: Option<String>,
    pub client_ip: IpAddr,
}

#[derive(Debug, Clone)]
pub struct TamperingVerifier {
    window: Duration,
}

impl TamperingVerifier {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn verify(
        &self,
        event: &IdentificationEvent,
        request: &CorrelationRequest,
        now: DateTime<Utc>,
    ) -> Result<(), TamperingError> {
        let age = now - event.timestamp;
        // A window too large for chrono never expires.
        let window = chrono::Duration::from_std(self.window).ok();
        if window.is_some_and(|window| age > window) {
            return Err(TamperingError::Stale {
                age_ms: age.num_milliseconds(),
                window_ms: self.window.as_millis() as u64,
            });
        }

        if request.method.is_body_carrying() {
            let expected = origin_of(&event.url).unwrap_or_default();
            let actual = request
                .origin
                .as_deref()
                .and_then(origin_of)
                .unwrap_or_default();
            if expected.is_empty() || expected != actual {
                return Err(TamperingError::OriginMismatch {
                    expected,
                    actual: request.origin.clone().unwrap_or_default(),
                });
            }
        }

        let recorded = event.ip_address.trim().parse::<IpAddr>().ok();
        if recorded != Some(request.client_ip) {
            return Err(TamperingError::IpMismatch {
                expected: event.ip_address.clone(),
                actual: request.client_ip.to_string(),
            });
        }

        if event.replayed {
            return Err(TamperingError::Replayed);
        }

        Ok(())
    }
}

/// `scheme://host[:port]` of an absolute URL, lowercased, default port dropped.
pub fn origin_of(url: &str) -> Option<String> {
    let uri: Uri = url.trim().parse().ok()?;
    let scheme = uri.scheme_str()?.to_ascii_lowercase();
    let host = uri.host()?.to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    match uri.port_u16() {
        Some(port) if Some(port) != default_port => Some(format!("{}://{}:{}", scheme, host, port)),
        _ => Some(format!("{}://{}", scheme, host)),
    }
}
