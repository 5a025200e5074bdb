//! Rule action enforcement.
//!
//! A block action answers the client directly. An allow action rewrites the
//! request headers (`remove`, then `set`, then `append`) and forwards the
//! request to the origin, returning the origin's response as-is.

use crate::error::UpstreamError;
use crate::rule_action::{HeaderModifications, HeaderPair, RuleAction};
use crate::upstream::Upstream;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode};
use tracing::{debug, warn};

/// Applies rule actions and the configured fallback action.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    fallback: RuleAction,
}

impl PolicyEngine {
    pub fn new(fallback: RuleAction) -> Self {
        Self { fallback }
    }

    /// The action used when identification cannot complete.
    pub fn fallback_action(&self) -> &RuleAction {
        &self.fallback
    }

    /// Apply `action` to `request`.
    ///
    /// Only an allow action contacts the origin.
    pub async fn apply(
        &self,
        action: &RuleAction,
        request: Request<Bytes>,
        origin: &dyn Upstream,
    ) -> Result<Response<Bytes>, UpstreamError> {
        match action {
            RuleAction::Block {
                status_code,
                headers,
                body,
                ..
            } => {
                debug!(
                    ruleset_id = action.ruleset_id(),
                    rule_id = action.rule_id().unwrap_or("-"),
                    status = status_code.as_u16(),
                    "Blocking request"
                );
                Ok(block_response(status_code.as_u16(), headers, body.as_deref()))
            }
            RuleAction::Allow {
                request_header_modifications,
                ..
            } => {
                let (mut parts, body) = request.into_parts();
                if let Some(mods) = request_header_modifications {
                    apply_header_modifications(&mut parts.headers, mods);
                }
                debug!(
                    ruleset_id = action.ruleset_id(),
                    rule_id = action.rule_id().unwrap_or("-"),
                    "Allowing request"
                );
                origin.send(Request::from_parts(parts, body)).await
            }
        }
    }

    /// Apply the fallback action.
    pub async fn fallback(
        &self,
        request: Request<Bytes>,
        origin: &dyn Upstream,
    ) -> Result<Response<Bytes>, UpstreamError> {
        self.apply(&self.fallback, request, origin).await
    }
}

/// Build the canned response of a block action.
pub fn block_response(status: u16, headers: &[HeaderPair], body: Option<&str>) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body.unwrap_or_default().to_string()));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
    for pair in headers {
        if let Some((name, value)) = header_pair(pair) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Apply header modifications in `remove`, `set`, `append` order.
pub fn apply_header_modifications(headers: &mut HeaderMap, mods: &HeaderModifications) {
    for name in &mods.remove {
        match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => {
                headers.remove(name);
            }
            Err(_) => warn!(header = %name, "Skipping invalid header name in remove list"),
        }
    }
    for pair in &mods.set {
        if let Some((name, value)) = header_pair(pair) {
            headers.insert(name, value);
        }
    }
    for pair in &mods.append {
        if let Some((name, value)) = header_pair(pair) {
            headers.append(name, value);
        }
    }
}

fn header_pair(pair: &HeaderPair) -> Option<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(pair.name.as_bytes());
    let value = HeaderValue::from_str(&pair.value);
    match (name, value) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => {
            warn!(header = %pair.name, "Skipping invalid header in rule action");
            None
        }
    }
}
