//! Edge gateway.
//!
//! Classifies every inbound request and dispatches it:
//!
//! - sensor assets are served from the gateway (or the identification host),
//! - identification pages are forwarded and get the sensor injected,
//! - protected API calls are identified and the resulting rule action is
//!   enforced,
//! - everything else is forwarded to the origin unchanged.

use crate::config::GatewayConfig;
use crate::correlation::{CorrelationService, ServerApiClient};
use crate::error::{ConfigError, GatewayError};
use crate::html::{render_sensor_fragment, HeadInjector, HtmlInjector};
use crate::identification::IdentificationClient;
use crate::policy::PolicyEngine;
use crate::routes::{HttpMethod, ProtectedApis, RouteClassification, RouteClassifier};
use crate::rule_action::RuleAction;
use crate::scripts::SensorScripts;
use crate::sensor::SensorSettings;
use crate::store::MemoryTokenStore;
use crate::tampering::{origin_of, CorrelationRequest, TamperingVerifier};
use crate::upstream::Upstream;
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
    HOST, ORIGIN, SET_COOKIE,
};
use http::{Method, Request, Response, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The edge request handler.
pub struct EdgeGateway {
    classifier: RouteClassifier,
    identification: IdentificationClient,
    policy: PolicyEngine,
    scripts: SensorScripts,
    origin: Arc<dyn Upstream>,
    injector: Arc<dyn HtmlInjector>,
    sensor_fragment: String,
    signals_header: HeaderName,
    agent_data_header: HeaderName,
    correlation: Option<CorrelationService>,
    correlation_header: HeaderName,
    scheme: String,
}

impl EdgeGateway {
    /// Build a gateway from validated configuration.
    ///
    /// `origin` receives forwarded application traffic; `backend` carries
    /// identification, event API, loader and browser cache requests.
    pub fn new(
        config: &GatewayConfig,
        origin: Arc<dyn Upstream>,
        backend: Arc<dyn Upstream>,
    ) -> Result<Self, ConfigError> {
        let routes = &config.routes;
        let identification_config = &config.identification;

        let protected = ProtectedApis::new(&routes.protected_apis)?;
        let classifier =
            RouteClassifier::new(&routes.sensor_prefix, &routes.identification_pages, protected)?;
        let identification =
            IdentificationClient::new(identification_config, &routes.sensor_prefix, backend.clone())?;
        let scripts = SensorScripts::new(&config.scripts, backend.clone())?;

        let correlation = if config.correlation.enabled {
            let store = Arc::new(MemoryTokenStore::new(
                config.correlation.store_capacity,
                Duration::from_secs(config.correlation.token_validity_seconds),
            ));
            let events = Arc::new(ServerApiClient::new(identification_config, backend)?);
            let verifier =
                TamperingVerifier::new(Duration::from_secs(config.tampering.max_event_age_seconds));
            Some(CorrelationService::new(&config.correlation, store, events, verifier)?)
        } else {
            None
        };

        let settings = SensorSettings {
            protected_apis: routes.protected_apis.clone(),
            signals_header: identification_config.signals_header.clone(),
            agent_data_header: identification_config.agent_data_header.clone(),
        };
        let mut sources = vec![format!("{}sensor.js", classifier.sensor_prefix())];
        if scripts.has_loader() {
            let mut loader = format!("{}loader.js", classifier.sensor_prefix());
            if let Some(key) = identification_config.public_api_key.as_deref() {
                loader.push_str("?apiKey=");
                loader.push_str(key);
            }
            sources.push(loader);
        }
        let sensor_fragment =
            render_sensor_fragment(&settings, &sources).map_err(|e| ConfigError::InvalidValue {
                field: "routes.protected_apis",
                reason: e.to_string(),
            })?;

        info!(
            protected_routes = routes.protected_apis.len(),
            identification_pages = routes.identification_pages.len(),
            identification_host = identification.host(),
            correlation = correlation.is_some(),
            "Edge gateway configured"
        );

        Ok(Self {
            classifier,
            identification,
            policy: PolicyEngine::new(identification_config.fallback_rule_action.clone()),
            scripts,
            origin,
            injector: Arc::new(HeadInjector),
            sensor_fragment,
            signals_header: header_name(
                &identification_config.signals_header,
                "identification.signals_header",
            )?,
            agent_data_header: header_name(
                &identification_config.agent_data_header,
                "identification.agent_data_header",
            )?,
            correlation,
            correlation_header: header_name(
                &config.correlation.token_header,
                "correlation.token_header",
            )?,
            scheme: routes.scheme.clone(),
        })
    }

    /// Replace the HTML injector used on identification pages.
    pub fn with_html_injector(mut self, injector: Arc<dyn HtmlInjector>) -> Self {
        self.injector = injector;
        self
    }

    /// Handle one edge request. Never fails; errors become bare responses.
    pub async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        let url = self.absolute_url(&request);
        let classification = self.classifier.classify(&url, request.method().as_str());
        debug!(url = %url, method = %request.method(), route = ?classification, "Classified request");

        let result = match classification {
            RouteClassification::SensorAsset { name } => self.sensor_asset(&name, request).await,
            RouteClassification::Identification => self.identification_page(request).await,
            RouteClassification::Protection { method } => self.protect(request, &url, method).await,
            RouteClassification::None => self.forward(request).await,
        };

        result.unwrap_or_else(|e| error_response(&e))
    }

    fn absolute_url<B>(&self, request: &Request<B>) -> String {
        let uri = request.uri();
        if uri.scheme().is_some() && uri.authority().is_some() {
            return uri.to_string();
        }
        let host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| uri.authority().map(|a| a.as_str()))
            .unwrap_or("localhost");
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        format!("{}://{}{}", self.scheme, host, path)
    }

    async fn forward(&self, request: Request<Bytes>) -> Result<Response<Bytes>, GatewayError> {
        Ok(self.origin.send(request).await?)
    }

    async fn sensor_asset(
        &self,
        name: &str,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, GatewayError> {
        let readable = request.method() == Method::GET || request.method() == Method::HEAD;
        match name {
            "sensor.js" if readable => return Ok(self.scripts.sensor_script()),
            "loader.js" if readable && self.scripts.has_loader() => {
                return self.scripts.agent_loader(&request).await
            }
            _ => {}
        }

        if let Some(correlation) = &self.correlation {
            match name {
                "token" if request.method() == Method::POST => {
                    return self.issue_token(correlation, &request).await
                }
                "correlate" if request.method() == Method::POST => {
                    return self.correlate(correlation, &request).await
                }
                _ => {}
            }
        }

        match self.identification.browser_cache(&request).await? {
            Some(response) => Ok(response),
            None => self.forward(request).await,
        }
    }

    async fn issue_token(
        &self,
        correlation: &CorrelationService,
        request: &Request<Bytes>,
    ) -> Result<Response<Bytes>, GatewayError> {
        let Some(signal) = self.identification.signal(request) else {
            return Ok(bare_response(StatusCode::BAD_REQUEST));
        };
        let token = correlation.issue(&signal.value).await?;
        Ok(json_response(json!({ "token": token })))
    }

    async fn correlate(
        &self,
        correlation: &CorrelationService,
        request: &Request<Bytes>,
    ) -> Result<Response<Bytes>, GatewayError> {
        let token = request
            .headers()
            .get(&self.correlation_header)
            .and_then(|v| v.to_str().ok());
        let client_ip = self.identification.client_ip_resolver().resolve(request);
        let (Some(token), Some(client_ip)) = (token, client_ip) else {
            return Ok(bare_response(StatusCode::BAD_REQUEST));
        };

        let correlation_request = CorrelationRequest {
            method: HttpMethod::Post,
            origin: request
                .headers()
                .get(ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            client_ip,
        };
        let event = correlation.correlate(token, &correlation_request).await?;
        Ok(json_response(json!({ "request_id": event.request_id })))
    }

    async fn identification_page(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, GatewayError> {
        let response = self.forward(request).await?;
        Ok(self.inject_sensor(response))
    }

    fn inject_sensor(&self, response: Response<Bytes>) -> Response<Bytes> {
        let headers = response.headers();
        let is_html = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"));
        let encoded = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| !v.trim().eq_ignore_ascii_case("identity"));
        if !is_html || encoded {
            return response;
        }

        let (mut parts, body) = response.into_parts();
        let Ok(html) = std::str::from_utf8(&body) else {
            return Response::from_parts(parts, body);
        };
        match self.injector.inject_into_head(html, &self.sensor_fragment) {
            Some(injected) => {
                parts.headers.remove(CONTENT_LENGTH);
                debug!("Injected sensor into identification page");
                Response::from_parts(parts, Bytes::from(injected))
            }
            None => {
                debug!("Identification page has no head element, leaving it untouched");
                Response::from_parts(parts, body)
            }
        }
    }

    /// The signal and correlation-token headers never reach the origin.
    fn strip_internal_headers(&self, request: &mut Request<Bytes>) {
        request.headers_mut().remove(&self.signals_header);
        request.headers_mut().remove(&self.correlation_header);
    }

    async fn protect(
        &self,
        mut request: Request<Bytes>,
        url: &str,
        method: HttpMethod,
    ) -> Result<Response<Bytes>, GatewayError> {
        let result = match self.identification.send(&request).await {
            Ok(result) => result,
            Err(GatewayError::Precondition(e)) => {
                info!(url = %url, method = %method, reason = %e, "Applying fallback action");
                self.strip_internal_headers(&mut request);
                return Ok(self.policy.fallback(request, self.origin.as_ref()).await?);
            }
            Err(GatewayError::Upstream(e)) => {
                warn!(url = %url, method = %method, error = %e, "Identification failed, applying fallback action");
                self.strip_internal_headers(&mut request);
                return Ok(self.policy.fallback(request, self.origin.as_ref()).await?);
            }
            Err(e) => return Err(e),
        };

        self.record_correlation(&request, result.request_id.as_deref()).await;

        let signal = self.identification.signal(&request);
        if let Some(signal) = &signal {
            if !signal.credentials_requested && is_cross_origin(&request, url) {
                request.headers_mut().remove(COOKIE);
            }
        }
        self.strip_internal_headers(&mut request);

        let action = result
            .rule_action
            .clone()
            .unwrap_or_else(|| RuleAction::allow("none"));
        let mut response = self
            .policy
            .apply(&action, request, self.origin.as_ref())
            .await?;

        let headers = response.headers_mut();
        for cookie in &result.set_cookie_headers {
            match HeaderValue::from_str(cookie) {
                Ok(value) => {
                    headers.append(SET_COOKIE, value);
                }
                Err(_) => warn!("Skipping invalid Set-Cookie from identification backend"),
            }
        }
        match HeaderValue::from_str(&result.agent_data) {
            Ok(value) => {
                headers.insert(self.agent_data_header.clone(), value);
            }
            Err(_) => warn!("Agent data is not a valid header value"),
        }

        info!(
            url = %url,
            method = %method,
            action = action.kind(),
            ruleset_id = action.ruleset_id(),
            rule_id = action.rule_id().unwrap_or("-"),
            status = response.status().as_u16(),
            credentials_requested = signal.as_ref().is_some_and(|s| s.credentials_requested),
            "Protected request handled"
        );
        Ok(response)
    }

    async fn record_correlation(&self, request: &Request<Bytes>, request_id: Option<&str>) {
        let (Some(correlation), Some(request_id)) = (&self.correlation, request_id) else {
            return;
        };
        let Some(token) = request
            .headers()
            .get(&self.correlation_header)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        if let Err(e) = correlation.record_request_id(token, request_id).await {
            warn!(error = %e, "Could not record request id for correlation token");
        }
    }
}

/// The request's `Origin` differs from the origin of the URL it targets.
fn is_cross_origin<B>(request: &Request<B>, url: &str) -> bool {
    let Some(declared) = request
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .and_then(origin_of)
    else {
        return false;
    };
    origin_of(url).is_some_and(|target| target != declared)
}

fn header_name(name: &str, field: &'static str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::InvalidValue {
        field,
        reason: e.to_string(),
    })
}

fn bare_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

fn json_response(value: serde_json::Value) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(value.to_string()));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Map a request-path failure to a response that reveals nothing about it.
pub fn error_response(err: &GatewayError) -> Response<Bytes> {
    let status = match err {
        GatewayError::Configuration(e) => {
            error!(error = %e, "Gateway misconfigured");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        GatewayError::Store(e) => {
            error!(error = %e, "Token store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        GatewayError::Upstream(e) => {
            error!(error = %e, "Upstream failure");
            StatusCode::BAD_GATEWAY
        }
        GatewayError::Tampering(e) => {
            warn!(error = %e, "Tampering detected");
            StatusCode::FORBIDDEN
        }
        GatewayError::Precondition(e) => {
            debug!(error = %e, "Precondition failed");
            StatusCode::BAD_REQUEST
        }
    };
    bare_response(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PreconditionError, TamperingError, UpstreamError};

    #[test]
    fn test_error_mapping() {
        let cases = [
            (GatewayError::from(ConfigError::Missing("x")), 500),
            (GatewayError::from(UpstreamError::Transport("reset".into())), 502),
            (GatewayError::from(TamperingError::Replayed), 403),
            (GatewayError::from(PreconditionError::MissingSignal), 400),
        ];
        for (err, status) in cases {
            let response = error_response(&err);
            assert_eq!(response.status(), status);
            assert!(response.body().is_empty());
        }
    }

    #[test]
    fn test_is_cross_origin() {
        let same = Request::builder()
            .header(ORIGIN, "https://shop.example.com")
            .body(())
            .unwrap();
        assert!(!is_cross_origin(&same, "https://shop.example.com/api/x"));

        let other = Request::builder()
            .header(ORIGIN, "https://app.example.net")
            .body(())
            .unwrap();
        assert!(is_cross_origin(&other, "https://shop.example.com/api/x"));

        let none = Request::builder().body(()).unwrap();
        assert!(!is_cross_origin(&none, "https://shop.example.com/api/x"));
    }
}
