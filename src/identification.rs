//! Identification backend client.
//!
//! Sends the signal together with a minimal description of the client to the
//! identification service and returns agent data, the rule action to enforce,
//! and cookies to propagate to the client.

use crate::config::{IdentificationConfig, DEFAULT_REGION};
use crate::error::{ConfigError, GatewayError, PreconditionError, UpstreamError};
use crate::rule_action::RuleAction;
use crate::sensor::CREDENTIALS_SENTINEL;
use crate::upstream::{ClientAddr, Upstream};
use bytes::Bytes;
use http::header::{HeaderName, COOKIE, HOST, SET_COOKIE, USER_AGENT};
use http::{HeaderMap, Method, Request, Response};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header carrying the secret API key.
pub const API_KEY_HEADER: &str = "auth-api-key";

/// Outcome of a successful identification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub agent_data: String,
    pub rule_action: Option<RuleAction>,
    pub set_cookie_headers: Vec<String>,
    /// Backend identifier of the identification event, when reported.
    pub request_id: Option<String>,
}

/// A signal read from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Signal with any credentials marker removed
    pub value: String,
    /// The page asked for credentials itself
    pub credentials_requested: bool,
}

impl Signal {
    pub fn parse(raw: &str) -> Option<Self> {
        let (value, credentials_requested) = match raw.strip_prefix(CREDENTIALS_SENTINEL) {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        if value.is_empty() {
            return None;
        }
        Some(Self {
            value: value.to_string(),
            credentials_requested,
        })
    }
}

/// Resolves the client IP from a forwarding header or the peer address.
#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    header: HeaderName,
    trusted: Vec<IpNet>,
}

impl ClientIpResolver {
    pub fn new(header: &str, trusted: Vec<IpNet>) -> Result<Self, ConfigError> {
        let header = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
            ConfigError::InvalidValue {
                field: "identification.client_ip_header",
                reason: e.to_string(),
            }
        })?;
        Ok(Self { header, trusted })
    }

    /// First address in the forwarding header when the peer is a trusted
    /// proxy, otherwise the peer address. With no trusted proxies the header
    /// is never read.
    pub fn resolve<B>(&self, request: &Request<B>) -> Option<IpAddr> {
        let peer = request.extensions().get::<ClientAddr>().map(|addr| addr.0);
        let trusted_peer =
            peer.is_some_and(|ip| self.trusted.iter().any(|net| net.contains(&ip)));

        if trusted_peer {
            let forwarded = request
                .headers()
                .get(&self.header)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok());
            if forwarded.is_some() {
                return forwarded;
            }
        }
        peer
    }
}

/// Host serving `region`: the bare host for the default region, otherwise
/// `<region>.<host>`.
pub fn region_host(host: &str, region: &str) -> String {
    if region.is_empty() || region.eq_ignore_ascii_case(DEFAULT_REGION) {
        host.to_string()
    } else {
        format!("{}.{}", region.to_ascii_lowercase(), host)
    }
}

/// Value of cookie `name` in any `Cookie` header.
pub fn extract_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|cookie| {
            let (key, value) = cookie.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}

#[derive(Debug, Serialize)]
struct IdentifyRequest<'a> {
    fingerprint_data: &'a str,
    client_host: &'a str,
    client_ip: String,
    client_user_agent: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_cookie: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    client_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ruleset_context: Option<RulesetContext<'a>>,
}

#[derive(Debug, Serialize)]
struct RulesetContext<'a> {
    ruleset_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    agent_data: Option<String>,
    #[serde(default)]
    rule_action: Option<RuleAction>,
    #[serde(default)]
    request_id: Option<String>,
}

/// Client for the identification backend.
pub struct IdentificationClient {
    upstream: Arc<dyn Upstream>,
    host: String,
    endpoint: String,
    secret_api_key: String,
    ruleset_id: Option<String>,
    session_cookie_name: String,
    signals_header: HeaderName,
    sensor_prefix: String,
    client_ip: ClientIpResolver,
}

impl IdentificationClient {
    pub fn new(
        config: &IdentificationConfig,
        sensor_prefix: &str,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self, ConfigError> {
        let secret_api_key = config
            .secret_api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::Missing("identification.secret_api_key"))?;
        let signals_header =
            HeaderName::from_bytes(config.signals_header.as_bytes()).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "identification.signals_header",
                    reason: e.to_string(),
                }
            })?;
        let host = region_host(&config.host, &config.region);
        let path = config.identify_path.trim_start_matches('/');

        Ok(Self {
            upstream,
            endpoint: format!("https://{}/{}", host, path),
            host,
            secret_api_key,
            ruleset_id: config.ruleset_id.clone(),
            session_cookie_name: config.session_cookie_name.clone(),
            signals_header,
            sensor_prefix: format!("/{}/", sensor_prefix.trim_matches('/')),
            client_ip: ClientIpResolver::new(
                &config.client_ip_header,
                config.trusted_proxy_ranges()?,
            )?,
        })
    }

    /// Region-resolved identification host.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client_ip_resolver(&self) -> &ClientIpResolver {
        &self.client_ip
    }

    /// The signal carried by `request`, if any.
    pub fn signal<B>(&self, request: &Request<B>) -> Option<Signal> {
        request
            .headers()
            .get(&self.signals_header)
            .and_then(|v| v.to_str().ok())
            .and_then(Signal::parse)
    }

    /// Identify the client behind `request`.
    ///
    /// Fails without contacting the backend when the signal or a required
    /// client header is missing.
    pub async fn send(&self, request: &Request<Bytes>) -> Result<SendResult, GatewayError> {
        let signal = self.signal(request).ok_or(PreconditionError::MissingSignal)?;
        let client_ip = self
            .client_ip
            .resolve(request)
            .ok_or(PreconditionError::MissingHeader("client ip"))?;
        let headers = request.headers();
        let client_host = header_str(headers, &HOST).ok_or(PreconditionError::MissingHeader("host"))?;
        let client_user_agent = header_str(headers, &USER_AGENT)
            .ok_or(PreconditionError::MissingHeader("user-agent"))?;

        let payload = IdentifyRequest {
            fingerprint_data: &signal.value,
            client_host,
            client_ip: client_ip.to_string(),
            client_user_agent,
            client_cookie: extract_cookie(headers, &self.session_cookie_name),
            client_headers: self.forwardable_headers(headers),
            ruleset_context: self
                .ruleset_id
                .as_deref()
                .map(|ruleset_id| RulesetContext { ruleset_id }),
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| UpstreamError::Transport(format!("encoding identify request: {}", e)))?;

        let outbound = Request::builder()
            .method(Method::POST)
            .uri(&self.endpoint)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, &self.secret_api_key)
            .body(Bytes::from(body))
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let response = self.upstream.send(outbound).await?;
        let status = response.status();
        if !status.is_success() {
            let body = String::from_utf8_lossy(response.body()).into_owned();
            warn!(status = status.as_u16(), body = %body, "Identification request failed");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let parsed: IdentifyResponse = serde_json::from_slice(response.body())
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        let agent_data = parsed
            .agent_data
            .ok_or_else(|| UpstreamError::InvalidResponse("missing agent_data".to_string()))?;

        let set_cookie_headers = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();

        debug!(
            client_ip = %client_ip,
            action = parsed.rule_action.as_ref().map(RuleAction::kind).unwrap_or("none"),
            "Identification complete"
        );

        Ok(SendResult {
            agent_data,
            rule_action: parsed.rule_action,
            set_cookie_headers,
            request_id: parsed.request_id,
        })
    }

    /// Forward a sensor sub-resource request to the identification host.
    ///
    /// Returns `Ok(None)` for methods that carry a body; those go to the
    /// origin instead.
    pub async fn browser_cache(
        &self,
        request: &Request<Bytes>,
    ) -> Result<Option<Response<Bytes>>, UpstreamError> {
        if request.method() != Method::GET && request.method() != Method::HEAD {
            return Ok(None);
        }

        let path = request.uri().path();
        let stripped = path.strip_prefix(self.sensor_prefix.as_str()).unwrap_or(path);
        let mut target = format!("https://{}/{}", self.host, stripped.trim_start_matches('/'));
        if let Some(query) = request.uri().query() {
            target.push('?');
            target.push_str(query);
        }

        let mut outbound = Request::builder()
            .method(request.method().clone())
            .uri(&target)
            .body(Bytes::new())
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let headers = outbound.headers_mut();
        for (name, value) in request.headers() {
            if name != COOKIE && name != HOST {
                headers.append(name.clone(), value.clone());
            }
        }

        debug!(target = %target, "Forwarding browser cache request");
        self.upstream.send(outbound).await.map(Some)
    }

    fn forwardable_headers(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            if name == COOKIE || name == self.signals_header {
                continue;
            }
            let Ok(value) = value.to_str() else {
                continue;
            };
            out.entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        out
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockBackend {
        calls: AtomicUsize,
        requests: Mutex<Vec<Request<Bytes>>>,
        status: u16,
        body: &'static str,
        cookies: Vec<&'static str>,
    }

    impl MockBackend {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(vec![]),
                status,
                body,
                cookies: vec!["_zsid=abc; Path=/", "_zsid_lt=def; Path=/"],
            })
        }

        fn last_json(&self) -> serde_json::Value {
            let requests = self.requests.lock().unwrap();
            serde_json::from_slice(requests.last().unwrap().body()).unwrap()
        }
    }

    #[async_trait]
    impl Upstream for MockBackend {
        async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            let mut response = Response::new(Bytes::from_static(self.body.as_bytes()));
            *response.status_mut() = http::StatusCode::from_u16(self.status).unwrap();
            for cookie in &self.cookies {
                response
                    .headers_mut()
                    .append(SET_COOKIE, cookie.parse().unwrap());
            }
            Ok(response)
        }
    }

    fn config() -> IdentificationConfig {
        IdentificationConfig {
            secret_api_key: Some("secret".to_string()),
            ruleset_id: Some("rs_main".to_string()),
            trusted_proxies: vec!["10.0.0.0/8".to_string()],
            ..IdentificationConfig::default()
        }
    }

    fn client(backend: Arc<MockBackend>) -> IdentificationClient {
        IdentificationClient::new(&config(), "_sensor", backend).unwrap()
    }

    fn protected_request() -> Request<Bytes> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/login")
            .header("host", "shop.example.com")
            .header("user-agent", "Mozilla/5.0 Chrome/120")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-sensor-signals", "signal-value")
            .header("cookie", "_zsid=session; cart=private")
            .header("accept", "application/json")
            .extension(ClientAddr("10.0.0.2".parse().unwrap()))
            .body(Bytes::from_static(b"{}"))
            .unwrap()
    }

    #[test]
    fn test_region_host() {
        assert_eq!(region_host("api.example.com", "us"), "api.example.com");
        assert_eq!(region_host("api.example.com", ""), "api.example.com");
        assert_eq!(region_host("api.example.com", "eu"), "eu.api.example.com");
        assert_eq!(region_host("api.example.com", "AP"), "ap.api.example.com");
    }

    #[test]
    fn test_extract_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, "a=1; _zsid=xyz".parse().unwrap());
        headers.append(COOKIE, "b=2".parse().unwrap());
        assert_eq!(extract_cookie(&headers, "_zsid"), Some("xyz"));
        assert_eq!(extract_cookie(&headers, "b"), Some("2"));
        assert_eq!(extract_cookie(&headers, "_zs"), None);
    }

    #[test]
    fn test_signal_parse() {
        let plain = Signal::parse("abc").unwrap();
        assert!(!plain.credentials_requested);
        let marked = Signal::parse(&format!("{}abc", CREDENTIALS_SENTINEL)).unwrap();
        assert_eq!(marked.value, "abc");
        assert!(marked.credentials_requested);
        assert!(Signal::parse("").is_none());
        assert!(Signal::parse(&CREDENTIALS_SENTINEL.to_string()).is_none());
    }

    #[tokio::test]
    async fn test_send_builds_minimal_payload() {
        let backend = MockBackend::new(
            200,
            r#"{"agent_data":"agent","request_id":"req_1","rule_action":{"type":"allow","ruleset_id":"rs_main"}}"#,
        );
        let client = client(backend.clone());

        let result = client.send(&protected_request()).await.unwrap();
        assert_eq!(result.agent_data, "agent");
        assert_eq!(result.request_id.as_deref(), Some("req_1"));
        assert_eq!(result.rule_action, Some(RuleAction::allow("rs_main")));
        assert_eq!(result.set_cookie_headers.len(), 2);

        let body = backend.last_json();
        assert_eq!(body["fingerprint_data"], "signal-value");
        assert_eq!(body["client_ip"], "203.0.113.7");
        assert_eq!(body["client_host"], "shop.example.com");
        assert_eq!(body["client_cookie"], "session");
        assert_eq!(body["ruleset_context"]["ruleset_id"], "rs_main");
        assert_eq!(body["client_headers"]["accept"], "application/json");
        assert!(body["client_headers"].get("cookie").is_none());
        assert!(body["client_headers"].get("x-sensor-signals").is_none());

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].uri(), "https://identification.zentinelproxy.io/v1/identify");
        assert_eq!(requests[0].headers()[API_KEY_HEADER], "secret");
    }

    #[tokio::test]
    async fn test_send_strips_credentials_marker() {
        let backend = MockBackend::new(200, r#"{"agent_data":"agent"}"#);
        let client = client(backend.clone());
        let mut request = protected_request();
        request.headers_mut().insert(
            "x-sensor-signals",
            format!("{}marked", CREDENTIALS_SENTINEL).parse().unwrap(),
        );

        client.send(&request).await.unwrap();
        assert_eq!(backend.last_json()["fingerprint_data"], "marked");
    }

    #[tokio::test]
    async fn test_missing_signal_makes_no_call() {
        let backend = MockBackend::new(200, r#"{"agent_data":"agent"}"#);
        let client = client(backend.clone());
        let mut request = protected_request();
        request.headers_mut().remove("x-sensor-signals");

        let err = client.send(&request).await.unwrap_err();
        assert_eq!(err, GatewayError::Precondition(PreconditionError::MissingSignal));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_user_agent_makes_no_call() {
        let backend = MockBackend::new(200, r#"{"agent_data":"agent"}"#);
        let client = client(backend.clone());
        let mut request = protected_request();
        request.headers_mut().remove("user-agent");

        let err = client.send(&request).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Precondition(PreconditionError::MissingHeader("user-agent"))
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_success_status_is_upstream_error() {
        let backend = MockBackend::new(403, "forbidden");
        let client = client(backend.clone());

        let err = client.send(&protected_request()).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Upstream(UpstreamError::Status {
                status: 403,
                body: "forbidden".to_string()
            })
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_agent_data_is_invalid() {
        let backend = MockBackend::new(200, r#"{"rule_action":null}"#);
        let client = client(backend);
        let err = client.send(&protected_request()).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Upstream(UpstreamError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_browser_cache_strips_prefix_and_cookie() {
        let backend = MockBackend::new(200, "cached");
        let client = client(backend.clone());
        let request = Request::builder()
            .method(Method::GET)
            .uri("/_sensor/assets/v3/loader.js?ver=1")
            .header("cookie", "_zsid=session")
            .header("accept", "*/*")
            .body(Bytes::new())
            .unwrap();

        let response = client.browser_cache(&request).await.unwrap().unwrap();
        assert_eq!(response.body(), &Bytes::from_static(b"cached"));

        let requests = backend.requests.lock().unwrap();
        assert_eq!(
            requests[0].uri(),
            "https://identification.zentinelproxy.io/assets/v3/loader.js?ver=1"
        );
        assert!(!requests[0].headers().contains_key("cookie"));
        assert_eq!(requests[0].headers()["accept"], "*/*");
    }

    #[tokio::test]
    async fn test_browser_cache_skips_body_methods() {
        let backend = MockBackend::new(200, "cached");
        let client = client(backend.clone());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/_sensor/anything")
            .body(Bytes::new())
            .unwrap();

        assert!(client.browser_cache(&request).await.unwrap().is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_client_ip_trusted_proxies() {
        let resolver =
            ClientIpResolver::new("x-forwarded-for", vec!["10.0.0.0/8".parse().unwrap()]).unwrap();

        let mut from_proxy = Request::builder()
            .header("x-forwarded-for", "198.51.100.4")
            .body(())
            .unwrap();
        from_proxy
            .extensions_mut()
            .insert(ClientAddr("10.1.2.3".parse().unwrap()));
        assert_eq!(resolver.resolve(&from_proxy), Some("198.51.100.4".parse().unwrap()));

        let mut direct = Request::builder()
            .header("x-forwarded-for", "198.51.100.4")
            .body(())
            .unwrap();
        direct
            .extensions_mut()
            .insert(ClientAddr("192.0.2.9".parse().unwrap()));
        assert_eq!(resolver.resolve(&direct), Some("192.0.2.9".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_ignores_forwarding_header_without_trusted_proxies() {
        let resolver = ClientIpResolver::new("x-forwarded-for", vec![]).unwrap();

        let mut forged = Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap();
        forged
            .extensions_mut()
            .insert(ClientAddr("198.51.100.99".parse().unwrap()));
        assert_eq!(resolver.resolve(&forged), Some("198.51.100.99".parse().unwrap()));

        let no_peer = Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap();
        assert_eq!(resolver.resolve(&no_peer), None);
    }
}
