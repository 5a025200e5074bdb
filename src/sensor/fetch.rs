//! Fetch patcher.
//!
//! Accepts the three call shapes of `fetch` (string, URL object, request
//! object), normalizes them for the injection step, and rebuilds the
//! arguments with copied headers so caller-owned objects are never mutated.

use super::context::{PatcherRequest, SensorContext};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Uri};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Request credentials mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

/// Request mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
    #[default]
    Cors,
    NoCors,
    SameOrigin,
    Navigate,
}

/// A request object. Credentials mode is fixed once constructed.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    url: String,
    method: String,
    headers: HeaderMap,
    credentials: CredentialsMode,
    mode: RequestMode,
    body: Option<Bytes>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HeaderMap::new(),
            credentials: CredentialsMode::default(),
            mode: RequestMode::default(),
            body: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// A new request built from this one, as `new Request(original, init)`
    /// would, with the given headers and credentials mode.
    pub fn derive(&self, headers: HeaderMap, credentials: CredentialsMode) -> Self {
        Self {
            url: self.url.clone(),
            method: self.method.clone(),
            headers,
            credentials,
            mode: self.mode,
            body: self.body.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn credentials(&self) -> CredentialsMode {
        self.credentials
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

/// The second `fetch` argument. Set fields override the request object.
#[derive(Debug, Clone, Default)]
pub struct FetchInit {
    pub method: Option<String>,
    pub headers: Option<HeaderMap>,
    pub credentials: Option<CredentialsMode>,
    pub mode: Option<RequestMode>,
    pub body: Option<Bytes>,
}

/// The first `fetch` argument.
#[derive(Debug, Clone)]
pub enum FetchInput {
    Str(String),
    Url(Uri),
    Request(FetchRequest),
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request aborted")]
    Aborted,
}

/// The `fetch` entry point.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        input: FetchInput,
        init: Option<FetchInit>,
    ) -> Result<FetchResponse, FetchError>;
}

/// Normalized view of one `fetch` call.
struct FetchCall {
    url: String,
    method: String,
    headers: HeaderMap,
    credentials: CredentialsMode,
}

impl PatcherRequest for FetchCall {
    fn url(&self) -> &str {
        &self.url
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = name, "Cannot set signal header on fetch request"),
        }
    }

    fn set_include_credentials(&mut self) -> bool {
        let requested = self.credentials == CredentialsMode::Include;
        self.credentials = CredentialsMode::Include;
        requested
    }
}

/// Decorator around the page's original `fetch`.
pub struct FetchPatcher {
    original: Arc<dyn Fetch>,
    context: Arc<SensorContext>,
}

impl FetchPatcher {
    pub fn new(original: Arc<dyn Fetch>, context: Arc<SensorContext>) -> Self {
        Self { original, context }
    }

    fn normalize(input: &FetchInput, init: Option<&FetchInit>) -> (FetchCall, RequestMode) {
        let init_method = init.and_then(|i| i.method.clone());
        let init_headers = init.and_then(|i| i.headers.clone());
        let init_credentials = init.and_then(|i| i.credentials);
        let init_mode = init.and_then(|i| i.mode);

        let url = match input {
            FetchInput::Str(s) => s.clone(),
            FetchInput::Url(u) => u.to_string(),
            FetchInput::Request(r) => r.url.clone(),
        };

        match input {
            FetchInput::Str(_) | FetchInput::Url(_) => {
                let call = FetchCall {
                    url,
                    method: init_method.unwrap_or_else(|| "GET".to_string()),
                    headers: init_headers.unwrap_or_default(),
                    credentials: init_credentials.unwrap_or_default(),
                };
                (call, init_mode.unwrap_or_default())
            }
            FetchInput::Request(request) => {
                let call = FetchCall {
                    url,
                    method: init_method.unwrap_or_else(|| request.method.clone()),
                    headers: init_headers.unwrap_or_else(|| request.headers.clone()),
                    credentials: init_credentials.unwrap_or(request.credentials),
                };
                (call, init_mode.unwrap_or(request.mode))
            }
        }
    }

    /// Rebuild the call with the injected headers and forced credentials,
    /// keeping the caller's argument shape.
    fn rebuild(
        input: FetchInput,
        init: Option<FetchInit>,
        call: FetchCall,
    ) -> (FetchInput, Option<FetchInit>) {
        match input {
            FetchInput::Request(request) => {
                let init_sets_headers = init.as_ref().is_some_and(|i| i.headers.is_some());
                let init_sets_credentials = init.as_ref().is_some_and(|i| i.credentials.is_some());

                let headers = if init_sets_headers {
                    request.headers.clone()
                } else {
                    call.headers.clone()
                };
                let credentials = if init_sets_credentials {
                    request.credentials
                } else {
                    call.credentials
                };
                let derived = request.derive(headers, credentials);

                let init = init.map(|mut init| {
                    if init_sets_headers {
                        init.headers = Some(call.headers);
                    }
                    if init_sets_credentials {
                        init.credentials = Some(call.credentials);
                    }
                    init
                });
                (FetchInput::Request(derived), init)
            }
            input => {
                let mut init = init.unwrap_or_default();
                init.headers = Some(call.headers);
                init.credentials = Some(call.credentials);
                (input, Some(init))
            }
        }
    }
}

#[async_trait]
impl Fetch for FetchPatcher {
    async fn fetch(
        &self,
        input: FetchInput,
        init: Option<FetchInit>,
    ) -> Result<FetchResponse, FetchError> {
        let (mut call, mode) = Self::normalize(&input, init.as_ref());

        // Custom headers are not allowed in no-cors mode.
        if mode == RequestMode::NoCors {
            return self.original.fetch(input, init).await;
        }

        if !self.context.prepare(&mut call).await {
            return self.original.fetch(input, init).await;
        }

        let (input, init) = Self::rebuild(input, init, call);
        let response = self.original.fetch(input, init).await?;

        let agent_data = response
            .headers
            .get(self.context.agent_data_header())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(agent_data) = agent_data {
            self.context.process_agent_data(&agent_data).await;
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;
    use crate::routes::{HttpMethod, ProtectedRoute};
    use crate::sensor::context::{AgentDataProcessor, SignalsProvider};
    use crate::sensor::CREDENTIALS_SENTINEL;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingFetch {
        calls: Mutex<Vec<(FetchInput, Option<FetchInit>)>>,
    }

    #[async_trait]
    impl Fetch for RecordingFetch {
        async fn fetch(
            &self,
            input: FetchInput,
            init: Option<FetchInit>,
        ) -> Result<FetchResponse, FetchError> {
            self.calls.lock().unwrap().push((input, init));
            let mut headers = HeaderMap::new();
            headers.insert("x-sensor-agent-data", "agent-1".parse().unwrap());
            Ok(FetchResponse {
                status: 200,
                headers,
                body: Bytes::new(),
            })
        }
    }

    struct StaticProvider;

    #[async_trait]
    impl SignalsProvider for StaticProvider {
        async fn collect(&self) -> Result<Option<String>, SensorError> {
            Ok(Some("sig".to_string()))
        }
    }

    #[derive(Default)]
    struct Sink {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentDataProcessor for Sink {
        async fn process(&self, agent_data: &str) -> Result<(), SensorError> {
            self.seen.lock().unwrap().push(agent_data.to_string());
            Ok(())
        }
    }

    fn setup() -> (FetchPatcher, Arc<RecordingFetch>, Arc<Sink>) {
        let context = Arc::new(
            SensorContext::new(
                "https://shop.example.com/",
                &[ProtectedRoute::new(HttpMethod::Post, "/api/*")],
                "x-sensor-signals",
                "x-sensor-agent-data",
            )
            .unwrap(),
        );
        context.set_signals_provider(Arc::new(StaticProvider));
        let sink = Arc::new(Sink::default());
        context.set_agent_data_processor(sink.clone());
        let original = Arc::new(RecordingFetch::default());
        (FetchPatcher::new(original.clone(), context), original, sink)
    }

    fn post_init() -> FetchInit {
        FetchInit {
            method: Some("POST".to_string()),
            ..FetchInit::default()
        }
    }

    #[tokio::test]
    async fn test_string_input_gets_signal_and_credentials() {
        let (patcher, original, sink) = setup();
        patcher
            .fetch(FetchInput::Str("/api/login".to_string()), Some(post_init()))
            .await
            .unwrap();

        let calls = original.calls.lock().unwrap();
        let (input, init) = &calls[0];
        assert!(matches!(input, FetchInput::Str(s) if s == "/api/login"));
        let init = init.as_ref().unwrap();
        assert_eq!(init.credentials, Some(CredentialsMode::Include));
        assert_eq!(init.headers.as_ref().unwrap()["x-sensor-signals"], "sig");
        assert_eq!(*sink.seen.lock().unwrap(), vec!["agent-1".to_string()]);
    }

    #[tokio::test]
    async fn test_url_input_is_supported() {
        let (patcher, original, _) = setup();
        let url: Uri = "https://shop.example.com/api/cart".parse().unwrap();
        patcher.fetch(FetchInput::Url(url), Some(post_init())).await.unwrap();

        let calls = original.calls.lock().unwrap();
        assert!(matches!(calls[0].0, FetchInput::Url(_)));
        assert!(calls[0].1.as_ref().unwrap().headers.as_ref().unwrap().contains_key("x-sensor-signals"));
    }

    #[tokio::test]
    async fn test_caller_headers_are_copied_and_overridden_once() {
        let (patcher, original, _) = setup();
        let mut caller_headers = HeaderMap::new();
        caller_headers.insert("x-sensor-signals", "stale".parse().unwrap());
        caller_headers.insert("content-type", "application/json".parse().unwrap());
        let init = FetchInit {
            headers: Some(caller_headers.clone()),
            credentials: Some(CredentialsMode::Include),
            ..post_init()
        };

        patcher
            .fetch(FetchInput::Str("/api/login".to_string()), Some(init))
            .await
            .unwrap();

        assert_eq!(caller_headers["x-sensor-signals"], "stale");
        let calls = original.calls.lock().unwrap();
        let sent = calls[0].1.as_ref().unwrap().headers.as_ref().unwrap();
        let values: Vec<_> = sent.get_all("x-sensor-signals").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], format!("{}sig", CREDENTIALS_SENTINEL).as_str());
    }

    #[tokio::test]
    async fn test_request_object_is_rebuilt() {
        let (patcher, original, _) = setup();
        let request = FetchRequest::new("https://shop.example.com/api/order")
            .with_method("POST")
            .with_body("payload");

        patcher
            .fetch(FetchInput::Request(request.clone()), None)
            .await
            .unwrap();

        assert_eq!(request.credentials(), CredentialsMode::SameOrigin);
        assert!(request.headers().is_empty());

        let calls = original.calls.lock().unwrap();
        match &calls[0] {
            (FetchInput::Request(derived), None) => {
                assert_eq!(derived.credentials(), CredentialsMode::Include);
                assert_eq!(derived.method(), "POST");
                assert_eq!(derived.body(), Some(&Bytes::from_static(b"payload")));
                assert_eq!(derived.headers()["x-sensor-signals"], "sig");
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_cors_passes_through() {
        let (patcher, original, sink) = setup();
        let init = FetchInit {
            mode: Some(RequestMode::NoCors),
            ..post_init()
        };
        patcher
            .fetch(FetchInput::Str("/api/login".to_string()), Some(init))
            .await
            .unwrap();

        let calls = original.calls.lock().unwrap();
        assert!(calls[0].1.as_ref().unwrap().headers.is_none());
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unprotected_call_is_untouched() {
        let (patcher, original, sink) = setup();
        patcher
            .fetch(FetchInput::Str("/api/login".to_string()), None)
            .await
            .unwrap();

        let calls = original.calls.lock().unwrap();
        assert!(calls[0].1.is_none(), "GET is not protected");
        assert!(sink.seen.lock().unwrap().is_empty());
    }
}
