//! Request-object (XHR-style) patcher.
//!
//! Signal collection starts at `open` for asynchronous protected requests and
//! is awaited at `send`, so the header is in place before the request leaves.
//! Per-instance state lives in a side table keyed by instance id and is reset
//! on every `open`.

use super::context::{PatcherRequest, SensorContext};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::HeaderMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identity of one request object.
pub type XhrId = u64;

#[derive(Debug, Clone)]
pub struct XhrResponse {
    pub status: u16,
    pub headers: HeaderMap,
}

/// How a send ended.
#[derive(Debug, Clone)]
pub enum XhrOutcome {
    Load(XhrResponse),
    Abort,
    Error(String),
}

/// The request-object methods the sensor patches.
#[async_trait]
pub trait XhrTransport: Send + Sync {
    fn open(&self, id: XhrId, method: &str, url: &str, is_async: bool);

    /// Set a request header, replacing any value under the same name.
    fn set_request_header(&self, id: XhrId, name: &str, value: &str);

    fn with_credentials(&self, id: XhrId) -> bool;

    fn set_with_credentials(&self, id: XhrId, value: bool);

    async fn send(&self, id: XhrId, body: Option<Bytes>) -> XhrOutcome;
}

#[derive(Default)]
struct XhrState {
    method: String,
    url: String,
    signals: Option<JoinHandle<Option<String>>>,
    injected: bool,
    /// `with_credentials` before the last send forced it on.
    forced_from: Option<bool>,
    /// `with_credentials` set by the caller after the last send.
    caller_override: Option<bool>,
}

struct XhrCall<'a> {
    transport: &'a dyn XhrTransport,
    id: XhrId,
    method: String,
    url: String,
    credentials_before: Option<bool>,
}

impl PatcherRequest for XhrCall<'_> {
    fn url(&self) -> &str {
        &self.url
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.transport.set_request_header(self.id, name, value);
    }

    fn set_include_credentials(&mut self) -> bool {
        let before = self.transport.with_credentials(self.id);
        self.transport.set_with_credentials(self.id, true);
        self.credentials_before = Some(before);
        before
    }
}

/// Decorator around the page's original request-object methods.
pub struct XhrPatcher {
    original: Arc<dyn XhrTransport>,
    context: Arc<SensorContext>,
    states: DashMap<XhrId, XhrState>,
}

impl XhrPatcher {
    pub fn new(original: Arc<dyn XhrTransport>, context: Arc<SensorContext>) -> Self {
        Self {
            original,
            context,
            states: DashMap::new(),
        }
    }

    /// Drop the state of an instance that went away.
    pub fn release(&self, id: XhrId) {
        if let Some((_, state)) = self.states.remove(&id) {
            if let Some(handle) = state.signals {
                handle.abort();
            }
        }
    }

    fn start_collection(&self) -> Option<JoinHandle<Option<String>>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime available, request will not carry a signal");
                return None;
            }
        };
        let context = self.context.clone();
        Some(runtime.spawn(async move { context.collect_signals().await }))
    }
}

#[async_trait]
impl XhrTransport for XhrPatcher {
    fn open(&self, id: XhrId, method: &str, url: &str, is_async: bool) {
        if let Some((_, previous)) = self.states.remove(&id) {
            if let Some(handle) = previous.signals {
                handle.abort();
            }
            if let Some(before) = previous.forced_from {
                self.original
                    .set_with_credentials(id, previous.caller_override.unwrap_or(before));
            }
        }

        self.original.open(id, method, url, is_async);

        let mut state = XhrState {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            ..XhrState::default()
        };
        // Synchronous requests are never patched.
        if is_async && self.context.is_protected(url, method) {
            state.signals = self.start_collection();
        }
        self.states.insert(id, state);
    }

    fn set_request_header(&self, id: XhrId, name: &str, value: &str) {
        self.original.set_request_header(id, name, value);
    }

    fn with_credentials(&self, id: XhrId) -> bool {
        self.original.with_credentials(id)
    }

    fn set_with_credentials(&self, id: XhrId, value: bool) {
        if let Some(mut state) = self.states.get_mut(&id) {
            if state.forced_from.is_some() {
                state.caller_override = Some(value);
            }
        }
        self.original.set_with_credentials(id, value);
    }

    async fn send(&self, id: XhrId, body: Option<Bytes>) -> XhrOutcome {
        let pending = self.states.get_mut(&id).and_then(|mut state| {
            let handle = state.signals.take()?;
            Some((handle, state.method.clone(), state.url.clone()))
        });

        if let Some((handle, method, url)) = pending {
            let signal = match handle.await {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "Signal collection task failed");
                    None
                }
            };

            if let Some(signal) = signal {
                let mut call = XhrCall {
                    transport: self.original.as_ref(),
                    id,
                    method,
                    url,
                    credentials_before: None,
                };
                debug!(url = %call.url, method = %call.method, "Injecting signal");
                self.context.inject(&mut call, &signal);
                if let Some(mut state) = self.states.get_mut(&id) {
                    state.injected = true;
                    state.forced_from = call.credentials_before;
                    state.caller_override = None;
                }
            }
        }

        let outcome = self.original.send(id, body).await;

        let injected = self.states.get(&id).is_some_and(|state| state.injected);
        if let XhrOutcome::Load(response) = &outcome {
            if injected {
                let agent_data = response
                    .headers
                    .get(self.context.agent_data_header())
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                if let Some(agent_data) = agent_data {
                    self.context.process_agent_data(&agent_data).await;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;
    use crate::routes::{HttpMethod, ProtectedRoute};
    use crate::sensor::context::{AgentDataProcessor, SignalsProvider};
    use crate::sensor::CREDENTIALS_SENTINEL;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeXhr {
        headers: Mutex<HashMap<XhrId, HashMap<String, String>>>,
        sent_headers: Mutex<Vec<HashMap<String, String>>>,
        credentials: Mutex<HashMap<XhrId, bool>>,
        abort_next: Mutex<bool>,
    }

    #[async_trait]
    impl XhrTransport for FakeXhr {
        fn open(&self, id: XhrId, _method: &str, _url: &str, _is_async: bool) {
            self.headers.lock().unwrap().insert(id, HashMap::new());
        }

        fn set_request_header(&self, id: XhrId, name: &str, value: &str) {
            self.headers
                .lock()
                .unwrap()
                .entry(id)
                .or_default()
                .insert(name.to_ascii_lowercase(), value.to_string());
        }

        fn with_credentials(&self, id: XhrId) -> bool {
            self.credentials.lock().unwrap().get(&id).copied().unwrap_or(false)
        }

        fn set_with_credentials(&self, id: XhrId, value: bool) {
            self.credentials.lock().unwrap().insert(id, value);
        }

        async fn send(&self, id: XhrId, _body: Option<Bytes>) -> XhrOutcome {
            let headers = self.headers.lock().unwrap().get(&id).cloned().unwrap_or_default();
            self.sent_headers.lock().unwrap().push(headers);
            if std::mem::take(&mut *self.abort_next.lock().unwrap()) {
                return XhrOutcome::Abort;
            }
            let mut headers = HeaderMap::new();
            headers.insert("x-sensor-agent-data", "agent".parse().unwrap());
            XhrOutcome::Load(XhrResponse {
                status: 200,
                headers,
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

    struct FailingProvider;

    #[async_trait]
    impl SignalsProvider for FailingProvider {
        async fn collect(&self) -> Result<Option<String>, SensorError> {
            Err(SensorError::Collection("boom".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentDataProcessor for CountingSink {
        async fn process(&self, _agent_data: &str) -> Result<(), SensorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(provider: Arc<dyn SignalsProvider>) -> (XhrPatcher, Arc<FakeXhr>, Arc<CountingSink>) {
        let context = Arc::new(
            SensorContext::new(
                "https://shop.example.com/",
                &[ProtectedRoute::new(HttpMethod::Post, "/api/*")],
                "x-sensor-signals",
                "x-sensor-agent-data",
            )
            .unwrap(),
        );
        context.set_signals_provider(provider);
        let sink = Arc::new(CountingSink::default());
        context.set_agent_data_processor(sink.clone());
        let fake = Arc::new(FakeXhr::default());
        (XhrPatcher::new(fake.clone(), context), fake, sink)
    }

    #[tokio::test]
    async fn test_reused_instance_injects_each_time() {
        let (patcher, fake, sink) = setup(Arc::new(StaticProvider));

        for _ in 0..2 {
            patcher.open(1, "POST", "/api/login", true);
            let outcome = patcher.send(1, None).await;
            assert!(matches!(outcome, XhrOutcome::Load(_)));
        }

        let sent = fake.sent_headers.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["x-sensor-signals"], "sig");
        assert_eq!(sent[1]["x-sensor-signals"], "sig");
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sync_request_is_not_patched() {
        let (patcher, fake, sink) = setup(Arc::new(StaticProvider));
        patcher.open(1, "POST", "/api/login", false);
        patcher.send(1, None).await;

        assert!(!fake.sent_headers.lock().unwrap()[0].contains_key("x-sensor-signals"));
        assert!(!fake.with_credentials(1));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_aborted_request_never_extracts() {
        let (patcher, fake, sink) = setup(Arc::new(StaticProvider));
        *fake.abort_next.lock().unwrap() = true;
        patcher.open(1, "POST", "/api/login", true);
        let outcome = patcher.send(1, None).await;

        assert!(matches!(outcome, XhrOutcome::Abort));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_sends_unmodified() {
        let (patcher, fake, sink) = setup(Arc::new(FailingProvider));
        patcher.open(1, "POST", "/api/login", true);
        patcher.send(1, None).await;

        assert!(fake.sent_headers.lock().unwrap()[0].is_empty());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reopen_restores_credentials() {
        let (patcher, fake, _) = setup(Arc::new(StaticProvider));

        patcher.open(1, "POST", "/api/login", true);
        patcher.send(1, None).await;
        assert!(fake.with_credentials(1), "forced on send");

        patcher.open(1, "GET", "/static/app.json", true);
        assert!(!fake.with_credentials(1), "restored on re-open");
    }

    #[tokio::test]
    async fn test_reopen_honors_caller_credentials_after_response() {
        let (patcher, fake, _) = setup(Arc::new(StaticProvider));

        patcher.open(1, "POST", "/api/login", true);
        patcher.send(1, None).await;
        patcher.set_with_credentials(1, true);

        patcher.open(1, "POST", "/api/login", true);
        assert!(fake.with_credentials(1));
        patcher.send(1, None).await;

        let sent = fake.sent_headers.lock().unwrap();
        assert_eq!(sent[1]["x-sensor-signals"], format!("{}sig", CREDENTIALS_SENTINEL));
    }

    #[tokio::test]
    async fn test_unprotected_request_is_untouched() {
        let (patcher, fake, sink) = setup(Arc::new(StaticProvider));
        patcher.open(7, "POST", "/other", true);
        patcher.send(7, None).await;
        patcher.release(7);

        assert!(fake.sent_headers.lock().unwrap()[0].is_empty());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }
}
