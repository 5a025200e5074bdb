//! Shared sensor state.
//!
//! Holds the protected-route table and the two hooks registered by the
//! fingerprinting library: the signal provider and the agent-data processor.
//! Both hooks are write-once; a second registration is ignored with a
//! warning.

use super::CREDENTIALS_SENTINEL;
use crate::error::{ConfigError, SensorError};
use crate::routes::{resolve_url, HttpMethod, ProtectedApis, ProtectedRoute};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Produces signals. Expected to memoize expensive collection itself.
#[async_trait]
pub trait SignalsProvider: Send + Sync {
    async fn collect(&self) -> Result<Option<String>, SensorError>;
}

/// Consumes agent data returned on protected responses.
#[async_trait]
pub trait AgentDataProcessor: Send + Sync {
    async fn process(&self, agent_data: &str) -> Result<(), SensorError>;
}

/// Provider wrapper that keeps the first non-empty signal and never caches
/// failures or empty results.
pub struct MemoizedSignalsProvider<P> {
    inner: P,
    cached: OnceCell<String>,
}

impl<P: SignalsProvider> MemoizedSignalsProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: OnceCell::new(),
        }
    }
}

#[async_trait]
impl<P: SignalsProvider> SignalsProvider for MemoizedSignalsProvider<P> {
    async fn collect(&self) -> Result<Option<String>, SensorError> {
        if let Some(signal) = self.cached.get() {
            return Ok(Some(signal.clone()));
        }
        match self.inner.collect().await? {
            Some(signal) if !signal.is_empty() => {
                let _ = self.cached.set(signal.clone());
                Ok(Some(signal))
            }
            _ => Ok(None),
        }
    }
}

/// Settings the gateway injects into identification pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSettings {
    pub protected_apis: Vec<ProtectedRoute>,
    pub signals_header: String,
    pub agent_data_header: String,
}

/// A pending outgoing request, as seen by the injection step.
pub trait PatcherRequest: Send {
    fn url(&self) -> &str;

    fn method(&self) -> &str;

    fn set_header(&mut self, name: &str, value: &str);

    /// Force credentials on. Returns whether the caller had already asked
    /// for them.
    fn set_include_credentials(&mut self) -> bool;
}

/// Page-lifetime sensor state.
pub struct SensorContext {
    page_url: String,
    protected: ProtectedApis,
    signals_header: String,
    agent_data_header: String,
    signals_provider: OnceLock<Arc<dyn SignalsProvider>>,
    agent_data_processor: OnceLock<Arc<dyn AgentDataProcessor>>,
}

impl SensorContext {
    pub fn new(
        page_url: impl Into<String>,
        routes: &[ProtectedRoute],
        signals_header: impl Into<String>,
        agent_data_header: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            page_url: page_url.into(),
            protected: ProtectedApis::new(routes)?,
            signals_header: signals_header.into(),
            agent_data_header: agent_data_header.into(),
            signals_provider: OnceLock::new(),
            agent_data_processor: OnceLock::new(),
        })
    }

    pub fn from_settings(
        page_url: impl Into<String>,
        settings: &SensorSettings,
    ) -> Result<Self, ConfigError> {
        Self::new(
            page_url,
            &settings.protected_apis,
            settings.signals_header.clone(),
            settings.agent_data_header.clone(),
        )
    }

    pub fn page_url(&self) -> &str {
        &self.page_url
    }

    pub fn signals_header(&self) -> &str {
        &self.signals_header
    }

    pub fn agent_data_header(&self) -> &str {
        &self.agent_data_header
    }

    /// Register the signal provider. Returns false if one was already set.
    pub fn set_signals_provider(&self, provider: Arc<dyn SignalsProvider>) -> bool {
        let accepted = self.signals_provider.set(provider).is_ok();
        if !accepted {
            warn!("Signals provider is already registered, ignoring");
        }
        accepted
    }

    /// Register the agent-data processor. Returns false if one was already set.
    pub fn set_agent_data_processor(&self, processor: Arc<dyn AgentDataProcessor>) -> bool {
        let accepted = self.agent_data_processor.set(processor).is_ok();
        if !accepted {
            warn!("Agent data processor is already registered, ignoring");
        }
        accepted
    }

    /// Whether a request to `url` with `method` must carry a signal.
    /// Relative URLs are resolved against the page URL.
    pub fn is_protected(&self, url: &str, method: &str) -> bool {
        let method = match method.parse::<HttpMethod>() {
            Ok(method) => method,
            Err(_) => return false,
        };
        if !self.protected.has_method(method) {
            return false;
        }
        let absolute = resolve_url(&self.page_url, url);
        self.protected.matches(&absolute, method)
    }

    /// Ask the provider for a signal. Errors are logged and swallowed.
    pub async fn collect_signals(&self) -> Option<String> {
        let provider = self.signals_provider.get()?;
        match provider.collect().await {
            Ok(Some(signal)) if !signal.is_empty() => Some(signal),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Signal collection failed, sending request without signal");
                None
            }
        }
    }

    /// Hand agent data to the processor. Errors are logged and swallowed.
    pub async fn process_agent_data(&self, agent_data: &str) {
        let Some(processor) = self.agent_data_processor.get() else {
            return;
        };
        if let Err(e) = processor.process(agent_data).await {
            warn!(error = %e, "Agent data processing failed");
        }
    }

    /// Force credentials and set the signal header, marking the signal when
    /// the caller had already requested credentials.
    pub fn inject(&self, request: &mut dyn PatcherRequest, signal: &str) {
        let caller_requested = request.set_include_credentials();
        let value = if caller_requested {
            format!("{}{}", CREDENTIALS_SENTINEL, signal)
        } else {
            signal.to_string()
        };
        request.set_header(&self.signals_header, &value);
    }

    /// Classify, collect and inject. Returns true if a signal was injected.
    pub async fn prepare(&self, request: &mut dyn PatcherRequest) -> bool {
        if !self.is_protected(request.url(), request.method()) {
            return false;
        }
        let Some(signal) = self.collect_signals().await else {
            return false;
        };
        debug!(url = request.url(), method = request.method(), "Injecting signal");
        self.inject(request, &signal);
        true
    }
}
