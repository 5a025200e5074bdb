//! Token-based correlation of identification events.
//!
//! A page obtains a token carrying its signal, protected calls present the
//! token so the backend request id can be recorded against it, and a final
//! correlate call fetches the event, checks it for tampering and tags it.

use crate::config::{CorrelationConfig, IdentificationConfig};
use crate::error::{ConfigError, GatewayError, StoreError, TamperingError, UpstreamError};
use crate::identification::{region_host, API_KEY_HEADER};
use crate::store::{StoredSignals, TokenStore};
use crate::tampering::{CorrelationRequest, IdentificationEvent, TamperingVerifier};
use crate::token::TokenSigner;
use crate::upstream::Upstream;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backend event API.
#[async_trait]
pub trait EventApi: Send + Sync {
    async fn get_event(&self, request_id: &str) -> Result<IdentificationEvent, UpstreamError>;

    async fn update_event_tags(&self, request_id: &str, tags: &Value) -> Result<(), UpstreamError>;
}

/// `EventApi` over HTTP, against the region-resolved host.
pub struct ServerApiClient {
    upstream: Arc<dyn Upstream>,
    host: String,
    secret_api_key: String,
}

impl ServerApiClient {
    pub fn new(config: &IdentificationConfig, upstream: Arc<dyn Upstream>) -> Result<Self, ConfigError> {
        let secret_api_key = config
            .secret_api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::Missing("identification.secret_api_key"))?;
        Ok(Self {
            upstream,
            host: region_host(&config.host, &config.region),
            secret_api_key,
        })
    }

    fn event_url(&self, request_id: &str) -> String {
        format!("https://{}/events/{}", self.host, request_id)
    }

    fn request(&self, method: Method, url: &str, body: Bytes) -> Result<Request<Bytes>, UpstreamError> {
        Request::builder()
            .method(method)
            .uri(url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, &self.secret_api_key)
            .body(body)
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }
}

#[async_trait]
impl EventApi for ServerApiClient {
    async fn get_event(&self, request_id: &str) -> Result<IdentificationEvent, UpstreamError> {
        let request = self.request(Method::GET, &self.event_url(request_id), Bytes::new())?;
        let response = self.upstream.send(request).await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
                body: String::from_utf8_lossy(response.body()).into_owned(),
            });
        }
        serde_json::from_slice(response.body())
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
    }

    async fn update_event_tags(&self, request_id: &str, tags: &Value) -> Result<(), UpstreamError> {
        let body = serde_json::to_vec(&json!({ "tags": tags }))
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let request = self.request(Method::PUT, &self.event_url(request_id), Bytes::from(body))?;
        let response = self.upstream.send(request).await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
                body: String::from_utf8_lossy(response.body()).into_owned(),
            });
        }
        Ok(())
    }
}

pub struct CorrelationService {
    signer: TokenSigner,
    store: Arc<dyn TokenStore>,
    events: Arc<dyn EventApi>,
    verifier: TamperingVerifier,
    tags: Value,
    retry_delay: Duration,
}

impl CorrelationService {
    pub fn new(
        config: &CorrelationConfig,
        store: Arc<dyn TokenStore>,
        events: Arc<dyn EventApi>,
        verifier: TamperingVerifier,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            signer: TokenSigner::new(&config.token_secret, config.token_validity_seconds)?,
            store,
            events,
            verifier,
            tags: config.event_tags.clone(),
            retry_delay: Duration::from_millis(config.tag_retry_delay_ms),
        })
    }

    /// Issue a token and remember the signal under it.
    pub async fn issue(&self, signals: &str) -> Result<String, GatewayError> {
        let token = self.signer.issue();
        self.store.store(&token, StoredSignals::new(signals)).await?;
        debug!("Issued correlation token");
        Ok(token)
    }

    /// Record the backend request id produced for a token's signal.
    pub async fn record_request_id(&self, token: &str, request_id: &str) -> Result<(), GatewayError> {
        self.signer.verify(token)?;
        let mut entry = self
            .store
            .get(token)
            .await?
            .ok_or(TamperingError::InvalidToken)?;
        entry.request_id = Some(request_id.to_string());
        self.store.store(token, entry).await?;
        Ok(())
    }

    /// Verify the token, check the event for tampering and tag it.
    ///
    /// The token is consumed whether or not the tampering checks pass.
    pub async fn correlate(
        &self,
        token: &str,
        request: &CorrelationRequest,
    ) -> Result<IdentificationEvent, GatewayError> {
        self.signer.verify(token)?;
        let entry = self
            .store
            .get(token)
            .await?
            .ok_or(TamperingError::InvalidToken)?;
        let Some(request_id) = entry.request_id else {
            return Err(TamperingError::UnknownEvent.into());
        };

        let event = self.events.get_event(&request_id).await?;
        let verdict = self.verifier.verify(&event, request, Utc::now());
        self.store.delete(token).await?;
        if let Err(e) = verdict {
            warn!(request_id = %request_id, error = %e, "Correlation rejected");
            return Err(e.into());
        }

        self.tag_event(&request_id).await;
        info!(request_id = %request_id, "Correlated identification event");
        Ok(event)
    }

    /// One retry after a fixed delay on 409, then give up.
    async fn tag_event(&self, request_id: &str) {
        let first = self.events.update_event_tags(request_id, &self.tags).await;
        let Err(e) = first else {
            return;
        };
        if e.status() != Some(StatusCode::CONFLICT.as_u16()) {
            warn!(request_id, error = %e, "Tagging event failed");
            return;
        }

        debug!(request_id, delay_ms = self.retry_delay.as_millis() as u64, "Event not ready, retrying tag update");
        tokio::time::sleep(self.retry_delay).await;
        if let Err(e) = self.events.update_event_tags(request_id, &self.tags).await {
            warn!(request_id, error = %e, "Tagging event failed after retry");
        }
    }

    /// Tokens currently held by the store.
    pub async fn pending(&self) -> Result<Vec<(String, StoredSignals)>, StoreError> {
        self.store.list_all().await
    }
}
