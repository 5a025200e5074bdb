//! Sensor script serving.
//!
//! `sensor.js` is served from the bundled script (or a configured file) and
//! `loader.js` is proxied from the agent loader URL. Both responses have
//! their `max-age` and `s-maxage` capped.

use crate::config::ScriptsConfig;
use crate::error::{ConfigError, GatewayError, UpstreamError};
use crate::upstream::Upstream;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, SET_COOKIE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

const BUNDLED_SENSOR: &str = include_str!("../assets/sensor.js");

const JAVASCRIPT: &str = "application/javascript; charset=utf-8";

/// Ceilings applied to script cache lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCaps {
    pub max_age: u64,
    pub s_maxage: u64,
}

/// Cap `max-age` and `s-maxage` of an upstream `Cache-Control` value.
///
/// Each directive becomes `min(upstream, cap)`; a missing or unparsable one
/// takes the cap. Other directives are kept in order.
pub fn cap_cache_control(origin: Option<&str>, caps: CacheCaps) -> String {
    let mut directives = Vec::new();
    let mut max_age = None;
    let mut s_maxage = None;

    for directive in origin.unwrap_or_default().split(',') {
        let directive = directive.trim();
        if directive.is_empty() {
            continue;
        }
        let (name, value) = match directive.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
            None => (directive, None),
        };
        if name.eq_ignore_ascii_case("max-age") {
            max_age = value.and_then(|v| v.parse::<u64>().ok());
        } else if name.eq_ignore_ascii_case("s-maxage") {
            s_maxage = value.and_then(|v| v.parse::<u64>().ok());
        } else {
            directives.push(directive.to_string());
        }
    }

    directives.push(format!(
        "max-age={}",
        max_age.map_or(caps.max_age, |v| v.min(caps.max_age))
    ));
    directives.push(format!(
        "s-maxage={}",
        s_maxage.map_or(caps.s_maxage, |v| v.min(caps.s_maxage))
    ));
    directives.join(", ")
}

pub struct SensorScripts {
    sensor: Bytes,
    loader_url: Option<String>,
    default_cache_control: String,
    caps: CacheCaps,
    upstream: Arc<dyn Upstream>,
}

impl SensorScripts {
    pub fn new(config: &ScriptsConfig, upstream: Arc<dyn Upstream>) -> Result<Self, ConfigError> {
        let sensor = match &config.sensor_script_path {
            Some(path) => Bytes::from(std::fs::read(path).map_err(|e| ConfigError::InvalidValue {
                field: "scripts.sensor_script_path",
                reason: format!("{}: {}", path.display(), e),
            })?),
            None => Bytes::from_static(BUNDLED_SENSOR.as_bytes()),
        };
        Ok(Self {
            sensor,
            loader_url: config.agent_loader_url.clone().filter(|u| !u.is_empty()),
            default_cache_control: config.default_cache_control.clone(),
            caps: CacheCaps {
                max_age: config.max_age_cap,
                s_maxage: config.s_maxage_cap,
            },
            upstream,
        })
    }

    pub fn has_loader(&self) -> bool {
        self.loader_url.is_some()
    }

    /// The sensor script response.
    pub fn sensor_script(&self) -> Response<Bytes> {
        let mut response = Response::new(self.sensor.clone());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JAVASCRIPT));
        let cache_control = cap_cache_control(Some(&self.default_cache_control), self.caps);
        if let Ok(value) = HeaderValue::from_str(&cache_control) {
            headers.insert(CACHE_CONTROL, value);
        }
        response
    }

    /// Proxy the agent loader, forwarding the request's query string.
    pub async fn agent_loader(&self, request: &Request<Bytes>) -> Result<Response<Bytes>, GatewayError> {
        let base = self
            .loader_url
            .as_deref()
            .ok_or(ConfigError::Missing("scripts.agent_loader_url"))?;
        let target = match request.uri().query() {
            Some(query) if base.contains('?') => format!("{}&{}", base, query),
            Some(query) => format!("{}?{}", base, query),
            None => base.to_string(),
        };

        let outbound = Request::builder()
            .method(Method::GET)
            .uri(&target)
            .body(Bytes::new())
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        debug!(target = %target, "Fetching agent loader");
        let mut response = self.upstream.send(outbound).await?;
        if response.status() != StatusCode::OK {
            warn!(status = response.status().as_u16(), "Agent loader returned non-200");
        }

        let headers = response.headers_mut();
        headers.remove(SET_COOKIE);
        let upstream_cache = headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let capped = cap_cache_control(upstream_cache.as_deref(), self.caps);
        if let Ok(value) = HeaderValue::from_str(&capped) {
            headers.insert(CACHE_CONTROL, value);
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(JAVASCRIPT));
        }
        Ok(response)
    }
}
