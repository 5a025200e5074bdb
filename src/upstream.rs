//! HTTP transport to the origin and to the identification backend.

use crate::error::{ConfigError, UpstreamError};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, Request, Response, Uri};
use std::net::IpAddr;
use tracing::debug;

/// Peer address of the inbound connection, stored as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub IpAddr);

/// Something that can answer a fully buffered HTTP request.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, UpstreamError>;
}

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream backed by a `reqwest` client.
///
/// With a base URL, the request's path and query are grafted onto it (origin
/// forwarding). Without one, request URIs must already be absolute.
pub struct HttpUpstream {
    name: String,
    client: reqwest::Client,
    base: Option<Uri>,
}

impl HttpUpstream {
    pub fn new(name: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            client,
            base: None,
        }
    }

    pub fn with_base(
        name: impl Into<String>,
        client: reqwest::Client,
        base: &str,
    ) -> Result<Self, ConfigError> {
        let base: Uri = base.parse().map_err(|e: http::uri::InvalidUri| {
            ConfigError::InvalidValue {
                field: "server.origin_url",
                reason: e.to_string(),
            }
        })?;
        if base.scheme().is_none() || base.authority().is_none() {
            return Err(ConfigError::InvalidValue {
                field: "server.origin_url",
                reason: "must be an absolute URL".to_string(),
            });
        }
        Ok(Self {
            name: name.into(),
            client,
            base: Some(base),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn target_uri(&self, uri: &Uri) -> Result<String, UpstreamError> {
        match &self.base {
            Some(base) => {
                let scheme = base.scheme_str().unwrap_or("https");
                let authority = base.authority().map(|a| a.as_str()).unwrap_or_default();
                let prefix = base.path().trim_end_matches('/');
                let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
                Ok(format!("{}://{}{}{}", scheme, authority, prefix, path_and_query))
            }
            None if uri.scheme().is_some() && uri.authority().is_some() => Ok(uri.to_string()),
            None => Err(UpstreamError::Transport(format!(
                "relative URI `{}` sent to upstream `{}` without a base",
                uri, self.name
            ))),
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(HeaderName::from_static(name));
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, UpstreamError> {
        let (parts, body) = request.into_parts();
        let target = self.target_uri(&parts.uri)?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(http::header::CONTENT_LENGTH);

        debug!(upstream = %self.name, method = %parts.method, target = %target, "Forwarding request");

        let response = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let mut out = Response::new(body);
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_uri_with_base() {
        let upstream =
            HttpUpstream::with_base("origin", reqwest::Client::new(), "http://127.0.0.1:9000/app/")
                .unwrap();
        let uri: Uri = "/api/login?x=1".parse().unwrap();
        assert_eq!(
            upstream.target_uri(&uri).unwrap(),
            "http://127.0.0.1:9000/app/api/login?x=1"
        );
    }

    #[test]
    fn test_target_uri_requires_absolute_without_base() {
        let upstream = HttpUpstream::new("identification", reqwest::Client::new());
        let relative: Uri = "/identify".parse().unwrap();
        assert!(upstream.target_uri(&relative).is_err());

        let absolute: Uri = "https://api.example.com/identify".parse().unwrap();
        assert_eq!(
            upstream.target_uri(&absolute).unwrap(),
            "https://api.example.com/identify"
        );
    }

    #[test]
    fn test_with_base_rejects_relative() {
        assert!(HttpUpstream::with_base("origin", reqwest::Client::new(), "/just/a/path").is_err());
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-keep", "1".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-keep"));
    }
}
