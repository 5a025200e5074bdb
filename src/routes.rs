//! Route classification shared by the gateway and the sensor.
//!
//! Patterns look like `/api/login`, `/api/*`, `https://*.example.com/v1/*`
//! or `example.com/checkout`. A pattern may contain a single `*` in its path,
//! which consumes the rest of the segment and anything after it. Query
//! strings and fragments never take part in matching.
//!
//! URLs are parsed with [`url::Url`] before matching, so dot segments are
//! resolved and repeated slashes collapsed. A route matches the path the
//! origin will actually serve.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use url::Url;

/// HTTP methods the gateway knows how to protect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Returns true if requests with this method carry a body.
    pub fn is_body_carrying(&self) -> bool {
        matches!(
            self,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete
        )
    }
}

impl FromStr for HttpMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(ConfigError::InvalidValue {
                field: "method",
                reason: format!("unsupported HTTP method `{}`", other),
            }),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HttpMethod> for String {
    fn from(method: HttpMethod) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protected API route: a method and a URL pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRoute {
    pub method: HttpMethod,
    pub url: String,
}

impl ProtectedRoute {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    /// Host with an optional port; without one any port matches.
    Exact { host: String, port: Option<u16> },
    /// Stored with its leading dot, e.g. `.example.com`.
    Suffix(String),
}

/// A compiled URL pattern.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    raw: String,
    scheme: Option<String>,
    host: HostPattern,
    path_prefix: String,
    path_suffix: Option<String>,
}

impl UrlPattern {
    /// Compile a pattern.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = strip_query_and_fragment(pattern.trim());
        if trimmed.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some(("*", rest)) => (None, rest),
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, trimmed),
        };

        let (host, path) = if rest.starts_with('/') {
            (HostPattern::Any, rest)
        } else {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            let authority = authority.to_ascii_lowercase();
            let host = if authority == "*" {
                HostPattern::Any
            } else if let Some(suffix) = authority.strip_prefix('*') {
                if !suffix.starts_with('.') || suffix.contains('*') {
                    return Err(invalid("host wildcard must be a leading `*.` segment"));
                }
                HostPattern::Suffix(suffix.to_string())
            } else if authority.contains('*') {
                return Err(invalid("host wildcard must be a leading `*.` segment"));
            } else if authority.is_empty() {
                return Err(invalid("host is empty"));
            } else {
                exact_host(&authority).ok_or_else(|| invalid("host has an invalid port"))?
            };
            (host, path)
        };

        let (path_prefix, path_suffix) = match path.split_once('*') {
            Some((_, after)) if after.contains('*') => {
                return Err(invalid("only one path wildcard is supported"));
            }
            Some((before, after)) => (before.to_string(), Some(after.to_string())),
            None => (path.to_string(), None),
        };

        Ok(Self {
            raw: pattern.to_string(),
            scheme,
            host,
            path_prefix,
            path_suffix,
        })
    }

    /// The pattern as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether a URL matches this pattern.
    pub fn matches(&self, url: &str) -> bool {
        self.matches_target(&Target::parse(url))
    }

    fn matches_target(&self, target: &Target) -> bool {
        if let Some(scheme) = &self.scheme {
            if target.scheme.as_deref() != Some(scheme.as_str()) {
                return false;
            }
        }

        let host_ok = match &self.host {
            HostPattern::Any => true,
            HostPattern::Exact { host, port } => {
                target.host.as_deref() == Some(host.as_str())
                    && port.map_or(true, |p| target.port == Some(p))
            }
            HostPattern::Suffix(suffix) => target
                .host
                .as_deref()
                .is_some_and(|h| h.len() > suffix.len() && h.ends_with(suffix.as_str())),
        };
        if !host_ok {
            return false;
        }

        let path = target.path.as_str();
        match &self.path_suffix {
            None => path == self.path_prefix,
            Some(suffix) => {
                path.len() >= self.path_prefix.len() + suffix.len()
                    && path.starts_with(self.path_prefix.as_str())
                    && path.ends_with(suffix.as_str())
            }
        }
    }
}

fn exact_host(authority: &str) -> Option<HostPattern> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !authority.ends_with(']') => (host, Some(port.parse().ok()?)),
        _ => (authority, None),
    };
    Some(HostPattern::Exact {
        host: host.to_string(),
        port,
    })
}

static RELATIVE_BASE: LazyLock<Url> =
    LazyLock::new(|| Url::parse("http://relative.invalid/").expect("valid url: relative base"));

/// The parts of a URL used for matching, normalized the way the request
/// will reach the origin: dot segments resolved, repeated slashes collapsed,
/// host lowercased, query and fragment dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
}

impl Target {
    fn parse(url: &str) -> Self {
        let url = url.trim();
        if let Ok(parsed) = Url::parse(url) {
            return Self {
                scheme: Some(parsed.scheme().to_string()),
                host: parsed.host_str().map(str::to_ascii_lowercase),
                port: parsed.port_or_known_default(),
                path: collapse_slashes(parsed.path()),
            };
        }

        match RELATIVE_BASE.join(url) {
            // A scheme-relative reference names its own host.
            Ok(joined) if url.starts_with("//") => Self {
                scheme: None,
                host: joined.host_str().map(str::to_ascii_lowercase),
                port: joined.port(),
                path: collapse_slashes(joined.path()),
            },
            Ok(joined) => Self {
                scheme: None,
                host: None,
                port: None,
                path: collapse_slashes(joined.path()),
            },
            Err(_) => Self {
                scheme: None,
                host: None,
                port: None,
                path: collapse_slashes(strip_query_and_fragment(url)),
            },
        }
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    if !out.starts_with('/') {
        out.insert(0, '/');
    }
    out
}

fn strip_query_and_fragment(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Path of `url` as it is matched: dot segments resolved and repeated
/// slashes collapsed.
pub fn normalized_path(url: &str) -> String {
    Target::parse(url).path
}

/// Ordered list of patterns, each carrying metadata. First match wins.
#[derive(Debug, Clone)]
pub struct RouteMatcher<T> {
    routes: Vec<(UrlPattern, T)>,
}

impl<T> Default for RouteMatcher<T> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<T> RouteMatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `(pattern, metadata)` pairs in order.
    pub fn compile<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
    {
        let mut matcher = Self::new();
        for (pattern, meta) in entries {
            matcher.push(UrlPattern::parse(pattern.as_ref())?, meta);
        }
        Ok(matcher)
    }

    pub fn push(&mut self, pattern: UrlPattern, meta: T) {
        self.routes.push((pattern, meta));
    }

    /// Metadata of the first pattern matching `url`.
    pub fn find(&self, url: &str) -> Option<&T> {
        let target = Target::parse(url);
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.matches_target(&target))
            .map(|(_, meta)| meta)
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.find(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Protected API table, grouped by method so a method miss never walks
/// any pattern.
#[derive(Debug, Clone, Default)]
pub struct ProtectedApis {
    by_method: HashMap<HttpMethod, RouteMatcher<()>>,
    routes: Vec<ProtectedRoute>,
}

impl ProtectedApis {
    pub fn new(routes: &[ProtectedRoute]) -> Result<Self, ConfigError> {
        let mut by_method: HashMap<HttpMethod, RouteMatcher<()>> = HashMap::new();
        for route in routes {
            by_method
                .entry(route.method)
                .or_default()
                .push(UrlPattern::parse(&route.url)?, ());
        }
        Ok(Self {
            by_method,
            routes: routes.to_vec(),
        })
    }

    /// Returns true if any route is registered for `method`.
    pub fn has_method(&self, method: HttpMethod) -> bool {
        self.by_method.contains_key(&method)
    }

    /// Check an absolute URL (or bare path) against the table.
    pub fn matches(&self, url: &str, method: HttpMethod) -> bool {
        match self.by_method.get(&method) {
            Some(matcher) => matcher.is_match(url),
            None => false,
        }
    }

    /// Routes in configuration order.
    pub fn routes(&self) -> &[ProtectedRoute] {
        &self.routes
    }
}

/// Classification of an inbound edge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteClassification {
    Identification,
    Protection { method: HttpMethod },
    SensorAsset { name: String },
    None,
}

/// Gateway-side classifier. Sensor assets take precedence over
/// identification pages, which take precedence over protected APIs.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    sensor_prefix: String,
    identification_pages: RouteMatcher<()>,
    protected: ProtectedApis,
}

impl RouteClassifier {
    pub fn new(
        sensor_prefix: &str,
        identification_pages: &[String],
        protected: ProtectedApis,
    ) -> Result<Self, ConfigError> {
        let trimmed = sensor_prefix.trim_matches('/');
        if trimmed.is_empty() {
            return Err(ConfigError::Missing("routes.sensor_prefix"));
        }
        let identification_pages =
            RouteMatcher::compile(identification_pages.iter().map(|p| (p, ())))?;

        Ok(Self {
            sensor_prefix: format!("/{}/", trimmed),
            identification_pages,
            protected,
        })
    }

    /// Classify an absolute request URL and method.
    pub fn classify(&self, url: &str, method: &str) -> RouteClassification {
        let path = normalized_path(url);
        if let Some(name) = self.strip_sensor_prefix(&path) {
            if !name.is_empty() {
                return RouteClassification::SensorAsset {
                    name: name.to_string(),
                };
            }
        }

        if self.identification_pages.is_match(url) {
            return RouteClassification::Identification;
        }

        match method.parse::<HttpMethod>() {
            Ok(method) if self.protected.matches(url, method) => {
                RouteClassification::Protection { method }
            }
            _ => RouteClassification::None,
        }
    }

    /// Path below the sensor prefix, if `path` is under it.
    pub fn strip_sensor_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(self.sensor_prefix.as_str())
    }

    /// The prefix including leading and trailing slashes, e.g. `/_sensor/`.
    pub fn sensor_prefix(&self) -> &str {
        &self.sensor_prefix
    }

    pub fn protected(&self) -> &ProtectedApis {
        &self.protected
    }
}

/// Resolve `url` against the page URL `base`, removing dot segments.
///
/// Returns `url` unchanged when neither parses.
pub fn resolve_url(base: &str, url: &str) -> String {
    let url = url.trim();
    let resolved = match Url::parse(base) {
        Ok(base) => base.join(url),
        Err(_) => Url::parse(url),
    };
    match resolved {
        Ok(mut resolved) => {
            resolved.set_fragment(None);
            resolved.to_string()
        }
        Err(_) => url.to_string(),
    }
}
