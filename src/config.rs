//! Configuration types for the signal gateway.

use crate::error::ConfigError;
use crate::routes::ProtectedRoute;
use crate::rule_action::RuleAction;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the signal gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Route tables
    pub routes: RoutesConfig,

    /// Identification backend settings
    pub identification: IdentificationConfig,

    /// Sensor script serving
    pub scripts: ScriptsConfig,

    /// Tampering verification settings
    pub tampering: TamperingConfig,

    /// Token correlation settings
    pub correlation: CorrelationConfig,

    /// Listener and origin
    pub server: ServerConfig,
}

impl GatewayConfig {
    /// Check values that have no usable default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .identification
            .secret_api_key
            .as_deref()
            .map_or(true, str::is_empty)
        {
            return Err(ConfigError::Missing("identification.secret_api_key"));
        }
        if self.server.origin_url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("server.origin_url"));
        }
        if self.identification.host.is_empty() {
            return Err(ConfigError::Missing("identification.host"));
        }
        if self.routes.sensor_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Missing("routes.sensor_prefix"));
        }
        self.identification.trusted_proxy_ranges()?;
        if self.correlation.enabled && self.correlation.token_secret.is_empty() {
            return Err(ConfigError::Missing("correlation.token_secret"));
        }
        Ok(())
    }
}

/// Route tables shared with the sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// API routes that require a signal
    pub protected_apis: Vec<ProtectedRoute>,

    /// Pages that get the sensor injected
    pub identification_pages: Vec<String>,

    /// Path prefix under which sensor assets are served
    pub sensor_prefix: String,

    /// Scheme used to rebuild absolute request URLs
    pub scheme: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            protected_apis: vec![],
            identification_pages: vec![],
            sensor_prefix: "_sensor".to_string(),
            scheme: "https".to_string(),
        }
    }
}

/// Identification backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentificationConfig {
    /// Base host of the identification service
    pub host: String,

    /// Region; every region except `us` is prefixed onto the host
    pub region: String,

    /// Path of the identification endpoint
    pub identify_path: String,

    /// Secret key sent to the backend
    pub secret_api_key: Option<String>,

    /// Public key handed to the agent loader
    pub public_api_key: Option<String>,

    /// Ruleset evaluated by the backend
    pub ruleset_id: Option<String>,

    /// The only client cookie forwarded to the backend
    pub session_cookie_name: String,

    /// Header (and form field) carrying the signal
    pub signals_header: String,

    /// Response header carrying agent data
    pub agent_data_header: String,

    /// Header holding the client IP, set by the edge in front of us
    pub client_ip_header: String,

    /// Peers trusted to set `client_ip_header` (CIDR). Empty trusts no one
    /// and the peer address is used.
    pub trusted_proxies: Vec<String>,

    /// Action used whenever identification cannot complete
    pub fallback_rule_action: RuleAction,
}

impl IdentificationConfig {
    pub fn trusted_proxy_ranges(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.trusted_proxies
            .iter()
            .map(|range| {
                range.parse::<IpNet>().map_err(|e| ConfigError::InvalidValue {
                    field: "identification.trusted_proxies",
                    reason: format!("`{}`: {}", range, e),
                })
            })
            .collect()
    }
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            host: "identification.zentinelproxy.io".to_string(),
            region: DEFAULT_REGION.to_string(),
            identify_path: "/v1/identify".to_string(),
            secret_api_key: None,
            public_api_key: None,
            ruleset_id: None,
            session_cookie_name: "_zsid".to_string(),
            signals_header: "x-sensor-signals".to_string(),
            agent_data_header: "x-sensor-agent-data".to_string(),
            client_ip_header: "x-forwarded-for".to_string(),
            trusted_proxies: vec![],
            fallback_rule_action: RuleAction::default(),
        }
    }
}

/// Region served from the bare identification host.
pub const DEFAULT_REGION: &str = "us";

/// Sensor script serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// File with the sensor script; the bundled script is used when unset
    pub sensor_script_path: Option<PathBuf>,

    /// Where the agent loader is proxied from
    pub agent_loader_url: Option<String>,

    /// Cache-Control for scripts that have none of their own
    pub default_cache_control: String,

    /// Ceiling for `max-age` in seconds
    pub max_age_cap: u64,

    /// Ceiling for `s-maxage` in seconds
    pub s_maxage_cap: u64,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            sensor_script_path: None,
            agent_loader_url: None,
            default_cache_control: "public, max-age=3600, s-maxage=60".to_string(),
            max_age_cap: 3600,
            s_maxage_cap: 60,
        }
    }
}

/// Tampering verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TamperingConfig {
    /// Oldest identification event accepted for correlation
    pub max_event_age_seconds: u64,
}

impl Default for TamperingConfig {
    fn default() -> Self {
        Self {
            max_event_age_seconds: 10,
        }
    }
}

/// Token correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Expose the token and correlate endpoints
    pub enabled: bool,

    /// Secret for HMAC token signing
    pub token_secret: String,

    /// Token validity in seconds
    pub token_validity_seconds: u64,

    /// Maximum stored tokens
    pub store_capacity: u64,

    /// Request header carrying a correlation token on protected calls
    pub token_header: String,

    /// Tags attached to a correlated event
    pub event_tags: serde_json::Value,

    /// Delay before the single tag update retry
    pub tag_retry_delay_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_secret: String::new(),
            token_validity_seconds: 300,
            store_capacity: 100_000,
            token_header: "x-sensor-correlation".to_string(),
            event_tags: serde_json::json!({ "correlated": true }),
            tag_retry_delay_ms: 1000,
        }
    }
}

/// Listener and origin settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the gateway listens on
    pub listen: String,

    /// Origin application every request is forwarded to
    pub origin_url: Option<String>,

    /// Largest request body buffered before forwarding
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            origin_url: None,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.identification.secret_api_key = Some("secret".to_string());
        config.server.origin_url = Some("http://127.0.0.1:3000".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.routes.sensor_prefix, "_sensor");
        assert_eq!(config.identification.region, "us");
        assert!(config.identification.fallback_rule_action.is_block());
        assert_eq!(config.tampering.max_event_age_seconds, 10);
        assert!(!config.correlation.enabled);
    }

    #[test]
    fn test_validate_requires_secret_and_origin() {
        let config = GatewayConfig::default();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Missing("identification.secret_api_key"))
        );

        let mut config = valid_config();
        config.server.origin_url = None;
        assert_eq!(config.validate(), Err(ConfigError::Missing("server.origin_url")));

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_trusted_proxies() {
        let mut config = valid_config();
        config.identification.trusted_proxies = vec!["10.0.0.0/8".to_string()];
        assert!(config.validate().is_ok());

        config.identification.trusted_proxies = vec!["not-a-cidr".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_serialization() {
        let config = valid_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.identification.host, config.identification.host);
        assert_eq!(parsed.identification.fallback_rule_action, config.identification.fallback_rule_action);
    }
}
