//! Signal Gateway for Zentinel
//!
//! Two cooperating halves of a bot-mitigation system:
//!
//! - an edge gateway that classifies inbound requests, injects the sensor
//!   into identification pages, and enforces identification decisions on
//!   protected API routes;
//! - an in-browser sensor that attaches signals to outgoing requests and
//!   relays agent data back to the fingerprinting library.
//!
//! # Features
//!
//! - Method-indexed protected route matching with wildcard URL patterns
//! - Identification backend client with cookie minimization
//! - Allow/Block rule action enforcement with a configurable fallback
//! - Sensor script serving with capped cache lifetimes
//! - Token correlation with tampering verification
//!
//! # Example
//!
//! ```ignore
//! use zentinel_agent_signal_gateway::{EdgeGateway, GatewayConfig, HttpUpstream};
//!
//! let gateway = EdgeGateway::new(&config, origin, backend)?;
//! let response = gateway.handle(request).await;
//! ```

pub mod config;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod html;
pub mod identification;
pub mod policy;
pub mod routes;
pub mod rule_action;
pub mod scripts;
pub mod sensor;
pub mod store;
pub mod tampering;
pub mod token;
pub mod upstream;

pub use config::GatewayConfig;
pub use correlation::{CorrelationService, EventApi, ServerApiClient};
pub use error::{
    ConfigError, GatewayError, PreconditionError, SensorError, StoreError, TamperingError,
    UpstreamError,
};
pub use gateway::EdgeGateway;
pub use identification::{IdentificationClient, SendResult};
pub use policy::PolicyEngine;
pub use routes::{HttpMethod, ProtectedRoute, RouteClassification, RouteClassifier};
pub use rule_action::RuleAction;
pub use store::{MemoryTokenStore, StoredSignals, TokenStore};
pub use tampering::{CorrelationRequest, IdentificationEvent, TamperingVerifier};
pub use upstream::{ClientAddr, HttpUpstream, Upstream};
