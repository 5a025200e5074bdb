//! In-browser sensor.
//!
//! The sensor wraps the page's request mechanisms (fetch, XHR-style request
//! objects and native form submissions) so that requests to protected APIs
//! carry a signal, and hands agent data from protected responses back to the
//! fingerprinting library.
//!
//! Each patcher is a decorator that owns the original implementation and is
//! installed once at start-up:
//!
//! ```ignore
//! let context = Arc::new(SensorContext::from_settings(page_url, &settings)?);
//! context.set_signals_provider(Arc::new(MemoizedSignalsProvider::new(library)));
//! let fetch = FetchPatcher::new(native_fetch, Arc::clone(&context));
//! ```

pub mod context;
pub mod fetch;
pub mod form;
pub mod xhr;

pub use context::{
    AgentDataProcessor, MemoizedSignalsProvider, PatcherRequest, SensorContext, SensorSettings,
    SignalsProvider,
};
pub use fetch::{
    CredentialsMode, Fetch, FetchError, FetchInit, FetchInput, FetchPatcher, FetchRequest,
    FetchResponse, RequestMode,
};
pub use form::{
    DomMutation, FormDocument, FormElement, FormId, FormInjection, FormPatcher, ListenerId,
    SubmitEvent,
};
pub use xhr::{XhrId, XhrOutcome, XhrPatcher, XhrResponse, XhrTransport};

/// Prefix on a signal meaning the page itself asked for credentials.
pub const CREDENTIALS_SENTINEL: char = '!';
