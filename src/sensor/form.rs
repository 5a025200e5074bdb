//! Native form submission patcher.

use super::context::{PatcherRequest, SensorContext};
use crate::routes::HttpMethod;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

pub type FormId = u64;
pub type ListenerId = u64;

/// Snapshot of a form's submission attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormElement {
    pub id: FormId,
    pub action: String,
    pub method: String,
    pub enctype: String,
}

/// A change reported by the document mutation watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomMutation {
    FormAdded(FormId),
    AttributeChanged { form: FormId, attribute: String },
    FormRemoved(FormId),
}

/// The document operations the form patcher needs.
pub trait FormDocument: Send + Sync {
    fn forms(&self) -> Vec<FormId>;

    fn form(&self, id: FormId) -> Option<FormElement>;

    fn has_field(&self, form: FormId, name: &str) -> bool;

    fn append_hidden_field(&self, form: FormId, name: &str, value: &str);

    fn add_submit_listener(&self, form: FormId) -> ListenerId;

    fn remove_submit_listener(&self, form: FormId, listener: ListenerId);
}

/// A submit event delivered to one of our listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitEvent {
    pub form: FormId,
    pub listener: ListenerId,
    pub default_prevented: bool,
}

/// What a submit handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormInjection {
    Injected,
    DefaultPrevented,
    MethodNotBodyCarrying,
    PlainTextEncoding,
    FieldPresent,
    NotProtected,
    NoSignal,
    StaleListener,
    UnknownForm,
}

const WATCHED_ATTRIBUTES: [&str; 3] = ["action", "method", "enctype"];

struct FormCall<'a> {
    document: &'a dyn FormDocument,
    form: FormId,
    action: String,
    method: String,
}

impl PatcherRequest for FormCall<'_> {
    fn url(&self) -> &str {
        &self.action
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.document.append_hidden_field(self.form, name, value);
    }

    // Native submissions always carry the page's cookies.
    fn set_include_credentials(&mut self) -> bool {
        true
    }
}

/// Attaches one submit listener per form and injects the signal field.
pub struct FormPatcher {
    document: Arc<dyn FormDocument>,
    context: Arc<SensorContext>,
    listeners: DashMap<FormId, ListenerId>,
}

impl FormPatcher {
    pub fn new(document: Arc<dyn FormDocument>, context: Arc<SensorContext>) -> Self {
        Self {
            document,
            context,
            listeners: DashMap::new(),
        }
    }

    /// Attach listeners to every form present when the page is ready.
    pub fn on_ready(&self) {
        for form in self.document.forms() {
            self.attach(form);
        }
    }

    /// Re-attach listeners for added forms and relevant attribute changes.
    pub fn on_mutations(&self, mutations: &[DomMutation]) {
        for mutation in mutations {
            match mutation {
                DomMutation::FormAdded(form) => self.attach(*form),
                DomMutation::AttributeChanged { form, attribute } => {
                    if WATCHED_ATTRIBUTES
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(attribute))
                    {
                        self.attach(*form);
                    }
                }
                DomMutation::FormRemoved(form) => {
                    if let Some((_, listener)) = self.listeners.remove(form) {
                        self.document.remove_submit_listener(*form, listener);
                        trace!(form, listener, "Detached submit listener");
                    }
                }
            }
        }
    }

    /// Number of forms with a live listener.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn attach(&self, form: FormId) {
        if let Some((_, previous)) = self.listeners.remove(&form) {
            self.document.remove_submit_listener(form, previous);
        }
        let listener = self.document.add_submit_listener(form);
        trace!(form, listener, "Attached submit listener");
        self.listeners.insert(form, listener);
    }

    /// Handle a submission, appending the signal field when it applies.
    pub async fn on_submit(&self, event: SubmitEvent) -> FormInjection {
        let current = self.listeners.get(&event.form).map(|l| *l);
        if current != Some(event.listener) {
            return FormInjection::StaleListener;
        }
        if event.default_prevented {
            return FormInjection::DefaultPrevented;
        }
        let Some(form) = self.document.form(event.form) else {
            return FormInjection::UnknownForm;
        };

        let method = if form.method.trim().is_empty() {
            "GET".to_string()
        } else {
            form.method.trim().to_ascii_uppercase()
        };
        let body_carrying = method
            .parse::<HttpMethod>()
            .is_ok_and(|m| m.is_body_carrying());
        if !body_carrying {
            return FormInjection::MethodNotBodyCarrying;
        }
        if form.enctype.trim().eq_ignore_ascii_case("text/plain") {
            return FormInjection::PlainTextEncoding;
        }
        if self.document.has_field(form.id, self.context.signals_header()) {
            return FormInjection::FieldPresent;
        }
        if !self.context.is_protected(&form.action, &method) {
            return FormInjection::NotProtected;
        }
        let Some(signal) = self.context.collect_signals().await else {
            return FormInjection::NoSignal;
        };

        let mut call = FormCall {
            document: self.document.as_ref(),
            form: form.id,
            action: form.action,
            method,
        };
        debug!(action = %call.action, "Injecting signal field into form");
        self.context.inject(&mut call, &signal);
        FormInjection::Injected
    }
}
