//! Sensor injection into identification pages.

use crate::sensor::SensorSettings;
use regex::Regex;
use std::sync::LazyLock;

static HEAD_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</head\s*>").expect("valid regex: head end"));

/// Appends HTML fragments to the end of a document's `<head>`.
pub trait HtmlInjector: Send + Sync {
    /// Returns `None` when the document has no closing head tag.
    fn inject_into_head(&self, html: &str, fragment: &str) -> Option<String>;
}

/// Buffered injector that inserts before the first `</head>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadInjector;

impl HtmlInjector for HeadInjector {
    fn inject_into_head(&self, html: &str, fragment: &str) -> Option<String> {
        let position = HEAD_END.find(html)?.start();
        let mut out = String::with_capacity(html.len() + fragment.len());
        out.push_str(&html[..position]);
        out.push_str(fragment);
        out.push_str(&html[position..]);
        Some(out)
    }
}

/// Render the settings block followed by one async script tag per source.
pub fn render_sensor_fragment(
    settings: &SensorSettings,
    script_sources: &[String],
) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(settings)?
        .replace("</", "<\\/")
        .replace("<!--", "<\\!--");
    let mut fragment = format!("<script>window.__sensorSettings={};</script>", json);
    for src in script_sources {
        fragment.push_str(&format!(
            "<script src=\"{}\" async></script>",
            escape_attribute(src)
        ));
    }
    Ok(fragment)
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
