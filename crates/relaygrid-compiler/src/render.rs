//! Template rendering for config fragments.
//!
//! Fragments are handlebars templates rendered in strict mode with HTML
//! escaping disabled (the output is JSON). Each render site has its own
//! variable struct, so a template can only see what its site provides.
//!
//! An undefined variable does not fail the render; it yields the marker
//! `__INVALID__:{name}`, which the compiler treats as a broken fragment.

use std::sync::LazyLock;

use handlebars::{Handlebars, RenderErrorReason, handlebars_helper};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Marker emitted in place of an undefined variable.
pub const INVALID_MARKER: &str = "__INVALID__";

/// Placeholder pattern emitted by the `dep_path` helper: `*#path:name#*`.
pub static DEPENDENT_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*#(\w+):(\w+)#\*").expect("static pattern"));

handlebars_helper!(dep_path: |name: str| format!("*#path:{name}#*"));
handlebars_helper!(to_json: |value: Json| value.to_string());

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("{site} template failed: {reason}")]
    Render { site: RenderSite, reason: String },
}

/// Where a template is rendered; decides which variables are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderSite {
    Outbound,
    Rules,
    Consumer,
    Inbound,
    StaticInbound,
    BaseConfig,
    Strategy,
}

impl RenderSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderSite::Outbound => "outbound",
            RenderSite::Rules => "rules",
            RenderSite::Consumer => "consumer",
            RenderSite::Inbound => "inbound",
            RenderSite::StaticInbound => "static_inbound",
            RenderSite::BaseConfig => "base_config",
            RenderSite::Strategy => "strategy",
        }
    }
}

impl std::fmt::Display for RenderSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locale settings passed to every render instead of read from the process.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RenderEnv {
    pub timezone: String,
    pub locale: String,
}

impl Default for RenderEnv {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            locale: "en".to_string(),
        }
    }
}

// ── Per-site variables ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct OutboundVars<'a> {
    pub env: &'a RenderEnv,
    pub tag: &'a str,
    pub node: &'a Value,
    pub user: Option<Value>,
    pub combo: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RulesVars<'a> {
    pub env: &'a RenderEnv,
    pub node: &'a Value,
    pub rule: Value,
    pub consumer_emails: Vec<String>,
    pub outbound_tags: Vec<String>,
    pub balancer_tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ConsumerVars<'a> {
    pub env: &'a RenderEnv,
    pub user: Value,
}

#[derive(Debug, Serialize)]
pub struct InboundVars<'a> {
    pub env: &'a RenderEnv,
    pub node: &'a Value,
    pub inbound_tag: &'a str,
    /// Comma-separated consumer objects, ready to splice into an array.
    pub consumers_part: String,
}

#[derive(Debug, Serialize)]
pub struct NodeVars<'a> {
    pub env: &'a RenderEnv,
    pub node: &'a Value,
}

#[derive(Debug, Serialize)]
pub struct StrategyVars<'a> {
    pub env: &'a RenderEnv,
    /// Comma-separated cost objects.
    pub costs_part: String,
    pub baselines: Vec<String>,
    pub max_rtt: Option<String>,
    pub fallback_tag: Option<String>,
}

/// Strict, non-escaping handlebars renderer.
pub struct TemplateRenderer {
    hb: Handlebars<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut hb = Handlebars::new();
        hb.set_strict_mode(true);
        hb.register_escape_fn(handlebars::no_escape);
        hb.register_helper("dep_path", Box::new(dep_path));
        hb.register_helper("json", Box::new(to_json));
        Self { hb }
    }

    /// Render one fragment.
    ///
    /// Undefined variables render as the invalid marker; syntax errors and
    /// helper failures are returned as errors.
    pub fn render<T: Serialize>(
        &self,
        site: RenderSite,
        template: &str,
        vars: &T,
    ) -> Result<String, TemplateError> {
        match self.hb.render_template(template, vars) {
            Ok(out) => Ok(out),
            Err(e) => match e.reason() {
                RenderErrorReason::MissingVariable(name) => Ok(format!(
                    "{INVALID_MARKER}:{}",
                    name.as_deref().unwrap_or("?")
                )),
                _ => Err(TemplateError::Render {
                    site,
                    reason: e.to_string(),
                }),
            },
        }
    }
}

/// Names referenced through `dep_path`, in order of first appearance.
pub fn dependent_file_names(rendered: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in DEPENDENT_FILE_RE.captures_iter(rendered) {
        if &caps[1] == "path" && !names.iter().any(|n| n == &caps[2]) {
            names.push(caps[2].to_string());
        }
    }
    names
}

/// Split a rendered fragment into JSON objects.
///
/// Accepts a single object, an array of objects, or a comma-separated
/// list of objects. Blank output yields an empty list.
pub fn parse_objects(rendered: &str) -> Result<Vec<Value>, String> {
    let trimmed = rendered.trim().trim_end_matches(',');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| e.to_string())?
    } else {
        serde_json::from_str(&format!("[{trimmed}]")).map_err(|e| e.to_string())?
    };
    let Value::Array(items) = value else {
        return Err("expected an array".to_string());
    };
    if let Some(bad) = items.iter().find(|v| !v.is_object()) {
        return Err(format!("expected objects, found {bad}"));
    }
    Ok(items)
}
