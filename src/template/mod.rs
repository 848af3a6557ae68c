//! Jinja2-compatible template rendering powered by minijinja.
//!
//! [`TemplateEngine`] renders full templates with the contracted filter set
//! registered; [`expand_variables`] is the lightweight `{{ name }}`
//! substitution the task runner applies to module arguments, and
//! [`render_value`] walks an argument tree substituting only string leaves.

pub mod filters;

use minijinja::value::{Rest, Value as MjValue};
use minijinja::Environment;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;

use crate::vars::{lookup_path, VarMap};

/// Errors from template rendering or filter application.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template failed to parse or render.
    #[error("Template render error: {0}")]
    Render(String),

    /// No filter registered under this name.
    #[error("Unknown filter '{0}'")]
    UnknownFilter(String),

    /// A filter rejected its input or arguments.
    #[error("Filter '{filter}' failed: {message}")]
    Filter {
        /// Filter name
        filter: String,
        /// Failure detail
        message: String,
    },
}

/// Result type for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

impl TemplateError {
    pub(crate) fn filter(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Filter {
            filter: filter.into(),
            message: message.into(),
        }
    }
}

/// Custom function signature for [`TemplateEngine::add_function`].
pub type TemplateFn =
    Arc<dyn Fn(&[JsonValue]) -> TemplateResult<JsonValue> + Send + Sync + 'static>;

/// Render engine with the engine's filter library registered.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with every contracted filter registered.
    pub fn new() -> Self {
        let mut env = Environment::new();
        for &name in filters::FILTER_NAMES {
            env.add_filter(
                name,
                move |value: MjValue, args: Rest<MjValue>| -> Result<MjValue, minijinja::Error> {
                    let json = mj_to_json(&value)?;
                    let json_args = args
                        .iter()
                        .map(mj_to_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    let out = filters::apply(name, &json, &json_args).map_err(|e| {
                        minijinja::Error::new(
                            minijinja::ErrorKind::InvalidOperation,
                            e.to_string(),
                        )
                    })?;
                    Ok(MjValue::from_serialize(&out))
                },
            );
        }
        Self { env }
    }

    /// Render `template` against the merged variable view.
    pub fn render(&self, template: &str, vars: &VarMap) -> TemplateResult<String> {
        self.env
            .render_str(template, MjValue::from_serialize(vars))
            .map_err(|e| TemplateError::Render(e.to_string()))
    }

    /// Register a custom function callable from templates.
    pub fn add_function(&mut self, name: &'static str, func: TemplateFn) {
        self.env.add_function(
            name,
            move |args: Rest<MjValue>| -> Result<MjValue, minijinja::Error> {
                let json_args = args
                    .iter()
                    .map(mj_to_json)
                    .collect::<Result<Vec<_>, _>>()?;
                let out = func(&json_args).map_err(|e| {
                    minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
                })?;
                Ok(MjValue::from_serialize(&out))
            },
        );
    }

    /// Apply one named filter directly, outside any template.
    pub fn apply_filter(
        &self,
        name: &str,
        value: &JsonValue,
        args: &[JsonValue],
    ) -> TemplateResult<JsonValue> {
        filters::apply(name, value, args)
    }
}

fn mj_to_json(value: &MjValue) -> Result<JsonValue, minijinja::Error> {
    serde_json::to_value(value)
        .map_err(|e| minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string()))
}

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_\.\[\]]*)\s*\}\}").expect("valid regex"));

/// Simple `{{ name }}` substitution over dotted variable paths.
///
/// Unresolvable references are left in place so the output still shows what
/// was asked for.
pub fn expand_variables(input: &str, vars: &VarMap) -> String {
    VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match lookup_path(vars, &caps[1]) {
                Some(value) => value_to_string(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render an argument tree: only string leaves are substituted; maps and
/// sequences are reconstructed with rendered children.
///
/// A string consisting of exactly one `{{ name }}` reference resolves to the
/// referenced value with its type preserved.
pub fn render_value(value: &JsonValue, vars: &VarMap) -> JsonValue {
    match value {
        JsonValue::String(s) => {
            if let Some(caps) = VAR_PATTERN.captures(s) {
                if caps.get(0).map(|m| m.as_str()) == Some(s.trim()) {
                    if let Some(resolved) = lookup_path(vars, &caps[1]) {
                        return resolved;
                    }
                }
            }
            JsonValue::String(expand_variables(s, vars))
        }
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| render_value(v, vars)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render every value in an argument map.
pub fn render_args(args: &VarMap, vars: &VarMap) -> VarMap {
    args.iter()
        .map(|(k, v)| (k.clone(), render_value(v, vars)))
        .collect()
}

fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
