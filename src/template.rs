//! Jinja2-style rendering of task arguments.
//!
//! The engine only needs `render(template, scope) -> String`; the
//! [`TemplateRenderer`] trait keeps that seam open and [`JinjaRenderer`]
//! provides the default implementation on top of minijinja.

use minijinja::{Environment, UndefinedBehavior, Value};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::vars::{parse_path, VariableScope};

/// Renders template strings against a variable scope.
pub trait TemplateRenderer: Send + Sync + std::fmt::Debug {
    /// Render `template` with the variables visible in `scope`
    fn render(&self, template: &str, scope: &VariableScope) -> Result<String>;
}

/// Check if a string contains template syntax
pub fn has_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// If `s` is exactly one `{{ ... }}` expression, return its inner text.
pub fn strip_delimiters(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// Renderer backed by a minijinja [`Environment`].
#[derive(Debug)]
pub struct JinjaRenderer {
    env: Environment<'static>,
}

impl Default for JinjaRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl JinjaRenderer {
    /// Create a renderer that fails on undefined variables
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_filter("d", |value: Value, default: Option<Value>| -> Value {
            if value.is_undefined() || value.is_none() {
                default.unwrap_or_else(|| Value::from(""))
            } else {
                value
            }
        });
        env.add_filter("bool", |value: Value| -> bool {
            match value.as_str() {
                Some(s) => matches!(
                    s.trim().to_lowercase().as_str(),
                    "true" | "yes" | "on" | "1" | "y"
                ),
                None => value.is_true(),
            }
        });
        env.add_filter("int", |value: Value| -> i64 {
            if let Some(s) = value.as_str() {
                return s.trim().parse().unwrap_or(0);
            }
            i64::try_from(value).unwrap_or(0)
        });

        Self { env }
    }

    /// Allow undefined variables to render as empty strings
    pub fn lenient(mut self) -> Self {
        self.env.set_undefined_behavior(UndefinedBehavior::Lenient);
        self
    }
}

impl TemplateRenderer for JinjaRenderer {
    fn render(&self, template: &str, scope: &VariableScope) -> Result<String> {
        if !has_template(template) {
            return Ok(template.to_string());
        }
        let context = Value::from_serialize(scope.flatten());
        self.env
            .render_str(template, context)
            .map_err(|e| Error::template_render(template, e.to_string()))
    }
}

/// Render every string inside `value`.
///
/// A string that is exactly `{{ path }}` and resolves in scope keeps the
/// native value (list, mapping, number) instead of being stringified.
pub fn render_value(
    renderer: &dyn TemplateRenderer,
    value: &JsonValue,
    scope: &VariableScope,
) -> Result<JsonValue> {
    match value {
        JsonValue::String(s) => {
            if let Some(inner) = strip_delimiters(s) {
                if parse_path(inner).is_some() {
                    if let Some(native) = scope.lookup_path(inner.trim()) {
                        return Ok(native.clone());
                    }
                }
            }
            if has_template(s) {
                Ok(JsonValue::String(renderer.render(s, scope)?))
            } else {
                Ok(value.clone())
            }
        }
        JsonValue::Array(items) => items
            .iter()
            .map(|item| render_value(renderer, item, scope))
            .collect::<Result<Vec<_>>>()
            .map(JsonValue::Array),
        JsonValue::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(renderer, item, scope)?);
            }
            Ok(JsonValue::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}
