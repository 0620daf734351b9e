//! # Template Renderer
//!
//! Recursive rendering of templated step definitions and action payloads.
//!
//! The load-bearing rule: a string whose entire body is a single expression
//! block (`"{{ my_list }}"`) evaluates to the *native* value of that
//! expression, not its string form. Everything else with at least one block
//! renders as a string; values without blocks pass through unchanged.
//! Mappings and lists are recursed element-wise.
//!
//! Filters: `sqlquote`, `sha256_hex`, `b64decode`, `rstrip`.
//! Globals: `now(tz?)` (RFC-3339; UTC when `tz == "utc"`, local otherwise).

use base64::Engine as _;
use minijinja::Environment;
use serde_json::Value;

use crate::errors::{EngineError, Result};
use crate::store::sha256_hex;

fn filter_sqlquote(value: minijinja::Value) -> String {
    if value.is_none() || value.is_undefined() {
        return "NULL".to_string();
    }
    let raw = match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    };
    format!("'{}'", raw.replace('\'', "''"))
}

fn filter_sha256_hex(value: String) -> String {
    sha256_hex(value.as_bytes())
}

fn filter_b64decode(value: String) -> std::result::Result<minijinja::Value, minijinja::Error> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value.as_bytes())
        .map_err(|err| {
            minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("invalid base64 input: {err}"),
            )
        })?;
    // Textual payloads stay strings; anything else surfaces as a byte list.
    Ok(match String::from_utf8(decoded) {
        Ok(text) => minijinja::Value::from(text),
        Err(raw) => minijinja::Value::from_serialize(raw.as_bytes()),
    })
}

fn filter_rstrip(value: String, chars: Option<String>) -> String {
    match chars {
        Some(chars) => value
            .trim_end_matches(|c: char| chars.contains(c))
            .to_string(),
        None => value.trim_end().to_string(),
    }
}

fn global_now(tz: Option<String>) -> String {
    match tz.as_deref() {
        Some(tz) if tz.eq_ignore_ascii_case("utc") => {
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        }
        _ => chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
    }
}

/// Builds an environment with the engine's filters and globals installed.
///
/// Expression compilation borrows the source for the environment's lifetime,
/// so expression evaluation constructs a short-lived environment instead of
/// sharing a `'static` one.
fn build_env<'a>() -> Environment<'a> {
    let mut env = Environment::new();
    env.add_filter("sqlquote", filter_sqlquote);
    env.add_filter("sha256_hex", filter_sha256_hex);
    env.add_filter("b64decode", filter_b64decode);
    env.add_filter("rstrip", filter_rstrip);
    env.add_function("now", global_now);
    env
}

#[derive(Debug)]
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self { env: build_env() }
    }

    /// Renders a template string against a JSON context.
    pub fn render_str(&self, template: &str, context: &Value) -> Result<String> {
        let ctx = minijinja::Value::from_serialize(context);
        self.env
            .render_str(template, ctx)
            .map_err(|err| EngineError::template(template, err))
    }

    /// Evaluates an expression to its native value.
    pub fn eval_expression(&self, expression: &str, context: &Value) -> Result<Value> {
        let env = build_env();
        let compiled = env
            .compile_expression(expression)
            .map_err(|err| EngineError::template(expression, err))?;
        let ctx = minijinja::Value::from_serialize(context);
        let result = compiled
            .eval(ctx)
            .map_err(|err| EngineError::template(expression, err))?;
        serde_json::to_value(&result)
            .map_err(|err| EngineError::template(expression, err))
    }

    /// Evaluates a boolean condition expression (the `if:` field).
    pub fn eval_bool(&self, expression: &str, context: &Value) -> Result<bool> {
        let env = build_env();
        let compiled = env
            .compile_expression(expression)
            .map_err(|err| EngineError::template(expression, err))?;
        let ctx = minijinja::Value::from_serialize(context);
        let result = compiled
            .eval(ctx)
            .map_err(|err| EngineError::template(expression, err))?;
        Ok(result.is_true())
    }

    /// Recursively renders a JSON value.
    pub fn render_value(&self, value: &Value, context: &Value) -> Result<Value> {
        match value {
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    rendered.insert(key.clone(), self.render_value(item, context)?);
                }
                Ok(Value::Object(rendered))
            }
            Value::Array(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    rendered.push(self.render_value(item, context)?);
                }
                Ok(Value::Array(rendered))
            }
            Value::String(text) => self.render_string_value(text, context),
            _ => Ok(value.clone()),
        }
    }

    fn render_string_value(&self, text: &str, context: &Value) -> Result<Value> {
        let trimmed = text.trim();
        if Self::is_single_expression(trimmed) {
            let inner = trimmed[2..trimmed.len() - 2].trim();
            // A failed native evaluation falls back to string rendering so
            // interpolations with filters that only make sense as strings
            // still work.
            if let Ok(native) = self.eval_expression(inner, context) {
                return Ok(native);
            }
        }
        if text.contains("{{") || text.contains("{%") {
            return Ok(Value::String(self.render_str(text, context)?));
        }
        Ok(Value::String(text.to_string()))
    }

    /// True when the whole string is exactly one `{{ … }}` block.
    fn is_single_expression(trimmed: &str) -> bool {
        trimmed.starts_with("{{")
            && trimmed.ends_with("}}")
            && trimmed.matches("{{").count() == 1
            && trimmed.len() >= 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer() -> Renderer {
        Renderer::new()
    }

    #[test]
    fn test_single_expression_preserves_native_list() {
        let ctx = json!({"my_list": [1, 2, 3]});
        let out = renderer()
            .render_value(&json!("{{ my_list }}"), &ctx)
            .unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }

    #[test]
    fn test_single_expression_preserves_native_mapping_and_number() {
        let ctx = json!({"cfg": {"depth": 3}, "n": 7});
        let r = renderer();
        assert_eq!(
            r.render_value(&json!("{{ cfg }}"), &ctx).unwrap(),
            json!({"depth": 3})
        );
        assert_eq!(r.render_value(&json!("{{ n }}"), &ctx).unwrap(), json!(7));
    }

    #[test]
    fn test_mixed_template_renders_as_string() {
        let ctx = json!({"name": "ada"});
        let out = renderer()
            .render_value(&json!("hello {{ name }}!"), &ctx)
            .unwrap();
        assert_eq!(out, json!("hello ada!"));
    }

    #[test]
    fn test_two_blocks_render_as_string() {
        let ctx = json!({"a": 1, "b": 2});
        let out = renderer()
            .render_value(&json!("{{ a }}{{ b }}"), &ctx)
            .unwrap();
        assert_eq!(out, json!("12"));
    }

    #[test]
    fn test_plain_values_pass_through() {
        let ctx = json!({});
        let r = renderer();
        assert_eq!(r.render_value(&json!("plain"), &ctx).unwrap(), json!("plain"));
        assert_eq!(r.render_value(&json!(42), &ctx).unwrap(), json!(42));
        assert_eq!(r.render_value(&json!(null), &ctx).unwrap(), json!(null));
    }

    #[test]
    fn test_recursion_into_mappings_and_lists() {
        let ctx = json!({"ids": [5, 6], "env": "prod"});
        let out = renderer()
            .render_value(
                &json!({"filter": {"ids": "{{ ids }}"}, "tags": ["{{ env }}", "static"]}),
                &ctx,
            )
            .unwrap();
        assert_eq!(
            out,
            json!({"filter": {"ids": [5, 6]}, "tags": ["prod", "static"]})
        );
    }

    #[test]
    fn test_eval_bool_condition() {
        let ctx = json!({"steps": {"fetch": {"outputs": {"count": 0}}}});
        let r = renderer();
        assert!(!r
            .eval_bool("steps.fetch.outputs.count > 0", &ctx)
            .unwrap());
        assert!(r.eval_bool("steps.fetch.outputs.count == 0", &ctx).unwrap());
    }

    #[test]
    fn test_template_error_wraps_source() {
        let err = renderer()
            .render_str("{{ missing_filter | nope }}", &json!({}))
            .unwrap_err();
        match err {
            EngineError::Template { template, .. } => {
                assert!(template.contains("nope"));
            }
            other => panic!("expected template error, got {other:?}"),
        }
    }

    #[test]
    fn test_sqlquote_filter() {
        let r = renderer();
        let ctx = json!({"name": "O'Brien", "missing": null});
        assert_eq!(
            r.render_str("{{ name | sqlquote }}", &ctx).unwrap(),
            "'O''Brien'"
        );
        assert_eq!(r.render_str("{{ missing | sqlquote }}", &ctx).unwrap(), "NULL");
    }

    #[test]
    fn test_sha256_hex_filter() {
        let out = renderer()
            .render_str("{{ 'abc' | sha256_hex }}", &json!({}))
            .unwrap();
        assert_eq!(
            out,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_b64decode_filter() {
        let out = renderer()
            .render_str("{{ 'aGVsbG8=' | b64decode }}", &json!({}))
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_rstrip_filter() {
        let r = renderer();
        assert_eq!(
            r.render_str("{{ 'api/v1///' | rstrip('/') }}", &json!({}))
                .unwrap(),
            "api/v1"
        );
        assert_eq!(
            r.render_str("{{ 'padded   ' | rstrip }}", &json!({})).unwrap(),
            "padded"
        );
    }

    #[test]
    fn test_now_global_utc() {
        let out = renderer()
            .render_str("{{ now(tz='utc') }}", &json!({}))
            .unwrap();
        assert!(out.ends_with('Z'), "expected UTC instant, got {out}");
    }

    #[test]
    fn test_unknown_variable_in_single_expression_is_error_or_fallback() {
        // minijinja evaluates unknown names to undefined; serialization turns
        // that into null, which mirrors tolerant lookup in conditions.
        let out = renderer().render_value(&json!("{{ ghost }}"), &json!({}));
        assert!(out.is_ok());
    }
}
