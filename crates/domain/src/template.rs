//! Payload templates rendered with a Jinja-compatible engine.

use std::sync::OnceLock;

use minijinja::Environment;
use serde::Serialize;

use crate::error::TemplateError;

fn environment() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(Environment::new)
}

/// Render `source` against `context`.
///
/// # Errors
///
/// Returns [`TemplateError::Render`] on syntax errors or failed lookups.
pub fn render(source: &str, context: impl Serialize) -> Result<String, TemplateError> {
    Ok(environment().render_str(source, context)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn should_render_values_from_context() {
        let out = render("{{ value }}%", json!({"value": 42})).unwrap();
        assert_eq!(out, "42%");
    }

    #[test]
    fn should_render_nested_lookups() {
        let out = render(
            "{{ device.uid }}:{{ currentState.state }}",
            json!({"device": {"uid": "lamp"}, "currentState": {"state": "on"}}),
        )
        .unwrap();
        assert_eq!(out, "lamp:on");
    }

    #[test]
    fn should_fail_on_syntax_error() {
        assert!(render("{{ value ", json!({})).is_err());
    }
}
