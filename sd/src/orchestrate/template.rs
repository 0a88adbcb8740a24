//! Prompt template rendering
//!
//! `{{var}}` interpolation over a step's resolved variable map. Escaping is
//! disabled: prompts are plain text, not HTML.

use handlebars::Handlebars;

use crate::error::{ErrorCode, JobError};

pub fn render(template: &str, vars: &serde_json::Value) -> Result<String, JobError> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry
        .render_template(template, vars)
        .map_err(|e| JobError::user(ErrorCode::ValidationError, format!("prompt template error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_interpolation() {
        let out = render("Discuss {{topic}} in {{rounds}} rounds", &json!({"topic": "mixing", "rounds": 3})).unwrap();
        assert_eq!(out, "Discuss mixing in 3 rounds");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let out = render("value: {{missing}}", &json!({})).unwrap();
        assert_eq!(out, "value: ");
    }

    #[test]
    fn test_no_html_escaping() {
        let out = render("{{code}}", &json!({"code": "s(\"bd <sd>\")"})).unwrap();
        assert_eq!(out, "s(\"bd <sd>\")");
    }

    #[test]
    fn test_nested_path_interpolation() {
        let out = render("prior: {{steps.draft.output}}", &json!({"steps": {"draft": {"output": "v1"}}})).unwrap();
        assert_eq!(out, "prior: v1");
    }

    #[test]
    fn test_malformed_template_is_error() {
        let err = render("{{#if}}", &json!({})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}
