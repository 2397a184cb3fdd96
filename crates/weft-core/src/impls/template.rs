//! Minimal `{{ dotted.path }}` template renderer.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ports::{RenderError, TemplateRenderer};

#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleTemplateRenderer;

impl SimpleTemplateRenderer {
    pub fn new() -> Self {
        Self
    }
}

fn lookup<'a>(variables: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(variables, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl TemplateRenderer for SimpleTemplateRenderer {
    fn render(&self, template: &str, variables: &Value) -> Result<String, RenderError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(RenderError::Unterminated(template.to_string()));
            };
            let path = after[..end].trim();
            let value = lookup(variables, path)
                .ok_or_else(|| RenderError::UnknownVariable(path.to_string()))?;
            out.push_str(&stringify(value));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn render_date(&self, template: &str, variables: &Value) -> Result<DateTime<Utc>, RenderError> {
        let rendered = self.render(template, variables)?;
        DateTime::parse_from_rfc3339(rendered.trim())
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| RenderError::InvalidDate {
                value: rendered,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn vars() -> Value {
        json!({
            "flow": { "namespace": "company.team", "id": "parent" },
            "taskrun": { "iteration": 2, "items": ["a", "b"] },
            "inputs": { "when": "2024-01-01T12:00:00Z" }
        })
    }

    #[test]
    fn renders_nested_paths() {
        let r = SimpleTemplateRenderer::new();
        assert_eq!(
            r.render("{{ flow.namespace }}.child", &vars()).unwrap(),
            "company.team.child"
        );
        assert_eq!(r.render("batch-{{taskrun.iteration}}", &vars()).unwrap(), "batch-2");
        assert_eq!(r.render("{{ taskrun.items }}", &vars()).unwrap(), r#"["a","b"]"#);
        assert_eq!(r.render("{{ taskrun.items.1 }}", &vars()).unwrap(), "b");
        assert_eq!(r.render("plain", &vars()).unwrap(), "plain");
    }

    #[test]
    fn unknown_and_unterminated() {
        let r = SimpleTemplateRenderer::new();
        assert_eq!(
            r.render("{{ flow.revision }}", &vars()),
            Err(RenderError::UnknownVariable("flow.revision".into()))
        );
        assert!(matches!(
            r.render("{{ flow.id", &vars()),
            Err(RenderError::Unterminated(_))
        ));
    }

    #[test]
    fn renders_dates() {
        let r = SimpleTemplateRenderer::new();
        assert_eq!(
            r.render_date("{{ inputs.when }}", &vars()).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
        assert!(matches!(
            r.render_date("tomorrow", &vars()),
            Err(RenderError::InvalidDate { .. })
        ));
    }
}
