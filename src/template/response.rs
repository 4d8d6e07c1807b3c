//! Parsing of the LLM's fill response.
//!
//! The model is asked for `{"filled_template": ..., "variables": {...}}` but
//! frequently wraps it in prose or answers in `name: value` lines instead, so
//! parsing is a strategy behind [`ResponseParser`].

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::BTreeMap;

/// What could be recovered from a response. Values are raw strings; missing
/// variables are simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFill {
    pub filled_template: Option<String>,
    pub variables: BTreeMap<String, String>,
}

pub trait ResponseParser: Send + Sync {
    /// `None` when the strategy does not apply to this response.
    fn parse(&self, response: &str, variables: &[String]) -> Option<ParsedFill>;
}

/// Reads the outermost `{...}` span as JSON.
#[derive(Debug, Default)]
pub struct JsonResponseParser;

impl ResponseParser for JsonResponseParser {
    fn parse(&self, response: &str, _variables: &[String]) -> Option<ParsedFill> {
        let start = response.find('{')?;
        let end = response.rfind('}')?;
        if end <= start {
            return None;
        }

        let parsed: Value = serde_json::from_str(&response[start..=end]).ok()?;
        let object = parsed.as_object()?;

        let filled_template = object
            .get("filled_template")
            .and_then(Value::as_str)
            .map(str::to_string);

        let variables = object
            .get("variables")
            .and_then(Value::as_object)
            .map(|vars| {
                vars.iter()
                    .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
                    .collect()
            })
            .unwrap_or_default();

        Some(ParsedFill {
            filled_template,
            variables,
        })
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Looks for `name: value`, `{{name}}: value` or `"name": "value"` per variable.
#[derive(Debug, Default)]
pub struct PatternResponseParser;

impl PatternResponseParser {
    fn patterns(name: &str) -> Vec<Regex> {
        let escaped = regex::escape(name);
        [
            format!(r"\{{\{{{}\}}\}}:[ \t]*([^\n]+)", escaped),
            format!(r#""{}":\s*"([^"]+)""#, escaped),
            format!(r"(?m)^[\s\-*]*{}:[ \t]*([^\n]+)", escaped),
        ]
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
    }
}

impl ResponseParser for PatternResponseParser {
    fn parse(&self, response: &str, variables: &[String]) -> Option<ParsedFill> {
        let mut found = BTreeMap::new();

        for name in variables {
            let value = Self::patterns(name).iter().find_map(|re| {
                re.captures(response)
                    .map(|c| clean_value(&c[1]))
                    .filter(|v| !v.is_empty())
            });
            if let Some(value) = value {
                found.insert(name.clone(), value);
            }
        }

        if found.is_empty() {
            return None;
        }
        Some(ParsedFill {
            filled_template: None,
            variables: found,
        })
    }
}

fn clean_value(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(',')
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

/// Tries `primary`, and consults `fallback` for whatever it left unresolved.
pub struct TwoStageParser {
    primary: Box<dyn ResponseParser>,
    fallback: Box<dyn ResponseParser>,
}

impl TwoStageParser {
    pub fn new(primary: Box<dyn ResponseParser>, fallback: Box<dyn ResponseParser>) -> Self {
        Self { primary, fallback }
    }
}

impl Default for TwoStageParser {
    fn default() -> Self {
        Self::new(
            Box::new(JsonResponseParser),
            Box::new(PatternResponseParser),
        )
    }
}

impl ResponseParser for TwoStageParser {
    fn parse(&self, response: &str, variables: &[String]) -> Option<ParsedFill> {
        let primary = self.primary.parse(response, variables);

        let missing: Vec<String> = variables
            .iter()
            .filter(|v| {
                primary
                    .as_ref()
                    .and_then(|p| p.variables.get(*v))
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        if missing.is_empty() {
            return primary;
        }

        match (primary, self.fallback.parse(response, &missing)) {
            (Some(mut parsed), Some(extra)) => {
                parsed.variables.extend(extra.variables);
                Some(parsed)
            }
            (primary, None) => primary,
            (None, fallback) => fallback,
        }
    }
}
