//! Template-driven request construction.
//!
//! An [`ApiProfile`] describes how to talk to one inference API: base URL,
//! endpoint paths, header templates and a JSON body template. Placeholders use
//! `{name}` syntax. URL and header placeholders must all resolve from the
//! variable map (`api_key`, `deployment_name`, ...); body strings additionally
//! receive `{prompt}`.
//!
//! Substitution is a single pass over the template, so text inserted from a
//! prompt is never scanned for placeholders again.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::extractor::TokenUsageRule;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid");
}

/// Named values substituted into templates.
pub type TemplateVars = BTreeMap<String, String>;

/// Errors raised while turning a profile into a concrete request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("No value for placeholder '{{{name}}}' in '{template}'")]
    MissingVariable { name: String, template: String },

    #[error("Profile has no endpoint named '{0}'")]
    UnknownEndpoint(String),

    #[error("Invalid header '{name}': {message}")]
    InvalidHeader { name: String, message: String },
}

/// One API profile as it appears under `api_configs` in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiProfile {
    pub name: String,

    pub base_url: String,

    /// HTTP method used for payload requests
    #[serde(default = "default_method")]
    pub method: String,

    /// Endpoint name -> path template (e.g. "chat" -> "/chat/completions")
    pub endpoints: BTreeMap<String, String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    pub request_format: Value,

    #[serde(default)]
    pub token_usage: TokenUsageRule,

    /// Statuses treated as rate limiting (retryable)
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,

    /// Optional health endpoint used by the network prober
    #[serde(default)]
    pub health_url: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_retryable_statuses() -> Vec<u16> {
    vec![429]
}

/// A fully substituted request, ready to hand to an HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Substitute every placeholder in `template`; any unresolved name is an error.
pub fn substitute(template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        let name = &caps[1];
        let value = vars.get(name).ok_or_else(|| TemplateError::MissingVariable {
            name: name.to_string(),
            template: template.to_string(),
        })?;
        out.push_str(&template[last..whole.start]);
        out.push_str(value);
        last = whole.end;
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Substitute `{prompt}` and known variables in a body string.
///
/// Unknown placeholders are left untouched: request bodies legitimately carry
/// braces (JSON schemas, code samples) that are not template variables.
fn substitute_body_str(template: &str, prompt: &str, vars: &TemplateVars) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            if name == "prompt" {
                prompt.to_string()
            } else if let Some(value) = vars.get(name) {
                value.clone()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

fn substitute_body(value: &Value, prompt: &str, vars: &TemplateVars) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_body_str(s, prompt, vars)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_body(item, prompt, vars))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_body(v, prompt, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl ApiProfile {
    /// Resolve the full URL for a named endpoint.
    pub fn format_url(&self, endpoint: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
        let path = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| TemplateError::UnknownEndpoint(endpoint.to_string()))?;
        let base = substitute(&self.base_url, vars)?;
        let path = substitute(path, vars)?;
        Ok(format!("{}{}", base, path))
    }

    /// Resolve every header template.
    pub fn format_headers(&self, vars: &TemplateVars) -> Result<Vec<(String, String)>, TemplateError> {
        self.headers
            .iter()
            .map(|(name, value)| Ok((name.clone(), substitute(value, vars)?)))
            .collect()
    }

    /// Build the JSON body for one prompt.
    pub fn format_body(&self, prompt: &str, vars: &TemplateVars) -> Value {
        substitute_body(&self.request_format, prompt, vars)
    }
}

/// Build a request for `prompt` against `endpoint` of `profile`.
///
/// This is the only place the engine learns anything about an API's schema.
pub fn build_request(
    profile: &ApiProfile,
    endpoint: &str,
    prompt: &str,
    vars: &TemplateVars,
) -> Result<PreparedRequest, TemplateError> {
    Ok(PreparedRequest {
        method: profile.method.to_uppercase(),
        url: profile.format_url(endpoint, vars)?,
        headers: profile.format_headers(vars)?,
        body: profile.format_body(prompt, vars),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn openai_profile() -> ApiProfile {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("chat".to_string(), "/chat/completions".to_string());
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer {api_key}".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        ApiProfile {
            name: "OpenAI".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            method: default_method(),
            endpoints,
            headers,
            request_format: json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "{prompt}"}],
                "max_tokens": 256
            }),
            token_usage: TokenUsageRule::Usage,
            retryable_statuses: default_retryable_statuses(),
            health_url: None,
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute_all_placeholders() {
        let v = vars(&[("resource", "east"), ("deployment", "gpt4")]);
        assert_eq!(
            substitute("https://{resource}.example.com/deployments/{deployment}", &v).unwrap(),
            "https://east.example.com/deployments/gpt4"
        );
    }

    #[test]
    fn test_substitute_missing_variable() {
        let err = substitute("Bearer {api_key}", &TemplateVars::new()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingVariable {
                name: "api_key".to_string(),
                template: "Bearer {api_key}".to_string()
            }
        );
    }

    #[test]
    fn test_build_request() {
        let profile = openai_profile();
        let req = build_request(&profile, "chat", "Hello?", &vars(&[("api_key", "sk-1")])).unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "https://api.openai.com/v1/chat/completions");
        assert!(req
            .headers
            .contains(&("Authorization".to_string(), "Bearer sk-1".to_string())));
        assert_eq!(req.body["messages"][0]["content"], "Hello?");
        assert_eq!(req.body["max_tokens"], 256);
    }

    #[test]
    fn test_prompt_text_is_not_rescanned() {
        let profile = openai_profile();
        let req = build_request(
            &profile,
            "chat",
            "literal {api_key} in prompt",
            &vars(&[("api_key", "secret")]),
        )
        .unwrap();
        assert_eq!(
            req.body["messages"][0]["content"],
            "literal {api_key} in prompt"
        );
    }

    #[test]
    fn test_unknown_body_placeholder_is_kept() {
        let mut profile = openai_profile();
        profile.request_format = json!({"input": "{prompt} {format}"});
        let req = build_request(&profile, "chat", "hi", &vars(&[("api_key", "k")])).unwrap();
        assert_eq!(req.body["input"], "hi {format}");
    }

    #[test]
    fn test_unknown_endpoint() {
        let profile = openai_profile();
        let err = build_request(&profile, "embeddings", "x", &vars(&[("api_key", "k")])).unwrap_err();
        assert_eq!(err, TemplateError::UnknownEndpoint("embeddings".to_string()));
    }

    #[test]
    fn test_missing_header_variable_fails_build() {
        let profile = openai_profile();
        let err = build_request(&profile, "chat", "x", &TemplateVars::new()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingVariable { .. }));
    }
}
