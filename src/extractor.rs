//! Token-count extraction from API responses.
//!
//! The engine does not understand response schemas. A profile supplies a
//! [`TokenUsageRule`] and the executor compiles it once into a
//! [`TokenExtractor`], which pulls an optional token count out of each
//! successful response body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json_path::JsonPath;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during token extraction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Invalid JSONPath '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("Invalid JSON response: {0}")]
    InvalidJson(String),
}

/// How to find the token count in a response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TokenUsageRule {
    /// Auto-detect a `usage` object: OpenAI style `total_tokens`, or Claude
    /// style `input_tokens + output_tokens`.
    #[default]
    Usage,

    /// Read a single numeric value at a JSONPath.
    JsonPath { path: String },

    /// Responses carry no token information.
    None,
}

/// A compiled [`TokenUsageRule`].
#[derive(Debug, Clone)]
pub enum TokenExtractor {
    Usage,
    JsonPath { path: JsonPath, source: String },
    None,
}

impl TokenExtractor {
    /// Compile a rule. An unparsable JSONPath is reported here, before any
    /// request is sent.
    pub fn new(rule: &TokenUsageRule) -> Result<Self, ExtractionError> {
        match rule {
            TokenUsageRule::Usage => Ok(TokenExtractor::Usage),
            TokenUsageRule::None => Ok(TokenExtractor::None),
            TokenUsageRule::JsonPath { path } => {
                let compiled = JsonPath::parse(path).map_err(|e| ExtractionError::InvalidPath {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                Ok(TokenExtractor::JsonPath {
                    path: compiled,
                    source: path.clone(),
                })
            }
        }
    }

    /// Extract a token count from a response body.
    ///
    /// `Ok(None)` means the body was understood but carried no count.
    /// `Err(InvalidJson)` means the body is not JSON at all, which the
    /// executor records as a malformed response.
    ///
    /// # Example
    /// ```
    /// use rust_apisweep::extractor::{TokenExtractor, TokenUsageRule};
    ///
    /// let extractor = TokenExtractor::new(&TokenUsageRule::Usage).unwrap();
    /// let body = br#"{"usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}}"#;
    /// assert_eq!(extractor.extract(body).unwrap(), Some(42));
    /// ```
    pub fn extract(&self, body: &[u8]) -> Result<Option<u64>, ExtractionError> {
        let json = match self {
            TokenExtractor::None => return Ok(None),
            _ => serde_json::from_slice::<Value>(body)
                .map_err(|e| ExtractionError::InvalidJson(e.to_string()))?,
        };

        let tokens = match self {
            TokenExtractor::Usage => extract_usage(&json),
            TokenExtractor::JsonPath { path, source } => {
                let found = path.query(&json).exactly_one().ok().and_then(as_count);
                if found.is_none() {
                    debug!(json_path = %source, "Token JSONPath did not match a single number");
                }
                found
            }
            TokenExtractor::None => None,
        };

        Ok(tokens)
    }
}

fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn extract_usage(json: &Value) -> Option<u64> {
    let usage = json.get("usage")?;

    if let Some(total) = usage.get("total_tokens").and_then(as_count) {
        return Some(total);
    }

    let input = usage.get("input_tokens").and_then(as_count);
    let output = usage.get("output_tokens").and_then(as_count);
    match (input, output) {
        (None, None) => None,
        (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
    }
}
