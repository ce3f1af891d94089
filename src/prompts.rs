//! Prompt source for payload requests.
//!
//! Prompts are loaded once, up front, and handed out cyclically by request
//! index: request `i` of a level always carries prompt `i mod N`, so two runs
//! of the same level send the same prompts regardless of scheduling.
//!
//! Supported files:
//! - `.jsonl`: one JSON object per line with a `question` or `prompt` field
//! - `.csv`: a header row with a `prompt` or `question` column
//! - anything else: one prompt per non-empty line

use serde_json::Value;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur when loading prompts.
#[derive(Error, Debug)]
pub enum PromptSourceError {
    #[error("Failed to read prompt file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to read CSV prompt file: {0}")]
    CsvReadError(#[from] csv::Error),

    #[error("CSV prompt file has no 'prompt' or 'question' column (headers: {0:?})")]
    MissingColumn(Vec<String>),

    #[error("Prompt source contains no prompts")]
    Empty,
}

const PROMPT_FIELDS: [&str; 2] = ["question", "prompt"];

/// Ordered, immutable list of prompts shared by all workers.
#[derive(Debug, Clone)]
pub struct PromptSource {
    prompts: Arc<Vec<String>>,
}

impl PromptSource {
    /// Build a source from in-memory prompts.
    ///
    /// # Errors
    /// Returns [`PromptSourceError::Empty`] when `prompts` is empty.
    pub fn new(prompts: Vec<String>) -> Result<Self, PromptSourceError> {
        if prompts.is_empty() {
            return Err(PromptSourceError::Empty);
        }
        Ok(Self {
            prompts: Arc::new(prompts),
        })
    }

    /// Load prompts from a file, choosing the format by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PromptSourceError> {
        let path_ref = path.as_ref();
        info!(path = ?path_ref, "Loading prompt file");

        let extension = path_ref
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let prompts = match extension.as_deref() {
            Some("jsonl") => parse_jsonl(&std::fs::read_to_string(path_ref)?),
            Some("csv") => parse_csv(File::open(path_ref)?)?,
            _ => parse_lines(&std::fs::read_to_string(path_ref)?),
        };

        info!(path = ?path_ref, prompts = prompts.len(), "Prompts loaded");
        Self::new(prompts)
    }

    /// Prompt for request `index`, wrapping around the list.
    pub fn get(&self, index: usize) -> &str {
        &self.prompts[index % self.prompts.len()]
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

fn parse_jsonl(content: &str) -> Vec<String> {
    let mut prompts = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping unparsable prompt line");
                continue;
            }
        };

        let prompt = PROMPT_FIELDS
            .iter()
            .find_map(|field| parsed.get(*field).and_then(Value::as_str));

        match prompt {
            Some(p) if !p.trim().is_empty() => prompts.push(p.to_string()),
            _ => warn!(
                line = line_no + 1,
                "Skipping prompt line without a 'question' or 'prompt' string"
            ),
        }
    }

    prompts
}

fn parse_csv<R: std::io::Read>(reader: R) -> Result<Vec<String>, PromptSourceError> {
    let mut reader = csv::Reader::from_reader(reader);

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    debug!(headers = ?headers, "CSV prompt headers loaded");

    let column = ["prompt", "question"]
        .iter()
        .find_map(|name| headers.iter().position(|h| h.eq_ignore_ascii_case(name)))
        .ok_or_else(|| PromptSourceError::MissingColumn(headers.clone()))?;

    let mut prompts = Vec::new();
    for result in reader.records() {
        let record = result?;
        if let Some(value) = record.get(column) {
            if !value.trim().is_empty() {
                prompts.push(value.to_string());
            }
        }
    }

    Ok(prompts)
}

fn parse_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
