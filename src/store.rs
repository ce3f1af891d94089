//! Persistence for sweep results.
//!
//! The engine only produces [`SweepResult`] values; the binary hands them to
//! a [`ResultStore`]. [`JsonFileStore`] keeps one pretty-printed JSON file
//! per run, named after the run id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::scheduler::{SweepMode, SweepResult, SweepStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode run {run_id}: {source}")]
    Serde {
        run_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Run '{0}' not found")]
    NotFound(String),

    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),
}

/// One line of run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub api_name: String,
    pub test_name: String,
    pub mode: SweepMode,
    pub status: SweepStatus,
    pub started_at: DateTime<Utc>,
    pub level_count: usize,
    pub total_requests: usize,
    pub optimal_level: Option<u32>,
}

impl From<&SweepResult> for RunSummary {
    fn from(result: &SweepResult) -> Self {
        Self {
            run_id: result.run_id.clone(),
            api_name: result.labels.api_name.clone(),
            test_name: result.labels.test_name.clone(),
            mode: result.mode,
            status: result.status,
            started_at: result.started_at,
            level_count: result.levels.len(),
            total_requests: result.totals.total_requests,
            optimal_level: result.optimal().map(|o| o.level),
        }
    }
}

/// Append-only store of sweep results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, result: &SweepResult) -> Result<(), StoreError>;

    async fn load(&self, run_id: &str) -> Result<SweepResult, StoreError>;

    /// Most recent runs first, at most `limit` of them.
    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError>;
}

/// Directory of `<run_id>.json` files.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// The directory is created on first save.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidRunId(run_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", run_id)))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ResultStore for JsonFileStore {
    async fn save(&self, result: &SweepResult) -> Result<(), StoreError> {
        let path = self.path_for(&result.run_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        let json = serde_json::to_vec_pretty(result).map_err(|source| StoreError::Serde {
            run_id: result.run_id.clone(),
            source,
        })?;

        // A run file on disk is always complete.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_error(&path))?;

        debug!(run_id = %result.run_id, path = %path.display(), "Saved sweep result");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<SweepResult, StoreError> {
        let path = self.path_for(run_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(run_id.to_string()))
            }
            Err(e) => return Err(io_error(&path)(e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde {
            run_id: run_id.to_string(),
            source,
        })
    }

    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(io_error(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(run_id).await {
                Ok(result) => summaries.push(RunSummary::from(&result)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable result"),
            }
        }

        summaries.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        summaries.truncate(limit);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{SweepAnalysis, SweepTotals};
    use crate::scheduler::RunLabels;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn result(run_id: &str, minute: u32) -> SweepResult {
        let started_at = Utc.with_ymd_and_hms(2026, 10, 15, 9, minute, 0).unwrap();
        SweepResult {
            run_id: run_id.to_string(),
            labels: RunLabels {
                api_name: "openai".to_string(),
                test_name: "quick".to_string(),
                endpoint: "chat".to_string(),
            },
            mode: SweepMode::Sweep,
            status: SweepStatus::Completed,
            started_at,
            finished_at: started_at + chrono::Duration::seconds(30),
            levels: Vec::new(),
            network: None,
            analysis: SweepAnalysis::default(),
            error_taxonomy: BTreeMap::new(),
            totals: SweepTotals::default(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("results"));

        let original = result("run_a", 1);
        store.save(&original).await.unwrap();
        let loaded = store.load("run_a").await.unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(matches!(
            store.load("run_missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(matches!(
            store.load("../etc/passwd").await,
            Err(StoreError::InvalidRunId(_))
        ));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        for (id, minute) in [("run_b", 2), ("run_a", 1), ("run_c", 3)] {
            store.save(&result(id, minute)).await.unwrap();
        }
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let listed = store.list(2).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run_c", "run_b"]);
        assert_eq!(listed[0].api_name, "openai");
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("never-created"));
        assert!(store.list(10).await.unwrap().is_empty());
    }
}
