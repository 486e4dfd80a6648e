//! Per-run logs and run metadata
//!
//! One append-only UTF-8 log file and one metadata JSON per run, both under
//! the runs directory. The log begins with a header block naming the run;
//! metadata writes are staged and renamed so a crash never leaves a torn
//! file. `truncate_middle` prepares oversized logs for judge input by
//! keeping the head and tail around an elision marker.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::RunRecord;

/// Errors from run-log operations
#[derive(Debug, thiserror::Error)]
pub enum RunLogError {
    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Handle to the runs directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunLog {
    runs_dir: PathBuf,
}

impl RunLog {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub async fn ensure_runs_dir(&self) -> Result<(), RunLogError> {
        tokio::fs::create_dir_all(&self.runs_dir).await?;
        Ok(())
    }

    /// Absolute path of a run's log file
    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.log", run_id))
    }

    fn metadata_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id))
    }

    /// Create the log file with its header block and fill in the record's
    /// absolute `log_path`.
    pub async fn initialize_log(&self, run: &mut RunRecord) -> Result<(), RunLogError> {
        debug!(run_id = %run.run_id, "RunLog::initialize_log: called");
        self.ensure_runs_dir().await?;

        let log_path = self.log_path(&run.run_id);
        let log_path = std::path::absolute(&log_path)?;
        run.log_path = log_path.display().to_string();

        let mut header = String::new();
        header.push_str("==== run log ====\n");
        header.push_str(&format!("runId: {}\n", run.run_id));
        header.push_str(&format!("taskId: {}\n", run.task_id));
        header.push_str(&format!("agentType: {}\n", run.agent_type));
        header.push_str(&format!("metadata: {}\n", self.metadata_path(&run.run_id).display()));
        if let Some(planner_run_id) = &run.planner_run_id {
            header.push_str(&format!("plannerRunId: {}\n", planner_run_id));
        }
        if let Some(planner_log_path) = &run.planner_log_path {
            header.push_str(&format!("plannerLogPath: {}\n", planner_log_path));
        }
        let started = chrono::DateTime::from_timestamp_millis(run.started_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| run.started_at.to_string());
        header.push_str(&format!("startedAt: {}\n", started));
        header.push_str("=================\n\n");

        tokio::fs::write(&log_path, header).await?;
        Ok(())
    }

    /// Append text to a run's log. One writer per run, so plain append is
    /// race-free.
    pub async fn append(&self, run_id: &str, text: &str) -> Result<(), RunLogError> {
        let path = self.log_path(run_id);
        let mut file = tokio::fs::OpenOptions::new().append(true).create(true).open(&path).await?;
        file.write_all(text.as_bytes()).await?;
        Ok(())
    }

    /// Persist run metadata (staged write + rename)
    pub async fn save_metadata(&self, run: &RunRecord) -> Result<(), RunLogError> {
        debug!(run_id = %run.run_id, status = %run.status, "RunLog::save_metadata: called");
        self.ensure_runs_dir().await?;

        let path = self.metadata_path(&run.run_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(run)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load_metadata(&self, run_id: &str) -> Result<RunRecord, RunLogError> {
        let path = self.metadata_path(run_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RunLogError::NotFound(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn read_log(&self, run_id: &str) -> Result<String, RunLogError> {
        let path = self.log_path(run_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RunLogError::NotFound(run_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// All run records with metadata on disk, newest first
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>, RunLogError> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.runs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<RunRecord>(&bytes) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run metadata"),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}

/// Cut a text down to roughly `budget` bytes, keeping the head and tail and
/// eliding the middle. Splits at char boundaries.
pub fn truncate_middle(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }

    const MARKER: &str = "\n\n[... log truncated ...]\n\n";
    let keep = budget.saturating_sub(MARKER.len());
    let head_len = keep / 2;
    let tail_len = keep - head_len;

    let head_end = floor_char_boundary(text, head_len);
    let tail_start = ceil_char_boundary(text, text.len() - tail_len);

    format!("{}{}{}", &text[..head_end], MARKER, &text[tail_start..])
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
