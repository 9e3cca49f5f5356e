//! Per-run artifact directories under `artifacts/abm_runs/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use harness_protocol::canonical;
use harness_protocol::{LifecycleAggregates, RunAggregates, RunId};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, instrument};

use crate::aggregate::{compute_lifecycle_aggregates, compute_run_aggregates};
use crate::replay::{ReplayOutcome, check_replay};
use crate::summary::render_summary;
use crate::{EventLog, FileEventLog};

pub const LATEST_FILE: &str = "LATEST";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const AGGREGATES_FILE: &str = "aggregates.json";
pub const SUMMARY_FILE: &str = "summary.md";
pub const PARTIAL_AGGREGATES_FILE: &str = "aggregates_partial.json";
pub const PARTIAL_SUMMARY_FILE: &str = "summary_partial.md";

/// Writes `value` as pretty JSON with recursively sorted keys.
pub async fn write_pretty_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed creating {parent:?}"))?;
    }
    let text = canonical::to_pretty_sorted(value).context("failed serializing json")?;
    fs::write(path, text)
        .await
        .with_context(|| format!("failed writing {path:?}"))?;
    Ok(())
}

/// Recomputes lifecycle aggregates from `log` and persists them.
pub async fn write_lifecycle_aggregates(
    log: &dyn EventLog,
    path: &Path,
) -> Result<LifecycleAggregates> {
    let aggregates = compute_lifecycle_aggregates(&log.read_all().await?);
    write_pretty_json(path, &aggregates).await?;
    debug!(path = %path.display(), "lifecycle aggregates written");
    Ok(aggregates)
}

pub async fn check_lifecycle_replay(log: &dyn EventLog, path: &Path) -> Result<ReplayOutcome> {
    let aggregates = compute_lifecycle_aggregates(&log.read_all().await?);
    check_replay(path, &aggregates).await
}

#[derive(Debug, Clone)]
pub struct RunArtifacts {
    root: PathBuf,
}

impl RunArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    pub fn events_log(&self, run_id: &RunId) -> FileEventLog {
        FileEventLog::new(self.run_dir(run_id).join(EVENTS_FILE))
    }

    pub fn aggregates_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(AGGREGATES_FILE)
    }

    pub async fn create(&self, run_id: &RunId) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed creating run dir {dir:?}"))?;
        Ok(dir)
    }

    pub async fn write_latest(&self, run_id: &RunId) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let path = self.root.join(LATEST_FILE);
        fs::write(&path, format!("{run_id}\n"))
            .await
            .with_context(|| format!("failed writing {path:?}"))?;
        Ok(())
    }

    pub async fn read_latest(&self) -> Result<Option<RunId>> {
        let path = self.root.join(LATEST_FILE);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).await?;
        let trimmed = raw.trim();
        Ok((!trimmed.is_empty()).then(|| RunId::from(trimmed)))
    }

    /// `run_id` if given, else the id recorded in `LATEST`.
    pub async fn resolve(&self, run_id: Option<&str>) -> Result<RunId> {
        match run_id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(RunId::from(id)),
            None => self
                .read_latest()
                .await?
                .ok_or_else(|| anyhow!("missing {}", self.root.join(LATEST_FILE).display())),
        }
    }

    /// Run ids with a directory under the root, sorted.
    pub async fn list(&self) -> Result<Vec<RunId>> {
        let mut ids = Vec::new();
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(ids);
        }
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(RunId::from(entry.file_name().to_string_lossy().as_ref()));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Recomputes the run's telemetry aggregates and writes the aggregates
    /// file and the markdown summary. Returns the aggregates path.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn aggregate(&self, run_id: &RunId, partial: bool) -> Result<(PathBuf, RunAggregates)> {
        let events = self.events_log(run_id).read_all().await?;
        let aggregates = compute_run_aggregates(run_id, &events);
        let dir = self.run_dir(run_id);
        let (aggregates_name, summary_name) = if partial {
            (PARTIAL_AGGREGATES_FILE, PARTIAL_SUMMARY_FILE)
        } else {
            (AGGREGATES_FILE, SUMMARY_FILE)
        };
        let aggregates_path = dir.join(aggregates_name);
        write_pretty_json(&aggregates_path, &aggregates).await?;
        fs::write(dir.join(summary_name), render_summary(&aggregates.telemetry))
            .await
            .with_context(|| format!("failed writing summary in {dir:?}"))?;
        debug!(events = aggregates.event_count, "run aggregates written");
        Ok((aggregates_path, aggregates))
    }

    pub async fn load_aggregates(&self, run_id: &RunId) -> Result<RunAggregates> {
        let path = self.aggregates_path(run_id);
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("missing aggregates {path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid aggregates {path:?}"))
    }

    pub async fn check_replay(&self, run_id: &RunId) -> Result<ReplayOutcome> {
        let events = self.events_log(run_id).read_all().await?;
        check_replay(
            &self.aggregates_path(run_id),
            &compute_run_aggregates(run_id, &events),
        )
        .await
    }
}
