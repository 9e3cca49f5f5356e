//! Append-only event logs and their derived aggregates.
//!
//! - [`FileEventLog`] appends one canonical JSON line per record and flushes
//!   to disk before returning, so an interrupted run leaves a valid prefix.
//! - [`EventJournal`] pairs a log with an [`EventStreamHub`] for live echo.
//! - [`aggregate`] holds the lifecycle and telemetry aggregators.
//! - [`replay`] checks persisted aggregates against a fresh recomputation.
//! - [`runs`] lays out per-run directories (telemetry log, aggregates, summary).
//! - [`watch`] tails a live log into an [`EventStreamHub`].

pub mod aggregate;
pub mod replay;
pub mod runs;
pub mod summary;
pub mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use harness_protocol::canonical;
use harness_protocol::{CycleId, EventRecord, RunId};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

pub use aggregate::{compute_lifecycle_aggregates, compute_telemetry_aggregates};
pub use replay::{ReplayOutcome, check_replay};
pub use runs::RunArtifacts;
pub use watch::EventTail;

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: &EventRecord) -> Result<()>;
    async fn read_all(&self) -> Result<Vec<EventRecord>>;

    /// `cycle-{max+1:04}` over lifecycle records of `run_id`; derived from
    /// log content alone so numbering resumes after an interruption.
    async fn next_cycle_id(&self, run_id: &RunId) -> Result<CycleId> {
        let max = self
            .read_all()
            .await?
            .iter()
            .filter_map(EventRecord::as_lifecycle)
            .filter(|event| event.run_id == *run_id)
            .filter_map(|event| event.cycle_id.as_ref().and_then(CycleId::index))
            .max()
            .unwrap_or(0);
        Ok(CycleId::from_index(max.saturating_add(1)))
    }
}

#[derive(Debug, Clone)]
pub struct FileEventLog {
    path: PathBuf,
}

impl FileEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create events dir {parent:?}"))?;
        }
        Ok(())
    }
}

/// Parses a JSONL event log. An unterminated final line that does not parse
/// is the remnant of an interrupted append and is skipped.
pub fn parse_event_lines(raw: &str, origin: &Path) -> Result<Vec<EventRecord>> {
    let terminated = raw.ends_with('\n');
    let lines: Vec<&str> = raw.lines().collect();
    let mut events = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(event) => events.push(event),
            Err(error) if idx + 1 == lines.len() && !terminated => {
                warn!(path = ?origin, %error, "ignoring truncated final event line");
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed parsing event line {} in {origin:?}", idx + 1));
            }
        }
    }
    Ok(events)
}

#[async_trait]
impl EventLog for FileEventLog {
    #[instrument(skip(self, event), fields(path = %self.path.display()))]
    async fn append(&self, event: &EventRecord) -> Result<()> {
        Self::ensure_parent(&self.path).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed opening event log {:?}", self.path))?;

        let line = canonical::to_canonical_line(event).context("failed serializing event")?;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;
        debug!("event appended to log");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn read_all(&self) -> Result<Vec<EventRecord>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed reading event log {:?}", self.path))?;
        let events = parse_event_lines(&raw, &self.path)?;
        debug!(count = events.len(), "events loaded from log");
        Ok(events)
    }
}

#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<EventRecord>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: EventRecord) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }
}

/// A log plus live fan-out to subscribers.
#[derive(Clone)]
pub struct EventJournal {
    log: Arc<dyn EventLog>,
    stream: EventStreamHub,
}

impl EventJournal {
    pub fn new(log: Arc<dyn EventLog>, stream: EventStreamHub) -> Self {
        Self { log, stream }
    }

    pub async fn append_and_publish(&self, event: EventRecord) -> Result<()> {
        self.log.append(&event).await?;
        self.stream.publish(event);
        debug!("event published to stream");
        Ok(())
    }

    pub async fn read_all(&self) -> Result<Vec<EventRecord>> {
        self.log.read_all().await
    }

    pub async fn next_cycle_id(&self, run_id: &RunId) -> Result<CycleId> {
        self.log.next_cycle_id(run_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.stream.subscribe()
    }
}
