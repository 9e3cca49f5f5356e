//! Incremental reads of a growing event log.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use harness_protocol::EventRecord;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::{EventStreamHub, parse_event_lines};

/// Follows an append-only JSONL log from a byte offset and publishes each
/// complete record to a hub. A trailing line without its newline stays
/// unread until a later poll sees it finished.
#[derive(Debug)]
pub struct EventTail {
    path: PathBuf,
    offset: u64,
    hub: EventStreamHub,
}

impl EventTail {
    pub fn new(path: impl Into<PathBuf>, hub: EventStreamHub) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            hub,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Publishes the records appended since the last poll and returns how
    /// many were published. A missing log yields nothing; a log shorter
    /// than the offset was replaced and is read again from the start.
    pub async fn poll(&mut self) -> Result<usize> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(0);
        }
        let mut file = File::open(&self.path)
            .await
            .with_context(|| format!("failed opening event log {:?}", self.path))?;
        let len = file.metadata().await?.len();
        if len < self.offset {
            warn!(path = ?self.path, offset = self.offset, len, "event log shrank, reading from start");
            self.offset = 0;
        }
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let Some(end) = buf.iter().rposition(|byte| *byte == b'\n') else {
            return Ok(0);
        };
        self.offset += end as u64 + 1;
        let chunk = String::from_utf8_lossy(&buf[..=end]);
        let records = self.parse_chunk(&chunk);
        let published = records.len();
        for record in records {
            self.hub.publish(record);
        }
        debug!(published, offset = self.offset, "event log tailed");
        Ok(published)
    }

    fn parse_chunk(&self, chunk: &str) -> Vec<EventRecord> {
        match parse_event_lines(chunk, &self.path) {
            Ok(records) => records,
            Err(error) => {
                warn!(path = ?self.path, error = %format!("{error:#}"), "skipping unparsable event lines");
                chunk
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .filter_map(|line| serde_json::from_str::<EventRecord>(line).ok())
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_test_root;
    use crate::{EventLog, FileEventLog};
    use harness_protocol::TelemetryEvent;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn tail_publishes_only_new_complete_lines() -> Result<()> {
        let root = unique_test_root("harness-tail");
        let path = root.join("events.jsonl");
        let log = FileEventLog::new(&path);
        let hub = EventStreamHub::new(16);
        let mut events = hub.subscribe();
        let mut tail = EventTail::new(&path, hub);

        assert_eq!(tail.poll().await?, 0);
        log.append(&TelemetryEvent::new("step", "build").with_ms(1.0).into())
            .await?;
        assert_eq!(tail.poll().await?, 1);
        assert_eq!(tail.poll().await?, 0);

        let mut file = fs::OpenOptions::new().append(true).open(&path).await?;
        file.write_all(br#"{"kind":"error","name":"te"#).await?;
        file.flush().await?;
        assert_eq!(tail.poll().await?, 0);
        file.write_all(b"st\",\"meta\":{}}\nnot json\n").await?;
        file.flush().await?;
        assert_eq!(tail.poll().await?, 1);

        let first = events.try_recv()?;
        assert_eq!(first.as_telemetry().map(|e| e.name.as_str()), Some("build"));
        let second = events.try_recv()?;
        assert_eq!(second.as_telemetry().map(|e| e.name.as_str()), Some("test"));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn replaced_log_is_read_from_start() -> Result<()> {
        let root = unique_test_root("harness-tail-reset");
        let path = root.join("events.jsonl");
        let log = FileEventLog::new(&path);
        let mut tail = EventTail::new(&path, EventStreamHub::new(16));
        log.append(&TelemetryEvent::new("step", "a").into()).await?;
        log.append(&TelemetryEvent::new("step", "b").into()).await?;
        assert_eq!(tail.poll().await?, 2);

        fs::remove_file(&path).await?;
        log.append(&TelemetryEvent::new("retry", "c").into()).await?;
        assert_eq!(tail.poll().await?, 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
