use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use harness_protocol::Clock;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only `{timestamp} {text}` lines in `docs/STATUS.md`.
#[derive(Clone)]
pub struct StatusJournal {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl StatusJournal {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating {parent:?}"))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed opening status journal {:?}", self.path))?;
        let line = format!("{} {text}\n", self.clock.now_utc());
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed appending to {:?}", self.path))?;
        file.flush().await?;
        Ok(())
    }
}
