//! The dispatch document on disk.
//!
//! One explicit store object owns the file; every read re-parses it and
//! every write replaces it whole. There is no locking: a single control
//! loop per repository is the only writer.

use std::path::{Path, PathBuf};

use harness_protocol::canonical;
use harness_protocol::{ContentHash, Dispatch, HarnessError, HarnessResult};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct DispatchStore {
    path: PathBuf,
}

impl DispatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Raw JSON, before any schema check.
    pub async fn load_value(&self) -> HarnessResult<Value> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(HarnessError::NotFound(format!(
                    "dispatch missing: {}",
                    self.path.display()
                )));
            }
            Err(error) => return Err(HarnessError::io_at(&self.path, error)),
        };
        serde_json::from_slice(&raw).map_err(|error| {
            HarnessError::schema(format!("dispatch.json invalid json: {error}"))
        })
    }

    pub async fn load(&self) -> HarnessResult<Dispatch> {
        Dispatch::from_value(self.load_value().await?)
    }

    /// Rewrites the file as pretty JSON with sorted keys.
    #[instrument(skip(self, dispatch), fields(path = %self.path.display()))]
    pub async fn save(&self, dispatch: &Dispatch) -> HarnessResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| HarnessError::io_at(parent, error))?;
        }
        let text = canonical::to_pretty_sorted(dispatch)?;
        fs::write(&self.path, text)
            .await
            .map_err(|error| HarnessError::io_at(&self.path, error))?;
        debug!("dispatch saved");
        Ok(())
    }

    /// Canonical line form of the current document: the exact bytes of its
    /// snapshot.
    pub async fn canonical_bytes(&self) -> HarnessResult<Vec<u8>> {
        let value = self.load_value().await?;
        let mut bytes = canonical::value_to_canonical_bytes(&value);
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub async fn hash(&self) -> HarnessResult<ContentHash> {
        Ok(canonical::digest(&self.canonical_bytes().await?))
    }
}
