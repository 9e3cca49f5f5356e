use std::path::{Path, PathBuf};

use harness_protocol::canonical;
use harness_protocol::{ContentHash, HarnessError, HarnessResult};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

async fn write_staged(staging: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(staging).await?;
    file.write_all(bytes).await?;
    file.sync_data().await?;
    drop(file);
    fs::rename(staging, path).await
}

/// Content-addressed copies of the dispatch, named `{sha256}.json`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(format!("{hash}.json"))
    }

    /// Staging file a snapshot is written to before it is renamed into place.
    pub fn staging_path_for(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(format!("{hash}.json.partial"))
    }

    /// Stores `bytes` at their address. An existing file must hash to the
    /// same address; anything else is ledger corruption.
    ///
    /// Bytes go to a staging file first and are renamed onto the address
    /// only after a full write and sync, so an interrupted write never
    /// leaves a truncated `{sha256}.json` behind.
    pub async fn ensure(&self, bytes: &[u8]) -> HarnessResult<ContentHash> {
        let hash = canonical::digest(bytes);
        let path = self.path_for(&hash);
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|error| HarnessError::io_at(&self.dir, error))?;

        if fs::try_exists(&path)
            .await
            .map_err(|error| HarnessError::io_at(&path, error))?
        {
            let existing = fs::read(&path)
                .await
                .map_err(|error| HarnessError::io_at(&path, error))?;
            let actual = canonical::sha256_hex(&existing);
            if actual != hash.as_str() {
                return Err(HarnessError::LedgerCorruption {
                    path,
                    expected: hash.to_string(),
                    actual,
                });
            }
            return Ok(hash);
        }

        let staging = self.staging_path_for(&hash);
        if let Err(error) = write_staged(&staging, &path, bytes).await {
            let _ = fs::remove_file(&staging).await;
            return Err(HarnessError::io_at(&path, error));
        }
        debug!(hash = %hash, "dispatch snapshot written");
        Ok(hash)
    }
}
