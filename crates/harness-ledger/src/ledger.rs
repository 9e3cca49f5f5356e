//! Receipt write path.
//!
//! Layout under the receipts root:
//! - `_dispatch/{sha256}.json` dispatch snapshots
//! - `{work_order_id}/` PROMOTE and COMPLETE receipts
//! - `RUN/` RUN_DONE and RUN_FAIL receipts

use std::path::{Path, PathBuf};
use std::sync::Arc;

use harness_protocol::{
    Clock, HarnessError, HarnessResult, Payload, Receipt, ReceiptKind, RunId, WorkOrderId,
};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::snapshot::SnapshotStore;
use crate::store::DispatchStore;

pub const SNAPSHOT_DIR: &str = "_dispatch";
pub const RUN_DIR: &str = "RUN";

/// Everything a receipt needs besides the dispatch and the clock.
#[derive(Debug, Clone)]
pub struct ReceiptRequest {
    pub kind: ReceiptKind,
    pub run_id: RunId,
    pub head: String,
    pub work_order_id: Option<WorkOrderId>,
    pub summary: Option<Payload>,
}

impl ReceiptRequest {
    pub fn new(kind: ReceiptKind, run_id: RunId, head: impl Into<String>) -> Self {
        Self {
            kind,
            run_id,
            head: head.into(),
            work_order_id: None,
            summary: None,
        }
    }

    pub fn for_work_order(mut self, id: WorkOrderId) -> Self {
        self.work_order_id = Some(id);
        self
    }

    pub fn with_summary(mut self, summary: Payload) -> Self {
        self.summary = Some(summary);
        self
    }
}

#[derive(Clone)]
pub struct ReceiptLedger {
    root: PathBuf,
    snapshots: SnapshotStore,
    clock: Arc<dyn Clock>,
}

impl ReceiptLedger {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let root = root.into();
        let snapshots = SnapshotStore::new(root.join(SNAPSHOT_DIR));
        Self {
            root,
            snapshots,
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn receipt_dir(&self, kind: ReceiptKind, work_order_id: Option<&WorkOrderId>) -> PathBuf {
        match (kind.requires_work_order(), work_order_id) {
            (true, Some(id)) => self.root.join(id.as_str()),
            _ => self.root.join(RUN_DIR),
        }
    }

    /// Snapshots the current dispatch, builds the receipt, and creates its
    /// file exclusively. A name collision or a mismatching snapshot is fatal.
    #[instrument(
        skip(self, dispatch, request),
        fields(kind = %request.kind, run_id = %request.run_id)
    )]
    pub async fn write(
        &self,
        dispatch: &DispatchStore,
        request: ReceiptRequest,
    ) -> HarnessResult<PathBuf> {
        let dispatch_hash = self.snapshots.ensure(&dispatch.canonical_bytes().await?).await?;
        let receipt = Receipt::new(
            request.kind,
            request.run_id,
            self.clock.now_utc(),
            request.head,
            dispatch_hash,
            request.work_order_id,
            request.summary,
        )?;

        let dir = self.receipt_dir(receipt.kind, receipt.work_order_id.as_ref());
        fs::create_dir_all(&dir)
            .await
            .map_err(|error| HarnessError::io_at(&dir, error))?;
        let path = dir.join(receipt.file_name()?);
        let bytes = receipt.canonical_bytes()?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|error| HarnessError::io_at(&path, error))?;
        let written = match file.write_all(&bytes).await {
            Ok(()) => file.sync_data().await,
            Err(error) => Err(error),
        };
        if let Err(error) = written {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(HarnessError::io_at(&path, error));
        }

        debug!(path = %path.display(), "receipt written");
        Ok(path)
    }

    /// Parsed RUN_DONE and RUN_FAIL receipts. Files that do not parse are
    /// skipped here and left for the auditor to report.
    pub async fn terminal_receipts(&self) -> HarnessResult<Vec<Receipt>> {
        let dir = self.root.join(RUN_DIR);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|error| HarnessError::io_at(&dir, error))?;
        let mut receipts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| HarnessError::io_at(&dir, error))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .map_err(|error| HarnessError::io_at(&path, error))?;
            match serde_json::from_slice::<Receipt>(&bytes) {
                Ok(receipt) if receipt.kind.is_terminal() => receipts.push(receipt),
                Ok(_) => {}
                Err(error) => warn!(path = %path.display(), %error, "skipping unreadable receipt"),
            }
        }
        receipts.sort_by(|a, b| a.timestamp_utc.cmp(&b.timestamp_utc));
        Ok(receipts)
    }

    /// Whether `run_id` already has its RUN_DONE or RUN_FAIL receipt.
    pub async fn has_terminal(&self, run_id: &RunId) -> HarnessResult<bool> {
        Ok(self
            .terminal_receipts()
            .await?
            .iter()
            .any(|receipt| receipt.run_id == *run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{dispatch_value, unique_test_root};
    use harness_protocol::{Dispatch, FixedClock, canonical};

    async fn setup(name: &str) -> anyhow::Result<(PathBuf, DispatchStore, ReceiptLedger)> {
        let root = unique_test_root(name);
        let store = DispatchStore::new(root.join("dispatch.json"));
        store
            .save(&Dispatch::from_value(dispatch_value(&[("WO-1", true, false)]))?)
            .await?;
        let ledger = ReceiptLedger::new(
            root.join("receipts"),
            Arc::new(FixedClock::new("2026-02-03T04:05:06Z")),
        );
        Ok((root, store, ledger))
    }

    #[tokio::test]
    async fn promote_receipt_lands_in_work_order_dir_with_snapshot() -> anyhow::Result<()> {
        let (root, store, ledger) = setup("harness-ledger-promote").await?;

        let path = ledger
            .write(
                &store,
                ReceiptRequest::new(ReceiptKind::Promote, RunId::from("run-1"), "abc")
                    .for_work_order(WorkOrderId::from("WO-1")),
            )
            .await?;

        assert_eq!(path.parent(), Some(root.join("receipts/WO-1").as_path()));
        let bytes = fs::read(&path).await?;
        let receipt: Receipt = serde_json::from_slice(&bytes)?;
        assert_eq!(receipt.canonical_bytes()?, bytes);
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(receipt.file_name()?.as_str()));
        assert_eq!(receipt.timestamp_utc, "2026-02-03T04:05:06Z");

        let snapshot = fs::read(ledger.snapshots().path_for(&receipt.dispatch_hash)).await?;
        assert_eq!(snapshot, store.canonical_bytes().await?);
        assert_eq!(canonical::sha256_hex(&snapshot), receipt.dispatch_hash.as_str());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn terminal_receipts_go_to_run_dir() -> anyhow::Result<()> {
        let (root, store, ledger) = setup("harness-ledger-terminal").await?;

        let path = ledger
            .write(
                &store,
                ReceiptRequest::new(ReceiptKind::RunDone, RunId::from("run-1"), ""),
            )
            .await?;

        assert_eq!(path.parent(), Some(root.join("receipts/RUN").as_path()));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn identical_receipt_in_same_second_collides() -> anyhow::Result<()> {
        let (root, store, ledger) = setup("harness-ledger-collision").await?;
        let request = ReceiptRequest::new(ReceiptKind::RunFail, RunId::from("run-1"), "");

        ledger.write(&store, request.clone()).await?;
        let err = ledger.write(&store, request).await.unwrap_err();

        assert!(matches!(err, HarnessError::AlreadyExists(_)));
        assert!(err.is_fatal());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn terminal_receipts_are_listed_per_run() -> anyhow::Result<()> {
        let (root, store, ledger) = setup("harness-ledger-terminal-list").await?;
        assert!(!ledger.has_terminal(&RunId::from("run-1")).await?);

        ledger
            .write(
                &store,
                ReceiptRequest::new(ReceiptKind::RunDone, RunId::from("run-1"), "abc"),
            )
            .await?;
        ledger
            .write(
                &store,
                ReceiptRequest::new(ReceiptKind::Promote, RunId::from("run-2"), "abc")
                    .for_work_order(WorkOrderId::from("WO-1")),
            )
            .await?;
        fs::write(root.join("receipts/RUN/garbage.json"), b"{").await?;

        let terminal = ledger.terminal_receipts().await?;
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].kind, ReceiptKind::RunDone);
        assert!(ledger.has_terminal(&RunId::from("run-1")).await?);
        assert!(!ledger.has_terminal(&RunId::from("run-2")).await?);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn complete_without_work_order_is_rejected_before_writing() -> anyhow::Result<()> {
        let (root, store, ledger) = setup("harness-ledger-invalid").await?;

        let err = ledger
            .write(
                &store,
                ReceiptRequest::new(ReceiptKind::Complete, RunId::from("run-1"), ""),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Invariant(_)));
        assert!(!fs::try_exists(root.join("receipts/RUN")).await?);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
