//! Receipts: immutable proof-of-transition records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::error::{HarnessError, HarnessResult};
use crate::event::Payload;
use crate::ids::{ContentHash, RunId, WorkOrderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptKind {
    Promote,
    Complete,
    RunDone,
    RunFail,
}

impl ReceiptKind {
    pub const ALL: [ReceiptKind; 4] = [
        ReceiptKind::Promote,
        ReceiptKind::Complete,
        ReceiptKind::RunDone,
        ReceiptKind::RunFail,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promote => "PROMOTE",
            Self::Complete => "COMPLETE",
            Self::RunDone => "RUN_DONE",
            Self::RunFail => "RUN_FAIL",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// RUN_DONE and RUN_FAIL end a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RunDone | Self::RunFail)
    }

    /// PROMOTE and COMPLETE name a work order; terminal kinds must not.
    pub fn requires_work_order(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ReceiptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Receipt {
    pub run_id: RunId,
    pub kind: ReceiptKind,
    pub timestamp_utc: String,
    pub head: String,
    pub dispatch_hash: ContentHash,
    pub work_order_id: Option<WorkOrderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Payload>,
}

impl Receipt {
    /// Builds a receipt, enforcing the kind/work-order pairing.
    pub fn new(
        kind: ReceiptKind,
        run_id: RunId,
        timestamp_utc: impl Into<String>,
        head: impl Into<String>,
        dispatch_hash: ContentHash,
        work_order_id: Option<WorkOrderId>,
        summary: Option<Payload>,
    ) -> HarnessResult<Self> {
        match (&work_order_id, kind.requires_work_order()) {
            (None, true) => {
                return Err(HarnessError::Invariant(format!(
                    "work_order_id required for {kind}"
                )));
            }
            (Some(id), true) if id.as_str().is_empty() => {
                return Err(HarnessError::Invariant(format!(
                    "work_order_id required for {kind}"
                )));
            }
            (Some(_), false) => {
                return Err(HarnessError::Invariant(format!(
                    "work_order_id must be null for {kind}"
                )));
            }
            _ => {}
        }
        Ok(Self {
            run_id,
            kind,
            timestamp_utc: timestamp_utc.into(),
            head: head.into(),
            dispatch_hash,
            work_order_id,
            summary,
        })
    }

    /// Exact bytes written to disk.
    pub fn canonical_bytes(&self) -> HarnessResult<Vec<u8>> {
        canonical::to_canonical_line(self)
    }

    /// `{timestamp}-{first 8 hex of sha256(canonical bytes)}.json`
    pub fn file_name(&self) -> HarnessResult<String> {
        let hash = canonical::digest(&self.canonical_bytes()?);
        Ok(format!("{}-{}.json", self.timestamp_utc, hash.short()))
    }
}
