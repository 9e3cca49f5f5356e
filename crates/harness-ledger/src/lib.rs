//! Durable harness state: the dispatch document, its content-addressed
//! snapshots, and one immutable receipt per lifecycle transition.
//!
//! The dispatch is replaced whole. Snapshots are staged and renamed onto
//! their content address. Receipts are created exclusively; that is the
//! only mutual-exclusion primitive, and a collision surfaces as
//! [`HarnessError::AlreadyExists`](harness_protocol::HarnessError).

pub mod audit;
pub mod ledger;
pub mod snapshot;
pub mod store;

pub use audit::audit_receipts;
pub use ledger::{RUN_DIR, ReceiptLedger, ReceiptRequest, SNAPSHOT_DIR};
pub use snapshot::SnapshotStore;
pub use store::DispatchStore;
