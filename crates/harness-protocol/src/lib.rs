//! # harness-protocol: work-order harness contract crate
//!
//! Shared types, the canonical codec, and the port traits every other
//! harness crate depends on. It carries no async runtime so it can be used
//! as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`canonical`]: canonical JSON bytes and SHA-256 digests
//! - [`ids`]: typed ids (RunId, WorkOrderId, CycleId, ContentHash)
//! - [`clock`]: timestamp source with the `HARNESS_NOW_ISO` override
//! - [`dispatch`]: WorkOrder, Dispatch, and the dispatch state machine
//! - [`schema`]: field-level type checks for dispatch documents
//! - [`event`]: lifecycle/telemetry tagged union
//! - [`receipt`]: Receipt, ReceiptKind
//! - [`aggregates`]: lifecycle and telemetry rollups, percentile
//! - [`ports`]: CommandRunner, VersionControl
//! - [`error`]: HarnessError, HarnessResult

pub mod aggregates;
pub mod canonical;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod ids;
pub mod ports;
pub mod receipt;
pub mod schema;

pub use aggregates::{
    AGGREGATES_VERSION, AggregatesMeta, Budgets, DurationStats, LifecycleAggregates,
    RunAggregates, RunRollup, TelemetryAggregates, TokenBudget, TokenTotals, WorkOrderRollup,
    percentile,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use dispatch::{
    AcceptanceCheck, ArtifactRequirements, BASELINE_DENY_GLOBS, DISPATCH_VERSION, Dispatch,
    DispatchMeta, MULTIPLE_READY_REASON, Scope, WorkOrder, WorkOrderState,
};
pub use error::{HarnessError, HarnessResult};
pub use event::{
    EventRecord, LIFECYCLE_EVENT_VERSION, LifecycleEvent, LifecycleEventType, Payload,
    TelemetryEvent,
};
pub use ids::{ContentHash, CycleId, RunId, WorkOrderId};
pub use ports::{
    CommandEnv, CommandOutcome, CommandRunner, RUN_ID_ENV, VersionControl, WORK_ORDER_ID_ENV,
};
pub use receipt::{Receipt, ReceiptKind};
