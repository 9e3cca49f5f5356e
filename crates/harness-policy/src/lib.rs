//! # harness-policy
//!
//! Decisions the harness makes about a run without touching the ledger:
//!
//! - [`scope`] checks changed paths against the active work order's globs
//! - [`thresholds`] resolves layered gate limits from contract documents
//! - [`gate`] evaluates one run's aggregates against those limits
//! - [`suite`] rolls many runs up and gates the suite as a whole

pub mod gate;
pub mod scope;
pub mod suite;
pub mod thresholds;

pub use gate::{GateOutcome, evaluate, evaluate_run};
pub use scope::{ScopeEnforcer, ScopeReport};
pub use suite::{
    Rollup, RunSummary, SuiteReport, SuiteRun, SuiteRuns, build_rollup, render_suite_summary,
    suite_gate, summarize,
};
pub use thresholds::{ArtifactRules, GateConfig, Limit, SuiteRules, Thresholds};
