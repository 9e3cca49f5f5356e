//! Derived summaries of event logs.
//!
//! These are produced by the aggregators in `harness-events` and consumed
//! by the gate. All maps are ordered so serialization is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::{RunId, WorkOrderId};

pub const AGGREGATES_VERSION: &str = "abm.aggregates.v1";

/// Nearest-rank percentile over an ascending sample list: the value at
/// index `floor(p/100 × (n−1))`, or 0 for an empty list.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((pct / 100.0) * (sorted.len() - 1) as f64).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatesMeta {
    pub version: String,
}

impl Default for AggregatesMeta {
    fn default() -> Self {
        Self {
            version: AGGREGATES_VERSION.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkOrderRollup {
    pub cycle_count: u64,
    pub attempt_count: u64,
    pub verify_pass: u64,
    pub verify_fail: u64,
    pub state_transitions: u64,
    pub max_cycle_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRollup {
    pub cycle_count: u64,
    pub attempt_count: u64,
    pub verify_pass: u64,
    pub verify_fail: u64,
    pub state_transitions: u64,
    pub work_orders: BTreeSet<WorkOrderId>,
}

/// Rollups over lifecycle records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleAggregates {
    pub meta: AggregatesMeta,
    pub event_counts: BTreeMap<String, u64>,
    pub by_work_order: BTreeMap<String, WorkOrderRollup>,
    pub by_run: BTreeMap<String, RunRollup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub samples_ms: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenTotals {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tokens_total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudget {
    pub tokens_in_total: u64,
    pub tokens_out_total: u64,
    /// Explicit total, or the character-based estimate when no explicit
    /// counts were recorded.
    pub tokens_total: u64,
    pub tokens_est_total: u64,
    pub estimated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    pub tokens: TokenBudget,
    pub cost_total_usd: f64,
}

/// Rollups over telemetry records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryAggregates {
    pub counts_by_kind: BTreeMap<String, u64>,
    pub counts_by_name: BTreeMap<String, u64>,
    pub counts_by_kind_name: BTreeMap<String, BTreeMap<String, u64>>,
    pub durations_by_name: BTreeMap<String, DurationStats>,
    pub errors_by_class: BTreeMap<String, u64>,
    pub retries_by_class: BTreeMap<String, u64>,
    pub tokens: TokenTotals,
    pub budgets: Budgets,
    pub total_ms: f64,
}

impl TelemetryAggregates {
    pub fn errors_total(&self) -> u64 {
        self.errors_by_class.values().sum()
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_by_class.values().sum()
    }

    pub fn p95_ms(&self, step: &str) -> f64 {
        self.durations_by_name
            .get(step)
            .map(|stats| stats.p95_ms)
            .unwrap_or(0.0)
    }
}

/// Telemetry aggregates as persisted in a run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAggregates {
    #[serde(flatten)]
    pub telemetry: TelemetryAggregates,
    pub run_id: RunId,
    pub event_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_boundaries() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[5.0], 50.0), 5.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 90.0), 4.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 100.0), 5.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.0), 1.0);
    }

    #[test]
    fn percentile_does_not_interpolate() {
        let samples = [10.0, 20.0];
        assert_eq!(percentile(&samples, 95.0), 10.0);
        assert_eq!(percentile(&samples, 50.0), 10.0);
    }

    #[test]
    fn totals_sum_class_maps() {
        let mut aggregates = TelemetryAggregates::default();
        aggregates.errors_by_class.insert("timeout".into(), 2);
        aggregates.errors_by_class.insert("unknown".into(), 1);
        aggregates.retries_by_class.insert("timeout".into(), 4);
        assert_eq!(aggregates.errors_total(), 3);
        assert_eq!(aggregates.retries_total(), 4);
        assert_eq!(aggregates.p95_ms("missing"), 0.0);
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let parsed: TelemetryAggregates =
            serde_json::from_str(r#"{"errors_by_class":{"timeout":1},"run_id":"r"}"#).unwrap();
        assert_eq!(parsed.errors_total(), 1);
        assert_eq!(parsed.total_ms, 0.0);
        assert!(!parsed.budgets.tokens.estimated);
    }
}
