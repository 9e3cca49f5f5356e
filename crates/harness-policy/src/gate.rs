use std::path::Path;

use harness_protocol::TelemetryAggregates;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::thresholds::{ArtifactRules, GateConfig, Thresholds};

/// PASS iff `reasons` is empty. Reasons are complete and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub reasons: Vec<String>,
}

impl GateOutcome {
    pub fn from_reasons(mut reasons: Vec<String>) -> Self {
        reasons.sort();
        Self { reasons }
    }

    pub fn passed(&self) -> bool {
        self.reasons.is_empty()
    }
}

fn threshold_reasons(thresholds: &Thresholds, aggregates: &TelemetryAggregates) -> Vec<String> {
    let mut reasons = Vec::new();

    if let Some(limit) = &thresholds.max_total_ms {
        if aggregates.total_ms > limit.as_f64() {
            reasons.push(format!("total_ms {:.2} > {limit}", aggregates.total_ms));
        }
    }
    if let Some(limit) = &thresholds.max_errors {
        let errors = aggregates.errors_total();
        if errors > limit.as_u64() {
            reasons.push(format!("errors {errors} > {limit}"));
        }
    }
    if let Some(limit) = &thresholds.max_retries {
        let retries = aggregates.retries_total();
        if retries > limit.as_u64() {
            reasons.push(format!("retries {retries} > {limit}"));
        }
    }
    if let Some(limit) = &thresholds.max_tokens_total {
        let tokens = aggregates.budgets.tokens.tokens_total;
        if tokens > limit.as_u64() {
            reasons.push(format!("tokens_total {tokens} > {limit}"));
        }
    }
    if let Some(limit) = &thresholds.max_cost_total_usd {
        let cost = aggregates.budgets.cost_total_usd;
        if cost > limit.as_f64() {
            reasons.push(format!("cost_total_usd {cost:.6} > {limit}"));
        }
    }
    for (step, limit) in &thresholds.max_p95_step_ms {
        let p95 = aggregates.p95_ms(step);
        if p95 > limit.as_f64() {
            reasons.push(format!("p95_ms {step} {p95:.2} > {limit}"));
        }
    }

    reasons
}

fn artifact_reasons(rules: &ArtifactRules, exists: impl Fn(&str) -> bool) -> Vec<String> {
    let missing = rules
        .required
        .iter()
        .filter(|artifact| !exists(artifact))
        .map(|artifact| format!("missing artifact {artifact}"));
    let forbidden = rules
        .forbidden
        .iter()
        .filter(|artifact| exists(artifact))
        .map(|artifact| format!("forbidden artifact {artifact}"));
    missing.chain(forbidden).collect()
}

/// Runs every check; `exists` answers whether a run-relative artifact path
/// is present.
pub fn evaluate(
    config: &GateConfig,
    aggregates: &TelemetryAggregates,
    exists: impl Fn(&str) -> bool,
) -> GateOutcome {
    let mut reasons = threshold_reasons(&config.thresholds, aggregates);
    reasons.extend(artifact_reasons(&config.artifacts, exists));
    GateOutcome::from_reasons(reasons)
}

/// [`evaluate`] with artifact paths resolved under `run_dir`.
pub async fn evaluate_run(
    config: &GateConfig,
    aggregates: &TelemetryAggregates,
    run_dir: &Path,
) -> GateOutcome {
    let mut present = Vec::new();
    for artifact in config.artifacts.required.iter().chain(&config.artifacts.forbidden) {
        if fs::try_exists(run_dir.join(artifact)).await.unwrap_or(false) {
            present.push(artifact.as_str());
        }
    }
    evaluate(config, aggregates, |artifact| present.iter().any(|p| *p == artifact))
}
