//! Multi-run suite rollups and the suite gate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use harness_protocol::{TelemetryAggregates, percentile};
use serde::{Deserialize, Serialize};

use crate::gate::GateOutcome;
use crate::thresholds::SuiteRules;

/// The per-run row a suite aggregates over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSummary {
    pub total_ms: f64,
    pub errors_total: u64,
    pub retries_total: u64,
    pub tokens_total: u64,
    pub tokens_estimated: bool,
    pub cost_total_usd: f64,
}

pub fn summarize(aggregates: &TelemetryAggregates) -> RunSummary {
    let tokens = &aggregates.budgets.tokens;
    let estimated = tokens.estimated && tokens.tokens_est_total > 0;
    RunSummary {
        total_ms: aggregates.total_ms,
        errors_total: aggregates.errors_total(),
        retries_total: aggregates.retries_total(),
        tokens_total: if estimated {
            tokens.tokens_est_total
        } else {
            tokens.tokens_total
        },
        tokens_estimated: estimated,
        cost_total_usd: aggregates.budgets.cost_total_usd,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteRun {
    #[serde(default)]
    pub index: u32,
    pub scenario: String,
    pub run_id: String,
    pub return_code: i32,
    pub summary: RunSummary,
}

/// Contents of a `suite_runs.json` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteRuns {
    pub suite_id: String,
    pub scenarios: Vec<String>,
    pub runs_per_scenario: u32,
    pub runs: Vec<SuiteRun>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub p95_total_ms: f64,
    pub mean_total_ms: f64,
    pub mean_tokens_total: f64,
    pub mean_cost_total_usd: f64,
    pub errors_total_min: u64,
    pub errors_total_mean: f64,
    pub errors_total_max: u64,
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    values.sum::<f64>() / n as f64
}

pub fn build_rollup(rows: &[&RunSummary]) -> Rollup {
    let mut totals: Vec<f64> = rows.iter().map(|row| row.total_ms).collect();
    totals.sort_by(f64::total_cmp);
    Rollup {
        p95_total_ms: percentile(&totals, 95.0),
        mean_total_ms: mean(rows.iter().map(|row| row.total_ms)),
        mean_tokens_total: mean(rows.iter().map(|row| row.tokens_total as f64)),
        mean_cost_total_usd: mean(rows.iter().map(|row| row.cost_total_usd)),
        errors_total_min: rows.iter().map(|row| row.errors_total).min().unwrap_or(0),
        errors_total_mean: mean(rows.iter().map(|row| row.errors_total as f64)),
        errors_total_max: rows.iter().map(|row| row.errors_total).max().unwrap_or(0),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite_id: String,
    pub scenarios: Vec<String>,
    pub runs_per_scenario: u32,
    pub total_runs: u64,
    pub pass_count: u64,
    pub fail_count: u64,
    pub pass_rate: f64,
    pub per_scenario: BTreeMap<String, Rollup>,
    pub overall: Rollup,
}

impl SuiteReport {
    pub fn from_runs(runs: &SuiteRuns) -> Self {
        let scenarios: Vec<String> = runs
            .scenarios
            .iter()
            .cloned()
            .chain(runs.runs.iter().map(|run| run.scenario.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let total_runs = runs.runs.len() as u64;
        let pass_count = runs.runs.iter().filter(|run| run.return_code == 0).count() as u64;
        let pass_rate = if total_runs == 0 {
            0.0
        } else {
            pass_count as f64 / total_runs as f64
        };

        let mut per_scenario = BTreeMap::new();
        let mut overall_rows = Vec::new();
        for scenario in &scenarios {
            let rows: Vec<&RunSummary> = runs
                .runs
                .iter()
                .filter(|run| run.scenario == *scenario)
                .map(|run| &run.summary)
                .collect();
            per_scenario.insert(scenario.clone(), build_rollup(&rows));
            overall_rows.extend(rows);
        }

        Self {
            suite_id: runs.suite_id.clone(),
            scenarios,
            runs_per_scenario: runs.runs_per_scenario,
            total_runs,
            pass_count,
            fail_count: total_runs - pass_count,
            pass_rate,
            overall: build_rollup(&overall_rows),
            per_scenario,
        }
    }
}

pub fn suite_gate(report: &SuiteReport, rules: &SuiteRules) -> GateOutcome {
    let mut reasons = Vec::new();
    if let Some(limit) = &rules.min_pass_rate {
        if report.pass_rate < limit.as_f64() {
            reasons.push(format!("pass_rate {:.2} < {limit}", report.pass_rate));
        }
    }
    if let Some(limit) = &rules.max_p95_total_ms {
        let p95 = report.overall.p95_total_ms;
        if p95 > limit.as_f64() {
            reasons.push(format!("p95_total_ms {p95:.2} > {limit}"));
        }
    }
    if let Some(limit) = &rules.max_mean_cost_total_usd {
        let cost = report.overall.mean_cost_total_usd;
        if cost > limit.as_f64() {
            reasons.push(format!("mean_cost_total_usd {cost:.6} > {limit}"));
        }
    }
    GateOutcome::from_reasons(reasons)
}

pub fn render_suite_summary(report: &SuiteReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# ABM Agent Suite Summary");
    let _ = writeln!(out);
    let _ = writeln!(out, "Suite id: {}", report.suite_id);
    let _ = writeln!(out, "Runs: {}", report.total_runs);
    let _ = writeln!(out, "Pass rate: {:.2}", report.pass_rate);
    let _ = writeln!(out);
    let _ = writeln!(out, "## Per-scenario rollups");
    if report.per_scenario.is_empty() {
        let _ = writeln!(out, "- none");
    }
    for (name, rollup) in &report.per_scenario {
        let _ = writeln!(out, "- {name}: p95_total_ms={:.2}", rollup.p95_total_ms);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(scenario: &str, return_code: i32, total_ms: f64, errors: u64, cost: f64) -> SuiteRun {
        SuiteRun {
            index: 1,
            scenario: scenario.into(),
            run_id: format!("{scenario}-{total_ms}"),
            return_code,
            summary: RunSummary {
                total_ms,
                errors_total: errors,
                cost_total_usd: cost,
                tokens_total: 10,
                ..RunSummary::default()
            },
        }
    }

    fn runs() -> SuiteRuns {
        SuiteRuns {
            suite_id: "suite-1".into(),
            scenarios: vec!["b".into(), "a".into()],
            runs_per_scenario: 2,
            runs: vec![
                run("a", 0, 100.0, 0, 0.5),
                run("a", 1, 300.0, 2, 1.5),
                run("b", 0, 50.0, 1, 0.0),
                run("b", 0, 10.0, 0, 0.0),
            ],
        }
    }

    #[test]
    fn summary_prefers_estimate_only_when_flagged() {
        let mut aggregates = TelemetryAggregates::default();
        aggregates.budgets.tokens.tokens_total = 7;
        aggregates.budgets.tokens.tokens_est_total = 40;
        assert_eq!(summarize(&aggregates).tokens_total, 7);

        aggregates.budgets.tokens.estimated = true;
        let summary = summarize(&aggregates);
        assert_eq!(summary.tokens_total, 40);
        assert!(summary.tokens_estimated);
    }

    #[test]
    fn report_rolls_up_per_scenario_and_overall() {
        let report = SuiteReport::from_runs(&runs());

        assert_eq!(report.scenarios, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!((report.total_runs, report.pass_count, report.fail_count), (4, 3, 1));
        assert_eq!(report.pass_rate, 0.75);

        let a = &report.per_scenario["a"];
        assert_eq!(a.p95_total_ms, 100.0);
        assert_eq!(a.mean_total_ms, 200.0);
        assert_eq!((a.errors_total_min, a.errors_total_max), (0, 2));
        assert_eq!(a.mean_cost_total_usd, 1.0);

        assert_eq!(report.overall.p95_total_ms, 100.0);
        assert_eq!(report.overall.mean_tokens_total, 10.0);
    }

    #[test]
    fn empty_suite_has_zero_rollups() {
        let report = SuiteReport::from_runs(&SuiteRuns::default());
        assert_eq!(report.pass_rate, 0.0);
        assert_eq!(report.overall, Rollup::default());
        assert!(render_suite_summary(&report).ends_with("## Per-scenario rollups\n- none\n"));
    }

    #[test]
    fn suite_gate_reports_each_breach() {
        let report = SuiteReport::from_runs(&runs());
        let rules = SuiteRules::from_contract(&json!({
            "suite": {"min_pass_rate": 0.9, "max_p95_total_ms": 50, "max_mean_cost_total_usd": 0.1}
        }))
        .unwrap();

        let outcome = suite_gate(&report, &rules);

        assert_eq!(
            outcome.reasons,
            vec![
                "mean_cost_total_usd 0.500000 > 0.1".to_owned(),
                "p95_total_ms 100.00 > 50".to_owned(),
                "pass_rate 0.75 < 0.9".to_owned(),
            ]
        );
        assert!(suite_gate(&report, &SuiteRules::default()).passed());
    }

    #[test]
    fn summary_lists_scenarios() {
        let text = render_suite_summary(&SuiteReport::from_runs(&runs()));
        assert!(text.contains("Suite id: suite-1\nRuns: 4\nPass rate: 0.75\n"));
        assert!(text.contains("- a: p95_total_ms=100.00\n- b: p95_total_ms=10.00\n"));
    }

    #[test]
    fn runs_file_parses_with_defaults() {
        let parsed: SuiteRuns = serde_json::from_value(json!({
            "suite_id": "s",
            "runs": [{"scenario": "a", "run_id": "r", "return_code": 0, "summary": {"total_ms": 5}}]
        }))
        .unwrap();
        assert_eq!(parsed.runs[0].summary.total_ms, 5.0);
        assert_eq!(parsed.runs[0].index, 0);
    }
}
