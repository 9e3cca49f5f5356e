//! Benchmark matrices over `benchmarks/*.json`.
//!
//! Every parameter combination of every benchmark is scored against the
//! latest RUN_DONE receipt, optionally after running the loop afresh. The
//! scaling indicators come from that run's lifecycle rollup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use harness_protocol::{HarnessError, HarnessResult, RunRollup};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;

pub const BENCHMARKS_DIR: &str = "benchmarks";
pub const BENCH_RESULTS: &str = "artifacts/abm/benchmarks/results.json";
pub const BENCH_LIMITS_DIR: &str = "artifacts/abm/benchmarks/limits";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Benchmark {
    pub benchmark_id: Option<String>,
    pub stress_axis: Option<String>,
    pub parameters: Map<String, Value>,
}

/// Benchmark files in `dir`, in file-name order. A missing directory has none.
pub async fn load_benchmarks(dir: &Path) -> Result<Vec<Benchmark>> {
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut benchmarks = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed reading benchmark {}", path.display()))?;
        let benchmark = serde_json::from_str(&raw)
            .with_context(|| format!("invalid benchmark {}", path.display()))?;
        benchmarks.push(benchmark);
    }
    Ok(benchmarks)
}

/// Cartesian product over the parameter lists, keys in sorted order.
pub fn expand_parameters(parameters: &Map<String, Value>) -> HarnessResult<Vec<Map<String, Value>>> {
    let mut keys: Vec<&String> = parameters.keys().collect();
    keys.sort();

    let mut combos = vec![Map::new()];
    for key in keys {
        let Some(values) = parameters.get(key).and_then(Value::as_array) else {
            return Err(HarnessError::schema(format!("parameters[{key}] must be list")));
        };
        combos = combos
            .iter()
            .flat_map(|combo| {
                values.iter().map(move |value| {
                    let mut next = combo.clone();
                    next.insert(key.clone(), value.clone());
                    next
                })
            })
            .collect();
    }
    Ok(combos)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingIndicators {
    pub cycle_count: u64,
    pub attempt_count: u64,
    pub verify_pass: u64,
    pub verify_fail: u64,
    pub work_order_count: u64,
    pub cycles_per_work_order: f64,
    pub verify_fail_rate: f64,
}

impl ScalingIndicators {
    pub fn from_rollup(rollup: &RunRollup) -> Self {
        let work_order_count = rollup.work_orders.len() as u64;
        let verified = rollup.verify_pass + rollup.verify_fail;
        Self {
            cycle_count: rollup.cycle_count,
            attempt_count: rollup.attempt_count,
            verify_pass: rollup.verify_pass,
            verify_fail: rollup.verify_fail,
            work_order_count,
            cycles_per_work_order: ratio(rollup.cycle_count, work_order_count),
            verify_fail_rate: ratio(rollup.verify_fail, verified),
        }
    }

    /// The axis the run is bound by: `verification` once any verification
    /// failed, `throughput` when work orders needed more than one cycle.
    pub fn limit(&self) -> Option<&'static str> {
        if self.verify_fail_rate > 0.0 {
            Some("verification")
        } else if self.cycles_per_work_order > 1.0 {
            Some("throughput")
        } else {
            None
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Written to `limits/{run_id}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitReport {
    pub run_id: String,
    pub limit: Option<String>,
    pub indicators: ScalingIndicators,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    pub benchmark_id: Option<String>,
    pub stress_axis: Option<String>,
    pub parameters: Map<String, Value>,
    pub run_id: Option<String>,
    pub dispatch_hash: Option<String>,
    pub head: Option<String>,
    pub indicators: Option<ScalingIndicators>,
    pub limit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchReport {
    pub results: Vec<BenchResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchOptions {
    pub benchmarks_dir: PathBuf,
    pub results_path: PathBuf,
    /// Run the loop to completion before scoring each combination.
    pub execute: bool,
}

impl Default for BenchOptions {
    fn default() -> Self {
        Self {
            benchmarks_dir: PathBuf::from(BENCHMARKS_DIR),
            results_path: PathBuf::from(BENCH_RESULTS),
            execute: false,
        }
    }
}
