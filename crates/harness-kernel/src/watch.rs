//! Live view of one run: event counts, recent errors and the run's latest
//! aggregates, one frame per tick.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use harness_events::runs::{AGGREGATES_FILE, PARTIAL_AGGREGATES_FILE};
use harness_policy::{RunSummary, summarize};
use harness_protocol::{EventRecord, RunAggregates};
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Pinned run; `None` follows `LATEST`.
    pub run_id: Option<String>,
    pub interval: Duration,
    pub max_errors: usize,
    /// Stop after this many frames.
    pub ticks: Option<u64>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            interval: Duration::from_millis(500),
            max_errors: 5,
            ticks: None,
        }
    }
}

/// Running counts for the watched run.
#[derive(Debug, Clone, Default)]
pub struct WatchState {
    counts: BTreeMap<String, u64>,
    errors: VecDeque<String>,
    max_errors: usize,
}

impl WatchState {
    pub fn new(max_errors: usize) -> Self {
        Self {
            max_errors,
            ..Self::default()
        }
    }

    /// Counts `record` and returns its `kind:name` label.
    pub fn observe(&mut self, record: &EventRecord) -> String {
        let (kind, name) = match record {
            EventRecord::Telemetry(event) => (event.kind.clone(), event.name.clone()),
            EventRecord::Lifecycle(event) => (
                event.event_type.as_str().to_owned(),
                event
                    .work_order_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
            ),
        };
        *self.counts.entry(kind.clone()).or_default() += 1;

        match record {
            EventRecord::Telemetry(event) if event.kind == "error" => {
                let class = event
                    .meta
                    .get("error_class")
                    .and_then(|value| value.as_str())
                    .filter(|class| !class.is_empty())
                    .unwrap_or("unknown");
                self.errors.push_back(format!("{}:{class}", event.name));
                while self.errors.len() > self.max_errors {
                    self.errors.pop_front();
                }
            }
            _ => {}
        }
        format!("{kind}:{name}")
    }

    pub fn frame(
        &self,
        run_id: &str,
        new_events: usize,
        last: Option<String>,
        metrics: RunSummary,
    ) -> WatchFrame {
        WatchFrame {
            run_id: run_id.to_owned(),
            new_events,
            last,
            counts: self.counts.clone(),
            errors: self.errors.iter().cloned().collect(),
            metrics,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchFrame {
    pub run_id: String,
    /// Events read this tick.
    pub new_events: usize,
    /// Label of the last event read this tick.
    pub last: Option<String>,
    pub counts: BTreeMap<String, u64>,
    pub errors: Vec<String>,
    pub metrics: RunSummary,
}

impl WatchFrame {
    fn metric_parts(&self) -> Vec<(&'static str, String)> {
        let metrics = &self.metrics;
        let tokens_label = if metrics.tokens_estimated {
            "tokens_est_total"
        } else {
            "tokens_total"
        };
        vec![
            ("total_ms", format!("{:.2}", metrics.total_ms)),
            ("errors_total", metrics.errors_total.to_string()),
            ("retries_total", metrics.retries_total.to_string()),
            (tokens_label, metrics.tokens_total.to_string()),
            ("cost_total_usd", format!("{:.6}", metrics.cost_total_usd)),
        ]
    }

    /// One line per tick.
    pub fn render_plain(&self) -> String {
        let counts = self
            .counts
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        let errors = if self.errors.is_empty() {
            "none".to_owned()
        } else {
            self.errors.join("; ")
        };
        let metrics = self
            .metric_parts()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "rid={} tick+{} last={} counts: {counts} | errors: {errors} | {metrics}",
            self.run_id,
            self.new_events,
            self.last.as_deref().unwrap_or("none"),
        )
    }

    /// Full-screen panel, redrawn each tick.
    pub fn render_panel(&self) -> String {
        let mut lines = vec![
            "Harness Run Watcher".to_owned(),
            String::new(),
            format!("Run id: {}", self.run_id),
            format!("Tick delta: {}", self.new_events),
            format!("Last event: {}", self.last.as_deref().unwrap_or("none")),
            String::new(),
            "Metrics:".to_owned(),
        ];
        lines.extend(
            self.metric_parts()
                .into_iter()
                .map(|(key, value)| format!("  {key}: {value}")),
        );
        lines.push(String::new());
        lines.push("Counts by kind:".to_owned());
        lines.extend(self.counts.iter().map(|(kind, count)| format!("  {kind}: {count}")));
        lines.push(String::new());
        lines.push("Recent errors:".to_owned());
        if self.errors.is_empty() {
            lines.push("  none".to_owned());
        } else {
            lines.extend(self.errors.iter().map(|error| format!("  {error}")));
        }
        lines.join("\n")
    }
}

/// Partial aggregates when a run is still in flight, else the final ones.
/// Missing or unreadable aggregates read as zeros.
pub async fn load_metrics(run_dir: &Path) -> RunSummary {
    let partial = run_dir.join(PARTIAL_AGGREGATES_FILE);
    let path = if fs::try_exists(&partial).await.unwrap_or(false) {
        partial
    } else {
        run_dir.join(AGGREGATES_FILE)
    };
    let Ok(raw) = fs::read_to_string(&path).await else {
        return RunSummary::default();
    };
    match serde_json::from_str::<RunAggregates>(&raw) {
        Ok(aggregates) => summarize(&aggregates.telemetry),
        Err(error) => {
            debug!(path = %path.display(), %error, "unreadable aggregates");
            RunSummary::default()
        }
    }
}
