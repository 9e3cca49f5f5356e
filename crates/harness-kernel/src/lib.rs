pub mod bench;
pub mod suite;
pub mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use harness_events::runs::{EVENTS_FILE, RunArtifacts, write_pretty_json};
use harness_events::{EventStreamHub, EventTail, FileEventLog, compute_lifecycle_aggregates};
use harness_policy::{
    GateConfig, GateOutcome, SuiteReport, SuiteRules, SuiteRuns, evaluate_run,
    render_suite_summary, suite_gate,
};
use harness_protocol::clock::NOW_OVERRIDE_ENV;
use harness_protocol::{
    Clock, CommandRunner, EventRecord, Receipt, ReceiptKind, RunAggregates, RunId, SystemClock,
    VersionControl, WorkOrder, WorkOrderId,
};
use harness_runtime::{ControlLoop, CycleOutcome, RuntimeConfig, VerifyMode, VerifyReport};
use harness_sandbox::{CommandLimits, GitCli, ShellCommandRunner};
use serde_json::Value;
use tokio::fs;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, instrument, warn};

use crate::bench::{
    BENCH_LIMITS_DIR, BenchOptions, BenchReport, BenchResult, LimitReport, ScalingIndicators,
    expand_parameters, load_benchmarks,
};
use crate::suite::{
    SUITE_RUNS_FILE, SUITES_DIR, ScenarioCommands, ScenarioExecutor, SuitePlan,
    resolve_commands, run_scenarios,
};
use crate::watch::{WatchFrame, WatchOptions, WatchState, load_metrics};

pub const DEFAULT_THRESHOLDS: &str = "contracts/abm_thresholds.json";
pub const DEFAULT_SCENARIOS: &str = "contracts/abm_scenarios.json";
pub const NO_READY_WORK_ORDERS: &str = "NO_READY_WORK_ORDERS";

#[derive(Clone)]
pub struct HarnessBuilder {
    root: PathBuf,
    agent_id: Option<String>,
    limits: CommandLimits,
    stream_buffer: usize,
    clock: Option<Arc<dyn Clock>>,
    vcs: Option<Arc<dyn VersionControl>>,
    runner: Option<Arc<dyn CommandRunner>>,
}

impl HarnessBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            agent_id: None,
            limits: CommandLimits::default(),
            stream_buffer: 1024,
            clock: None,
            vcs: None,
            runner: None,
        }
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn limits(mut self, limits: CommandLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn version_control(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn build(self) -> Harness {
        let mut config = RuntimeConfig::new(&self.root).with_limits(self.limits.clone());
        if let Some(agent_id) = self.agent_id {
            config = config.with_agent_id(agent_id);
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let vcs: Arc<dyn VersionControl> = match self.vcs {
            Some(vcs) => vcs,
            None => Arc::new(GitCli::new(&self.root)),
        };
        let runner: Arc<dyn CommandRunner> = match self.runner {
            Some(runner) => runner,
            None => Arc::new(ShellCommandRunner::new(&self.root).with_limits(self.limits)),
        };

        let lifecycle_log = Arc::new(FileEventLog::new(&config.lifecycle_log));
        let stream = EventStreamHub::new(self.stream_buffer);
        let control = ControlLoop::new(config, lifecycle_log, stream, vcs, runner, clock);

        Harness { control }
    }
}

/// Health of the repository layout plus version-control state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorReport {
    pub missing: Vec<String>,
    pub head: String,
    pub status: String,
}

impl DoctorReport {
    pub fn healthy(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = format!("git_head={}\n", self.head);
        if self.status.trim().is_empty() {
            out.push_str("git_status_short=clean\n");
        } else {
            out.push_str("git_status_short=\n");
            out.push_str(self.status.trim_end());
            out.push('\n');
        }
        out
    }
}

/// Prompt-ready summary of the active work order.
pub fn render_brief(wo: Option<&WorkOrder>) -> String {
    let Some(wo) = wo else {
        return format!("{NO_READY_WORK_ORDERS}\n");
    };
    let mut lines = vec![format!("WO {}: {}", wo.id, wo.title), "ALLOW_GLOBS:".to_owned()];
    lines.extend(wo.scope.allow_globs.iter().map(|g| format!("- {g}")));
    lines.push("DENY_GLOBS:".to_owned());
    lines.extend(wo.scope.deny_globs.iter().map(|g| format!("- {g}")));
    lines.push("STEPS:".to_owned());
    lines.extend(wo.steps.iter().map(|s| format!("- {s}")));
    lines.push("ACCEPTANCE:".to_owned());
    lines.extend(
        wo.acceptance
            .iter()
            .map(|check| format!("- {}: {}", check.name, check.command)),
    );
    lines.extend(
        [
            "OUTPUT CONTRACT:",
            "- Apply only the allowed scope; do not touch denied paths.",
            "- Make atomic changes to satisfy all steps.",
            "- Ensure acceptance commands pass.",
            "- Report files changed and a short completion note.",
        ]
        .map(str::to_owned),
    );
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

async fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("missing {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid json {}", path.display()))
}

/// Outcome of [`Harness::suite_run`].
#[derive(Debug, Clone)]
pub struct SuiteResult {
    pub suite_id: String,
    pub runs_file: PathBuf,
    pub runs: SuiteRuns,
    pub report: SuiteReport,
    pub outcome: GateOutcome,
}

#[derive(Clone)]
pub struct Harness {
    control: ControlLoop,
}

impl Harness {
    pub fn config(&self) -> &RuntimeConfig {
        self.control.config()
    }

    pub fn runs(&self) -> &RunArtifacts {
        self.control.runs()
    }

    /// Live lifecycle events, published after each durable append.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.control.journal().subscribe()
    }

    /// Relative paths resolve against the repository root.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config().root.join(path)
        }
    }

    /// One cycle (`once`) or cycles until the run stops advancing. A given
    /// `run_id` continues a run allocated by a suite runner.
    #[instrument(skip(self))]
    pub async fn run(&self, run_id: Option<&str>, once: bool) -> Result<(RunId, CycleOutcome)> {
        let run_id = match run_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => {
                let run_id = RunId::from(id);
                self.control.open_run(&run_id).await?;
                run_id
            }
            None => self.control.start_run().await?,
        };
        let outcome = if once {
            self.control.run_cycle(&run_id).await?
        } else {
            self.control.run_loop(&run_id).await?
        };
        info!(run_id = %run_id, ?outcome, "run finished");
        Ok((run_id, outcome))
    }

    pub async fn verify(&self, mode: VerifyMode) -> VerifyReport {
        self.control.verifier().run_mode(mode).await
    }

    pub async fn ready(&self, id: &str) -> Result<bool> {
        self.control.mark_ready(&WorkOrderId::from(id)).await
    }

    pub async fn brief(&self) -> Result<String> {
        let dispatch = self.control.store().load().await?;
        Ok(render_brief(dispatch.active_work_order()?))
    }

    pub async fn doctor(&self) -> Result<DoctorReport> {
        let config = self.config();
        let required = [
            config.root.join(".harness"),
            config.dispatch_path.clone(),
            config.hooks_path.clone(),
            config.receipts_dir.clone(),
            config.status_path.clone(),
        ];
        let mut missing = Vec::new();
        for path in &required {
            if !fs::try_exists(path).await.unwrap_or(false) {
                missing.push(config.display_path(path));
            }
        }
        let vcs = self.control.vcs();
        let status = match vcs.status_short().await {
            Ok(status) => status,
            Err(err) => format!("unavailable: {err}"),
        };
        Ok(DoctorReport {
            missing,
            head: vcs.head().await,
            status,
        })
    }

    /// Recomputes a run's telemetry aggregates (default: `LATEST`).
    pub async fn aggregate(
        &self,
        run_id: Option<&str>,
        partial: bool,
    ) -> Result<(RunId, PathBuf, RunAggregates)> {
        let run_id = self.runs().resolve(run_id).await?;
        let (path, aggregates) = self.runs().aggregate(&run_id, partial).await?;
        Ok((run_id, path, aggregates))
    }

    /// Gates a run's persisted aggregates. Both contracts must exist; an
    /// unknown scenario is gated on the contract defaults.
    #[instrument(skip(self))]
    pub async fn gate(
        &self,
        run_id: Option<&str>,
        scenario: Option<&str>,
        thresholds: &Path,
        scenarios_contract: &Path,
    ) -> Result<GateOutcome> {
        let run_id = self.runs().resolve(run_id).await?;
        let aggregates = self.runs().load_aggregates(&run_id).await?;
        let thresholds = read_json(&self.resolve_path(thresholds)).await?;
        let scenarios = read_json(&self.resolve_path(scenarios_contract)).await?;

        let config = GateConfig::resolve(&thresholds, Some(&scenarios), scenario)?;
        Ok(evaluate_run(&config, &aggregates.telemetry, &self.runs().run_dir(&run_id)).await)
    }

    /// Rolls up a suite runs file, writes `suite_report.json` and
    /// `suite_summary.md` beside it, and gates the suite against the
    /// scenarios contract, which must exist.
    pub async fn suite_gate(
        &self,
        runs_file: &Path,
        scenarios_contract: &Path,
    ) -> Result<(SuiteReport, GateOutcome)> {
        let runs_file = self.resolve_path(runs_file);
        let runs: SuiteRuns = serde_json::from_value(read_json(&runs_file).await?)
            .with_context(|| format!("invalid suite runs {}", runs_file.display()))?;
        let report = SuiteReport::from_runs(&runs);

        let dir = runs_file.parent().unwrap_or(Path::new("."));
        write_pretty_json(&dir.join("suite_report.json"), &report).await?;
        fs::write(dir.join("suite_summary.md"), render_suite_summary(&report))
            .await
            .with_context(|| format!("failed writing suite summary in {}", dir.display()))?;

        let contract = read_json(&self.resolve_path(scenarios_contract)).await?;
        let rules = SuiteRules::from_contract(&contract)?;
        let outcome = suite_gate(&report, &rules);
        Ok((report, outcome))
    }

    /// Runs every scenario of `plan` `plan.runs` times, writes
    /// `artifacts/abm_suites/{suite_id}/suite_runs.json` and gates the suite.
    #[instrument(skip(self, builtins))]
    pub async fn suite_run(
        &self,
        plan: &SuitePlan,
        builtins: &ScenarioCommands,
        scenarios_contract: &Path,
    ) -> Result<SuiteResult> {
        if plan.scenarios.is_empty() {
            bail!("no scenarios to run");
        }
        let contract = read_json(&self.resolve_path(scenarios_contract)).await?;
        let commands = resolve_commands(&contract, builtins, &plan.scenarios)?;
        let now = std::env::var(NOW_OVERRIDE_ENV).ok();
        let suite_id = plan.resolve_suite_id(now.as_deref());
        info!(
            suite_id = %suite_id,
            runs = plan.runs,
            concurrency = plan.concurrency,
            "suite started"
        );

        let executor = ScenarioExecutor {
            runner: self.control.runner().clone(),
            runs: self.runs().clone(),
            clock: self.control.clock().clone(),
            suite_id: suite_id.clone(),
        };
        let rows = run_scenarios(executor, &commands, plan.runs, plan.concurrency).await?;
        let runs = SuiteRuns {
            suite_id: suite_id.clone(),
            scenarios: plan.scenarios.clone(),
            runs_per_scenario: plan.runs,
            runs: rows,
        };
        let runs_file = self
            .config()
            .root
            .join(SUITES_DIR)
            .join(&suite_id)
            .join(SUITE_RUNS_FILE);
        write_pretty_json(&runs_file, &runs).await?;

        let (report, outcome) = self.suite_gate(&runs_file, scenarios_contract).await?;
        info!(suite_id = %suite_id, pass_rate = report.pass_rate, "suite finished");
        Ok(SuiteResult {
            suite_id,
            runs_file,
            runs,
            report,
            outcome,
        })
    }

    /// Scores every parameter combination of every benchmark against the
    /// latest RUN_DONE receipt and writes the results file. Each scored run
    /// also gets `limits/{run_id}.json`.
    #[instrument(skip(self))]
    pub async fn bench(&self, options: &BenchOptions) -> Result<(PathBuf, BenchReport)> {
        let benchmarks = load_benchmarks(&self.resolve_path(&options.benchmarks_dir)).await?;
        let limits_dir = self.config().root.join(BENCH_LIMITS_DIR);
        let mut report = BenchReport::default();

        for benchmark in benchmarks {
            for parameters in expand_parameters(&benchmark.parameters)? {
                if options.execute {
                    let (run_id, outcome) = self.run(None, false).await?;
                    if outcome != CycleOutcome::Done {
                        bail!("benchmark run {run_id} ended {outcome:?}");
                    }
                }
                let mut row = BenchResult {
                    benchmark_id: benchmark.benchmark_id.clone(),
                    stress_axis: benchmark.stress_axis.clone(),
                    parameters,
                    ..BenchResult::default()
                };
                if let Some(receipt) = self.latest_run_done().await? {
                    let lifecycle =
                        compute_lifecycle_aggregates(&self.control.journal().read_all().await?);
                    let indicators = lifecycle
                        .by_run
                        .get(receipt.run_id.as_str())
                        .map(ScalingIndicators::from_rollup)
                        .unwrap_or_default();
                    let limit = LimitReport {
                        run_id: receipt.run_id.to_string(),
                        limit: indicators.limit().map(str::to_owned),
                        indicators,
                    };
                    let path = limits_dir.join(format!("{}.json", receipt.run_id));
                    write_pretty_json(&path, &limit).await?;

                    row.run_id = Some(limit.run_id);
                    row.dispatch_hash = Some(receipt.dispatch_hash.to_string());
                    row.head = Some(receipt.head);
                    row.limit = limit.limit;
                    row.indicators = Some(limit.indicators);
                } else {
                    warn!(benchmark = ?benchmark.benchmark_id, "no RUN_DONE receipt to score");
                }
                report.results.push(row);
            }
        }

        let results_path = self.resolve_path(&options.results_path);
        write_pretty_json(&results_path, &report).await?;
        info!(results = report.results.len(), "benchmarks scored");
        Ok((results_path, report))
    }

    async fn latest_run_done(&self) -> Result<Option<Receipt>> {
        Ok(self
            .control
            .terminal_receipts()
            .await?
            .into_iter()
            .filter(|receipt| receipt.kind == ReceiptKind::RunDone)
            .next_back())
    }

    /// Tails a run's telemetry log and hands one frame per tick to `emit`.
    /// Without a pinned run id the watch follows `LATEST` and starts over
    /// when it moves.
    pub async fn watch(
        &self,
        options: &WatchOptions,
        mut emit: impl FnMut(&WatchFrame),
    ) -> Result<()> {
        let pinned = options
            .run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(RunId::from);
        let hub = EventStreamHub::new(4096);
        let mut events = hub.subscribe();
        let mut run_id = match &pinned {
            Some(id) => Some(id.clone()),
            None => self.runs().read_latest().await?,
        };
        let mut tail = run_id
            .as_ref()
            .map(|id| EventTail::new(self.runs().run_dir(id).join(EVENTS_FILE), hub.clone()));
        let mut state = WatchState::new(options.max_errors);
        let mut ticks = 0u64;

        loop {
            let moved = match &pinned {
                Some(_) => None,
                None => self
                    .runs()
                    .read_latest()
                    .await?
                    .filter(|latest| run_id.as_ref() != Some(latest)),
            };
            if let Some(latest) = moved {
                info!(run_id = %latest, "following new run");
                tail = Some(EventTail::new(
                    self.runs().run_dir(&latest).join(EVENTS_FILE),
                    hub.clone(),
                ));
                state = WatchState::new(options.max_errors);
                run_id = Some(latest);
            }

            if let Some(tail) = tail.as_mut() {
                tail.poll().await?;
            }
            let mut new_events = 0;
            let mut last = None;
            loop {
                match events.try_recv() {
                    Ok(record) => {
                        new_events += 1;
                        last = Some(state.observe(&record));
                    }
                    Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "watch lagged"),
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }

            let (label, metrics) = match &run_id {
                Some(id) => (id.to_string(), load_metrics(&self.runs().run_dir(id)).await),
                None => (String::new(), Default::default()),
            };
            emit(&state.frame(&label, new_events, last, metrics));

            ticks += 1;
            if options.ticks.is_some_and(|limit| ticks >= limit) {
                return Ok(());
            }
            tokio::time::sleep(options.interval).await;
        }
    }
}
