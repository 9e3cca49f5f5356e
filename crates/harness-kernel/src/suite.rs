//! Scenario suites. Each scenario command runs `runs` times, every run under
//! a run id allocated here and exported to the command, with at most
//! `concurrency` commands in flight.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use harness_events::EventLog;
use harness_events::runs::RunArtifacts;
use harness_policy::{SuiteRun, summarize};
use harness_protocol::{Clock, CommandRunner, RUN_ID_ENV, RunId, TelemetryEvent, canonical};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

pub const SUITES_DIR: &str = "artifacts/abm_suites";
pub const SUITE_RUNS_FILE: &str = "suite_runs.json";
pub const SCENARIO_ENV: &str = "HARNESS_SCENARIO";
pub const SUITE_ID_ENV: &str = "HARNESS_SUITE_ID";

/// `scenario -> shell command`.
pub type ScenarioCommands = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuitePlan {
    pub scenarios: Vec<String>,
    pub runs: u32,
    pub concurrency: usize,
    pub seed: Option<u64>,
    pub suite_id: Option<String>,
}

impl SuitePlan {
    /// Scenario names are sorted and de-duplicated; blanks are dropped.
    pub fn new<S: Into<String>>(scenarios: impl IntoIterator<Item = S>, runs: u32) -> Self {
        let mut scenarios: Vec<String> = scenarios
            .into_iter()
            .map(Into::into)
            .map(|name: String| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect();
        scenarios.sort();
        scenarios.dedup();
        Self {
            scenarios,
            runs: runs.max(1),
            concurrency: 1,
            seed: None,
            suite_id: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_suite_id(mut self, suite_id: Option<String>) -> Self {
        self.suite_id = suite_id;
        self
    }

    /// The requested id; else `{now}-{hash}` under a pinned clock; else
    /// `suite-{hash}` derived from the seed; else `suite-` and random hex.
    pub fn resolve_suite_id(&self, now_override: Option<&str>) -> String {
        if let Some(id) = self.suite_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_owned();
        }
        let key = format!("{}|{}", self.scenarios.join(","), self.runs);
        if let Some(now) = now_override.map(str::trim).filter(|now| !now.is_empty()) {
            let hash = canonical::sha256_hex(format!("{now}|{key}").as_bytes());
            return format!("{now}-{}", &hash[..8]);
        }
        let suffix = match self.seed {
            Some(seed) => canonical::sha256_hex(format!("seed:{seed}|{key}").as_bytes()),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        format!("suite-{}", &suffix[..8])
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// The built-in scenarios, driving `program` against `root`.
pub fn builtin_scenarios(program: &Path, root: &Path) -> ScenarioCommands {
    let base = format!(
        "{} --root {}",
        shell_quote(&program.to_string_lossy()),
        shell_quote(&root.to_string_lossy())
    );
    BTreeMap::from([
        ("orc_verify_dod".to_owned(), format!("{base} verify --check dod")),
        (
            "orc_smoke".to_owned(),
            format!("{base} run --loop && {base} verify --check dod"),
        ),
    ])
}

/// A contract's `scenarios.{name}.command` wins over the built-in command.
pub fn resolve_commands(
    contract: &Value,
    builtins: &ScenarioCommands,
    scenarios: &[String],
) -> Result<ScenarioCommands> {
    let mut commands = ScenarioCommands::new();
    for name in scenarios {
        let declared = contract
            .get("scenarios")
            .and_then(|entries| entries.get(name))
            .and_then(|entry| entry.get("command"));
        let command = match declared {
            Some(Value::String(command)) if !command.trim().is_empty() => command.clone(),
            Some(other) if !other.is_null() => {
                bail!("scenarios.{name}.command must be a non-empty string")
            }
            _ => builtins
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("unknown scenario {name}: no command"))?,
        };
        commands.insert(name.clone(), command);
    }
    Ok(commands)
}

#[derive(Clone)]
pub(crate) struct ScenarioExecutor {
    pub runner: Arc<dyn CommandRunner>,
    pub runs: RunArtifacts,
    pub clock: Arc<dyn Clock>,
    pub suite_id: String,
}

impl ScenarioExecutor {
    #[instrument(skip(self, command), fields(suite_id = %self.suite_id))]
    async fn run_one(&self, scenario: String, index: u32, command: String) -> Result<SuiteRun> {
        let run_id = RunId::generate(&self.clock.now_utc());
        self.runs.create(&run_id).await?;
        let env = [
            (RUN_ID_ENV.to_owned(), run_id.to_string()),
            (SCENARIO_ENV.to_owned(), scenario.clone()),
            (SUITE_ID_ENV.to_owned(), self.suite_id.clone()),
        ];
        info!(run_id = %run_id, "scenario run started");
        let outcome = self
            .runner
            .run_with_env(&command, &env)
            .await
            .with_context(|| format!("scenario {scenario} did not start"))?;

        let name = format!("scenario:{scenario}");
        let log = self.runs.events_log(&run_id);
        let step = TelemetryEvent::new("step", &name)
            .with_ms(outcome.duration_ms)
            .with_meta("exit_code", outcome.exit_code);
        log.append(&step.into()).await?;
        if !outcome.succeeded() {
            let class = if outcome.timed_out { "timeout" } else { "scenario_failed" };
            warn!(run_id = %run_id, exit_code = outcome.exit_code, class, "scenario run failed");
            let error = TelemetryEvent::new("error", &name).with_meta("error_class", class);
            log.append(&error.into()).await?;
        }

        let (_, aggregates) = self.runs.aggregate(&run_id, false).await?;
        Ok(SuiteRun {
            index,
            scenario,
            run_id: run_id.to_string(),
            return_code: outcome.exit_code,
            summary: summarize(&aggregates.telemetry),
        })
    }
}

/// Rows ordered by scenario, then index.
pub(crate) async fn run_scenarios(
    executor: ScenarioExecutor,
    commands: &ScenarioCommands,
    runs: u32,
    concurrency: usize,
) -> Result<Vec<SuiteRun>> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::new();
    for (scenario, command) in commands {
        for index in 1..=runs {
            let permits = Arc::clone(&permits);
            let executor = executor.clone();
            let scenario = scenario.clone();
            let command = command.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .context("suite permits closed")?;
                executor.run_one(scenario, index, command).await
            }));
        }
    }

    let mut rows = Vec::with_capacity(handles.len());
    for handle in handles {
        rows.push(handle.await.context("scenario task aborted")??);
    }
    rows.sort_by(|a, b| (a.scenario.as_str(), a.index).cmp(&(b.scenario.as_str(), b.index)));
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_sorts_and_dedups_scenarios() {
        let plan = SuitePlan::new(["smoke", " ", "dod", "smoke"], 0).with_concurrency(0);
        assert_eq!(plan.scenarios, vec!["dod", "smoke"]);
        assert_eq!(plan.runs, 1);
        assert_eq!(plan.concurrency, 1);
    }

    #[test]
    fn suite_id_prefers_request_then_clock_then_seed() {
        let plan = SuitePlan::new(["a", "b"], 2);
        assert_eq!(
            plan.clone().with_suite_id(Some("nightly".into())).resolve_suite_id(Some("now")),
            "nightly"
        );

        let pinned = plan.resolve_suite_id(Some("2026-01-01T00:00:00Z"));
        let hash = canonical::sha256_hex(b"2026-01-01T00:00:00Z|a,b|2");
        assert_eq!(pinned, format!("2026-01-01T00:00:00Z-{}", &hash[..8]));

        let seeded = plan.clone().with_seed(Some(7));
        assert_eq!(seeded.resolve_suite_id(None), seeded.resolve_suite_id(None));
        assert!(seeded.resolve_suite_id(None).starts_with("suite-"));
        assert_ne!(
            seeded.resolve_suite_id(None),
            plan.clone().with_seed(Some(8)).resolve_suite_id(None)
        );
        assert_eq!(plan.resolve_suite_id(None).len(), "suite-".len() + 8);
    }

    #[test]
    fn contract_commands_override_builtins() {
        let builtins = builtin_scenarios(Path::new("/bin/harnessd"), Path::new("/repo's"));
        assert_eq!(
            builtins["orc_verify_dod"],
            r"'/bin/harnessd' --root '/repo'\''s' verify --check dod"
        );

        let contract = json!({"scenarios": {"orc_smoke": {"command": "make smoke"}}});
        let names = vec!["orc_smoke".to_owned(), "orc_verify_dod".to_owned()];
        let commands = resolve_commands(&contract, &builtins, &names).unwrap();
        assert_eq!(commands["orc_smoke"], "make smoke");
        assert_eq!(commands["orc_verify_dod"], builtins["orc_verify_dod"]);

        let err = resolve_commands(&contract, &builtins, &["nope".to_owned()]).unwrap_err();
        assert_eq!(err.to_string(), "unknown scenario nope: no command");

        let blank = json!({"scenarios": {"orc_smoke": {"command": " "}}});
        assert!(resolve_commands(&blank, &builtins, &names).is_err());
    }
}
