//! Named verification checks and the modes that group them.
//!
//! Every check in a mode runs even after an earlier one fails; a failing
//! check is a [`CheckReport`] with `ok == false`, not an error.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, bail};
use harness_events::EventLog;
use harness_events::replay::ReplayOutcome;
use harness_events::runs::{RunArtifacts, check_lifecycle_replay};
use harness_ledger::{DispatchStore, audit_receipts};
use harness_policy::ScopeEnforcer;
use harness_protocol::{CommandRunner, Dispatch, HarnessError, VersionControl};
use serde::Serialize;
use tracing::{instrument, warn};

use crate::config::{HooksConfig, RuntimeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Schema,
    Receipts,
    Scope,
    Events,
    Project,
    NoReadyUndone,
}

impl CheckName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Receipts => "receipts",
            Self::Scope => "scope",
            Self::Events => "events",
            Self::Project => "project",
            Self::NoReadyUndone => "no_ready_undone",
        }
    }
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Schema,
    Work,
    Dod,
}

impl VerifyMode {
    pub fn checks(self) -> &'static [CheckName] {
        use CheckName::*;
        match self {
            Self::Schema => &[Schema],
            Self::Work => &[Schema, Receipts, Scope, Events, Project],
            Self::Dod => &[Schema, Receipts, Scope, Events, Project, NoReadyUndone],
        }
    }
}

impl FromStr for VerifyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "schema" => Ok(Self::Schema),
            "work" => Ok(Self::Work),
            "dod" => Ok(Self::Dod),
            other => bail!("unknown verify mode {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub name: CheckName,
    pub ok: bool,
    pub errors: Vec<String>,
}

impl CheckReport {
    fn from_errors(name: CheckName, errors: Vec<String>) -> Self {
        Self {
            name,
            ok: errors.is_empty(),
            errors,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub checks: Vec<CheckReport>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.ok)
    }

    pub fn get(&self, name: CheckName) -> Option<&CheckReport> {
        self.checks.iter().find(|check| check.name == name)
    }

    /// `{name}: OK|FAIL` per check, failures followed by `- {error}` lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            let status = if check.ok { "OK" } else { "FAIL" };
            out.push_str(&format!("{}: {status}\n", check.name));
            for error in &check.errors {
                out.push_str(&format!("- {error}\n"));
            }
        }
        out
    }
}

#[derive(Clone)]
pub struct Verifier {
    config: RuntimeConfig,
    store: DispatchStore,
    lifecycle_log: Arc<dyn EventLog>,
    runs: RunArtifacts,
    vcs: Arc<dyn VersionControl>,
    runner: Arc<dyn CommandRunner>,
}

impl Verifier {
    pub fn new(
        config: RuntimeConfig,
        lifecycle_log: Arc<dyn EventLog>,
        vcs: Arc<dyn VersionControl>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            store: DispatchStore::new(&config.dispatch_path),
            runs: RunArtifacts::new(&config.runs_dir),
            config,
            lifecycle_log,
            vcs,
            runner,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_mode(&self, mode: VerifyMode) -> VerifyReport {
        let mut report = VerifyReport::default();
        for name in mode.checks() {
            report.checks.push(self.run_check(*name).await);
        }
        if !report.passed() {
            warn!(?mode, "verification failed");
        }
        report
    }

    pub async fn run_check(&self, name: CheckName) -> CheckReport {
        let errors = match name {
            CheckName::Schema => self.check_schema().await,
            CheckName::Receipts => self.check_receipts().await,
            CheckName::Scope => self.check_scope().await,
            CheckName::Events => self.check_events().await,
            CheckName::Project => self.check_project().await,
            CheckName::NoReadyUndone => self.check_no_ready_undone().await,
        };
        CheckReport::from_errors(name, errors)
    }

    async fn load_dispatch(&self) -> Result<Dispatch, Vec<String>> {
        self.store.load().await.map_err(|err| match err {
            HarnessError::Schema(reasons) => reasons,
            other => vec![other.to_string()],
        })
    }

    async fn check_schema(&self) -> Vec<String> {
        if !self.store.exists().await {
            return vec!["dispatch.json missing".to_owned()];
        }
        match self.load_dispatch().await {
            Ok(dispatch) => dispatch.validate(),
            Err(reasons) => reasons,
        }
    }

    async fn check_receipts(&self) -> Vec<String> {
        let dispatch = match self.load_dispatch().await {
            Ok(dispatch) => dispatch,
            Err(reasons) => return reasons,
        };
        audit_receipts(&self.config.receipts_dir, &dispatch)
            .await
            .unwrap_or_else(|err| vec![err.to_string()])
    }

    async fn check_scope(&self) -> Vec<String> {
        let dispatch = match self.load_dispatch().await {
            Ok(dispatch) => dispatch,
            Err(reasons) => return reasons,
        };
        let wo = match dispatch.active_work_order() {
            Ok(Some(wo)) => wo,
            Ok(None) => return Vec::new(),
            Err(err) => return vec![err.to_string()],
        };
        let changed = match self.vcs.changed_files().await {
            Ok(changed) => changed,
            Err(err) => return vec![format!("changed files unavailable: {err}")],
        };
        let enforcer = match ScopeEnforcer::compile(&wo.scope) {
            Ok(enforcer) => enforcer,
            Err(err) => return vec![err.to_string()],
        };
        let bookkeeping = self.config.bookkeeping_paths();
        let owned = |path: &str| {
            bookkeeping
                .iter()
                .any(|own| path == own.as_str() || path.starts_with(&format!("{own}/")))
        };
        enforcer
            .check(changed.iter().filter(|path| !owned(path.as_str())))
            .reasons()
    }

    async fn check_events(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let lifecycle = &self.config.lifecycle_aggregates;
        let shown = self.config.display_path(lifecycle);
        match check_lifecycle_replay(self.lifecycle_log.as_ref(), lifecycle).await {
            Ok(ReplayOutcome::Mismatch) => errors.push(format!("{shown} replay mismatch")),
            Ok(_) => {}
            Err(err) => errors.push(format!("{shown} replay failed: {err:#}")),
        }

        let runs = match self.runs.list().await {
            Ok(runs) => runs,
            Err(err) => {
                errors.push(format!("run directories unreadable: {err:#}"));
                return errors;
            }
        };
        for run_id in runs {
            let shown = self.config.display_path(&self.runs.aggregates_path(&run_id));
            match self.runs.check_replay(&run_id).await {
                Ok(ReplayOutcome::Mismatch) => errors.push(format!("{shown} replay mismatch")),
                Ok(_) => {}
                Err(err) => errors.push(format!("{shown} replay failed: {err:#}")),
            }
        }
        errors
    }

    async fn check_project(&self) -> Vec<String> {
        let hooks = match HooksConfig::load(&self.config.hooks_path).await {
            Ok(hooks) => hooks,
            Err(err) => return vec![format!("{err:#}")],
        };
        let mut errors = Vec::new();
        for (name, cmd) in hooks.project_commands() {
            match self.runner.run(cmd).await {
                Ok(outcome) if outcome.succeeded() => {}
                Ok(outcome) => {
                    errors.push(format!("{name} failed: {cmd}"));
                    errors.push(outcome.diagnostic().to_owned());
                }
                Err(err) => {
                    errors.push(format!("{name} failed: {cmd}"));
                    errors.push(err.to_string());
                }
            }
        }
        errors
    }

    async fn check_no_ready_undone(&self) -> Vec<String> {
        let dispatch = match self.load_dispatch().await {
            Ok(dispatch) => dispatch,
            Err(reasons) => return reasons,
        };
        let pending = dispatch.ready_ids();
        if pending.is_empty() {
            return Vec::new();
        }
        let ids: Vec<&str> = pending.iter().map(|id| id.as_str()).collect();
        vec![format!("ready but not done: {}", ids.join(", "))]
    }
}
