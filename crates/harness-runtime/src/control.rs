use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use harness_events::runs::{RunArtifacts, write_lifecycle_aggregates};
use harness_events::{EventJournal, EventLog, EventStreamHub};
use harness_ledger::{DispatchStore, ReceiptLedger, ReceiptRequest};
use harness_protocol::{
    Clock, CommandRunner, ContentHash, CycleId, EventRecord, HarnessError,
    LIFECYCLE_EVENT_VERSION, LifecycleEvent, LifecycleEventType, Payload, RUN_ID_ENV, Receipt,
    ReceiptKind, RunId, TelemetryEvent, VersionControl, WORK_ORDER_ID_ENV, WorkOrder,
    WorkOrderId,
};
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::status::StatusJournal;
use crate::verify::{CheckName, Verifier, VerifyMode, VerifyReport};

const ATTEMPT_ID: &str = "attempt-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A work order was completed or promoted; another cycle may follow.
    Advanced,
    /// RUN_DONE was written.
    Done,
    /// RUN_FAIL was written.
    Failed,
}

impl CycleOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Advanced | Self::Done => 0,
            Self::Failed => 1,
        }
    }
}

fn payload(pairs: &[(&str, Value)]) -> Payload {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), value.clone()))
        .collect()
}

/// The first [`HarnessError`] in `err`'s cause chain.
fn harness_error(err: &anyhow::Error) -> Option<&HarnessError> {
    err.chain().find_map(|cause| cause.downcast_ref::<HarnessError>())
}

/// Ledger corruption and exclusive-create collisions anywhere in the chain.
fn is_fatal(err: &anyhow::Error) -> bool {
    harness_error(err).is_some_and(HarnessError::is_fatal)
}

fn status_word(passed: bool) -> &'static str {
    if passed { "pass" } else { "fail" }
}

fn failed_checks(report: &VerifyReport) -> Value {
    json!(
        report
            .checks
            .iter()
            .filter(|check| !check.ok)
            .map(|check| check.name.as_str())
            .collect::<Vec<_>>()
    )
}

/// Fixed identity of one cycle, stamped on each lifecycle event it emits.
struct CycleContext {
    run_id: RunId,
    work_order_id: WorkOrderId,
    cycle_id: CycleId,
    dispatch_hash: ContentHash,
    head: String,
}

/// Select, attempt, verify, advance, promote.
///
/// One instance per repository. Each cycle finishes all of its side effects
/// before returning, and a later invocation resumes from the dispatch file,
/// the event log and the receipt ledger alone.
#[derive(Clone)]
pub struct ControlLoop {
    config: RuntimeConfig,
    store: DispatchStore,
    ledger: ReceiptLedger,
    lifecycle_log: Arc<dyn EventLog>,
    journal: EventJournal,
    runs: RunArtifacts,
    verifier: Verifier,
    status: StatusJournal,
    vcs: Arc<dyn VersionControl>,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
}

impl ControlLoop {
    pub fn new(
        config: RuntimeConfig,
        lifecycle_log: Arc<dyn EventLog>,
        stream: EventStreamHub,
        vcs: Arc<dyn VersionControl>,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: DispatchStore::new(&config.dispatch_path),
            ledger: ReceiptLedger::new(&config.receipts_dir, clock.clone()),
            journal: EventJournal::new(lifecycle_log.clone(), stream),
            runs: RunArtifacts::new(&config.runs_dir),
            verifier: Verifier::new(
                config.clone(),
                lifecycle_log.clone(),
                vcs.clone(),
                runner.clone(),
            ),
            status: StatusJournal::new(&config.status_path, clock.clone()),
            lifecycle_log,
            config,
            vcs,
            runner,
            clock,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &DispatchStore {
        &self.store
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn runs(&self) -> &RunArtifacts {
        &self.runs
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn vcs(&self) -> &Arc<dyn VersionControl> {
        &self.vcs
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Allocates a run id, creates its run directory and records it in `LATEST`.
    pub async fn start_run(&self) -> Result<RunId> {
        let run_id = RunId::generate(&self.clock.now_utc());
        self.open_run(&run_id).await?;
        Ok(run_id)
    }

    /// Starts a run under an id allocated elsewhere, such as a suite runner.
    pub async fn open_run(&self, run_id: &RunId) -> Result<()> {
        self.runs.create(run_id).await?;
        self.runs.write_latest(run_id).await?;
        info!(run_id = %run_id, "run started");
        Ok(())
    }

    /// RUN_DONE and RUN_FAIL receipts of every run, oldest first.
    pub async fn terminal_receipts(&self) -> Result<Vec<Receipt>> {
        Ok(self.ledger.terminal_receipts().await?)
    }

    /// Repeats cycles while they advance.
    pub async fn run_loop(&self, run_id: &RunId) -> Result<CycleOutcome> {
        loop {
            let outcome = self.run_cycle(run_id).await?;
            if outcome != CycleOutcome::Advanced {
                return Ok(outcome);
            }
        }
    }

    /// Readies `id` outside a run and commits the dispatch if it changed.
    #[instrument(skip(self), fields(work_order_id = %id))]
    pub async fn mark_ready(&self, id: &WorkOrderId) -> Result<bool> {
        let mut dispatch = self.store.load().await?;
        let changed = dispatch.mark_ready(id)?;
        if changed {
            self.store.save(&dispatch).await?;
            self.vcs
                .commit_paths(
                    std::slice::from_ref(&self.config.dispatch_path),
                    &format!("dispatch: ready {id}"),
                )
                .await?;
            info!("work order marked ready");
        }
        Ok(changed)
    }

    /// One cycle. A fatal error (ledger corruption, receipt collision) is
    /// returned as `Err` without touching the ledger again. Any other error
    /// ends the run with a RUN_FAIL receipt, unless the run already has its
    /// terminal receipt or the receipt itself cannot be written.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn run_cycle(&self, run_id: &RunId) -> Result<CycleOutcome> {
        match self.cycle(run_id).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.fail_cycle(run_id, err).await,
        }
    }

    async fn fail_cycle(&self, run_id: &RunId, err: anyhow::Error) -> Result<CycleOutcome> {
        if is_fatal(&err) {
            error!(error = %format!("{err:#}"), "ledger integrity failure, halting run");
            return Err(err);
        }
        warn!(error = %format!("{err:#}"), "cycle failed");

        match self.ledger.has_terminal(run_id).await {
            Ok(false) => {}
            Ok(true) => return Err(err),
            Err(lookup) => {
                return Err(err.context(format!("terminal receipt lookup failed: {lookup}")));
            }
        }
        let summary = payload(&[
            ("reason", json!("cycle error")),
            ("error", json!(format!("{err:#}"))),
        ]);
        if let Err(receipt_err) = self
            .receipt(ReceiptKind::RunFail, run_id, None, Some(summary))
            .await
        {
            error!(error = %format!("{receipt_err:#}"), "failed writing RUN_FAIL receipt");
            return Err(err.context(format!("RUN_FAIL receipt not written: {receipt_err:#}")));
        }
        if let Err(refresh) = self.refresh_aggregates(run_id).await {
            warn!(error = %format!("{refresh:#}"), "failed refreshing aggregates");
        }
        Ok(CycleOutcome::Failed)
    }

    async fn cycle(&self, run_id: &RunId) -> Result<CycleOutcome> {
        self.vcs.ensure_repo().await.context("git repo missing")?;

        let dispatch = self.store.load().await.context("failed loading dispatch")?;
        let ready = dispatch.ready_ids();
        if ready.len() > 1 {
            let ids: Vec<&str> = ready.iter().map(|id| id.as_str()).collect();
            warn!(ready = %ids.join(", "), "multiple ready work orders (wip=1)");
            self.receipt(
                ReceiptKind::RunFail,
                run_id,
                None,
                Some(payload(&[
                    ("reason", json!("multiple ready work orders")),
                    ("ready", json!(ids)),
                ])),
            )
            .await?;
            self.refresh_aggregates(run_id).await?;
            return Ok(CycleOutcome::Failed);
        }

        let Some(wo) = ready.first().and_then(|id| dispatch.get(id)).cloned() else {
            if self.promote(run_id, None).await?.is_some() {
                self.refresh_aggregates(run_id).await?;
                return Ok(CycleOutcome::Advanced);
            }
            return self.finish(run_id, None).await;
        };

        self.attempt(run_id, &wo).await
    }

    async fn attempt(&self, run_id: &RunId, wo: &WorkOrder) -> Result<CycleOutcome> {
        let ctx = CycleContext {
            run_id: run_id.clone(),
            work_order_id: wo.id.clone(),
            cycle_id: self.journal.next_cycle_id(run_id).await?,
            dispatch_hash: self.store.hash().await?,
            head: self.vcs.head().await,
        };
        info!(work_order_id = %wo.id, cycle_id = %ctx.cycle_id, "cycle started");

        self.emit(&ctx, LifecycleEventType::CycleStart, Payload::new())
            .await?;
        self.emit(
            &ctx,
            LifecycleEventType::AttemptStart,
            payload(&[("attempt_id", json!(ATTEMPT_ID))]),
        )
        .await?;
        self.emit(&ctx, LifecycleEventType::VerifyStart, Payload::new())
            .await?;

        let acceptance_ok = self.run_acceptance(run_id, wo).await?;
        self.refresh_aggregates(run_id).await?;

        let started = Instant::now();
        let report = self.verifier.run_mode(VerifyMode::Work).await;
        self.telemetry(
            run_id,
            TelemetryEvent::new("step", "verify:work")
                .with_ms(started.elapsed().as_secs_f64() * 1000.0),
        )
        .await?;
        if report.get(CheckName::Scope).is_some_and(|check| !check.ok) {
            self.telemetry(
                run_id,
                TelemetryEvent::new("error", "verify:scope")
                    .with_meta("error_class", "scope_violation")
                    .with_meta("work_order_id", wo.id.as_str()),
            )
            .await?;
        }

        let passed = acceptance_ok && report.passed();
        self.emit(
            &ctx,
            LifecycleEventType::VerifyResult,
            payload(&[("status", json!(status_word(passed)))]),
        )
        .await?;
        self.emit(
            &ctx,
            LifecycleEventType::AttemptEnd,
            payload(&[
                ("attempt_id", json!(ATTEMPT_ID)),
                ("status", json!(status_word(passed))),
            ]),
        )
        .await?;

        if !passed {
            warn!(work_order_id = %wo.id, "work order failed verification");
            self.status.append(&format!("FAIL {}", wo.id)).await?;
            self.receipt(
                ReceiptKind::RunFail,
                run_id,
                None,
                Some(payload(&[
                    ("work_order_id", json!(wo.id.as_str())),
                    ("acceptance", json!(status_word(acceptance_ok))),
                    ("failed_checks", failed_checks(&report)),
                ])),
            )
            .await?;
            self.end_cycle(&ctx, false).await?;
            return Ok(CycleOutcome::Failed);
        }

        self.complete(&ctx).await?;
        if self.promote(run_id, Some(&ctx)).await?.is_some() {
            self.end_cycle(&ctx, true).await?;
            return Ok(CycleOutcome::Advanced);
        }
        self.finish(run_id, Some(&ctx)).await
    }

    /// Runs every acceptance command, recording one telemetry step each.
    async fn run_acceptance(&self, run_id: &RunId, wo: &WorkOrder) -> Result<bool> {
        let env = [
            (RUN_ID_ENV.to_owned(), run_id.to_string()),
            (WORK_ORDER_ID_ENV.to_owned(), wo.id.to_string()),
        ];
        let mut ok = true;
        for check in &wo.acceptance {
            let name = format!("acceptance:{}", check.name);
            let outcome = match self.runner.run_with_env(&check.command, &env).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(check = %check.name, error = %err, "acceptance command could not start");
                    ok = false;
                    self.telemetry(
                        run_id,
                        TelemetryEvent::new("error", &name)
                            .with_meta("error_class", "spawn_failed")
                            .with_meta("work_order_id", wo.id.as_str()),
                    )
                    .await?;
                    continue;
                }
            };

            self.telemetry(
                run_id,
                TelemetryEvent::new("step", &name)
                    .with_ms(outcome.duration_ms)
                    .with_meta("exit_code", outcome.exit_code)
                    .with_meta("work_order_id", wo.id.as_str()),
            )
            .await?;

            if !outcome.succeeded() {
                ok = false;
                warn!(
                    check = %check.name,
                    exit_code = outcome.exit_code,
                    diagnostic = %outcome.diagnostic(),
                    "acceptance command failed"
                );
                let class = if outcome.timed_out {
                    "timeout"
                } else {
                    "acceptance_failed"
                };
                self.telemetry(
                    run_id,
                    TelemetryEvent::new("error", &name)
                        .with_meta("error_class", class)
                        .with_meta("work_order_id", wo.id.as_str()),
                )
                .await?;
            }
        }
        Ok(ok)
    }

    async fn complete(&self, ctx: &CycleContext) -> Result<()> {
        let id = &ctx.work_order_id;
        let mut dispatch = self.store.load().await?;
        dispatch.mark_done(id)?;
        self.store.save(&dispatch).await?;
        self.emit(
            ctx,
            LifecycleEventType::StateTransition,
            payload(&[("to_state", json!("done"))]),
        )
        .await?;
        self.vcs
            .commit_all(&format!("harness: complete {id}"))
            .await?;
        self.receipt(ReceiptKind::Complete, &ctx.run_id, Some(id.clone()), None)
            .await?;
        self.status.append(&format!("PASS {id}")).await?;
        info!(work_order_id = %id, "work order completed");
        Ok(())
    }

    /// Readies the next eligible order, commits the dispatch and writes a
    /// PROMOTE receipt. `None` when nothing is eligible.
    async fn promote(
        &self,
        run_id: &RunId,
        ctx: Option<&CycleContext>,
    ) -> Result<Option<WorkOrderId>> {
        let mut dispatch = self.store.load().await?;
        let Some(id) = dispatch.promote_next()? else {
            return Ok(None);
        };
        self.store.save(&dispatch).await?;
        self.vcs
            .commit_paths(
                std::slice::from_ref(&self.config.dispatch_path),
                &format!("harness: promote {id}"),
            )
            .await?;

        if let Some(ctx) = ctx {
            let event = self.lifecycle_event(
                ctx,
                LifecycleEventType::StateTransition,
                Some(id.clone()),
                payload(&[("to_state", json!("ready"))]),
            );
            self.journal.append_and_publish(event.into()).await?;
        }

        self.receipt(ReceiptKind::Promote, run_id, Some(id.clone()), None)
            .await?;
        self.status.append(&format!("PROMOTE {id}")).await?;
        info!(work_order_id = %id, "work order promoted");
        Ok(Some(id))
    }

    /// Definition-of-done verification and the run's terminal receipt.
    async fn finish(&self, run_id: &RunId, ctx: Option<&CycleContext>) -> Result<CycleOutcome> {
        self.refresh_aggregates(run_id).await?;
        let report = self.verifier.run_mode(VerifyMode::Dod).await;

        let outcome = if report.passed() {
            self.status.append("DONE DoD=PASS").await?;
            self.receipt(ReceiptKind::RunDone, run_id, None, None).await?;
            info!(run_id = %run_id, "run done");
            CycleOutcome::Done
        } else {
            warn!(failed = %failed_checks(&report), "definition of done failed");
            self.status.append("FAIL DoD=FAIL").await?;
            self.receipt(
                ReceiptKind::RunFail,
                run_id,
                None,
                Some(payload(&[("failed_checks", failed_checks(&report))])),
            )
            .await?;
            CycleOutcome::Failed
        };

        match ctx {
            Some(ctx) => self.end_cycle(ctx, outcome == CycleOutcome::Done).await?,
            None => self.refresh_aggregates(run_id).await?,
        }
        Ok(outcome)
    }

    async fn end_cycle(&self, ctx: &CycleContext, passed: bool) -> Result<()> {
        self.emit(
            ctx,
            LifecycleEventType::CycleEnd,
            payload(&[("status", json!(status_word(passed)))]),
        )
        .await?;
        self.refresh_aggregates(&ctx.run_id).await
    }

    fn lifecycle_event(
        &self,
        ctx: &CycleContext,
        event_type: LifecycleEventType,
        work_order_id: Option<WorkOrderId>,
        detail: Payload,
    ) -> LifecycleEvent {
        LifecycleEvent {
            event_version: LIFECYCLE_EVENT_VERSION.to_owned(),
            event_type,
            timestamp_utc: self.clock.now_utc(),
            run_id: ctx.run_id.clone(),
            dispatch_hash: ctx.dispatch_hash.clone(),
            head: ctx.head.clone(),
            work_order_id,
            cycle_id: Some(ctx.cycle_id.clone()),
            agent_id: self.config.agent_id.clone(),
            detail,
        }
    }

    async fn emit(
        &self,
        ctx: &CycleContext,
        event_type: LifecycleEventType,
        detail: Payload,
    ) -> Result<()> {
        let event = self.lifecycle_event(
            ctx,
            event_type,
            Some(ctx.work_order_id.clone()),
            detail,
        );
        self.journal.append_and_publish(event.into()).await
    }

    async fn telemetry(&self, run_id: &RunId, mut event: TelemetryEvent) -> Result<()> {
        event.ts = Some(self.clock.now_utc());
        self.runs
            .events_log(run_id)
            .append(&EventRecord::Telemetry(event))
            .await
    }

    async fn receipt(
        &self,
        kind: ReceiptKind,
        run_id: &RunId,
        work_order_id: Option<WorkOrderId>,
        summary: Option<Payload>,
    ) -> Result<PathBuf> {
        let mut request = ReceiptRequest::new(kind, run_id.clone(), self.vcs.head().await);
        if let Some(id) = work_order_id {
            request = request.for_work_order(id);
        }
        if let Some(summary) = summary {
            request = request.with_summary(summary);
        }
        let path = self
            .ledger
            .write(&self.store, request)
            .await
            .with_context(|| format!("failed writing {kind} receipt"))?;
        Ok(path)
    }

    /// Rewrites the lifecycle aggregates and the run's telemetry aggregates.
    async fn refresh_aggregates(&self, run_id: &RunId) -> Result<()> {
        write_lifecycle_aggregates(self.lifecycle_log.as_ref(), &self.config.lifecycle_aggregates)
            .await?;
        self.runs.aggregate(run_id, false).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fixture, dispatch_value, unique_test_root};
    use harness_events::FileEventLog;
    use harness_protocol::FixedClock;
    use serde_json::json;
    use tokio::fs;

    fn control(fixture: &Fixture) -> ControlLoop {
        ControlLoop::new(
            fixture.config.clone(),
            Arc::new(FileEventLog::new(&fixture.config.lifecycle_log)),
            EventStreamHub::new(64),
            fixture.vcs.clone(),
            fixture.runner.clone(),
            Arc::new(FixedClock::new("2026-02-03T04:05:06Z")),
        )
    }

    async fn receipt_names(fixture: &Fixture, dir: &str) -> Result<Vec<String>> {
        let dir = fixture.config.receipts_dir.join(dir);
        let mut names = Vec::new();
        if !fs::try_exists(&dir).await? {
            return Ok(names);
        }
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn receipt_kinds(fixture: &Fixture, dir: &str) -> Result<Vec<String>> {
        let mut kinds = Vec::new();
        for name in receipt_names(fixture, dir).await? {
            let raw = fs::read_to_string(fixture.config.receipts_dir.join(dir).join(name)).await?;
            let value: Value = serde_json::from_str(&raw)?;
            kinds.push(value["kind"].as_str().unwrap_or_default().to_owned());
        }
        kinds.sort();
        Ok(kinds)
    }

    #[tokio::test]
    async fn loop_completes_dependency_chain_and_finishes() -> Result<()> {
        let root = unique_test_root("harness-loop-chain");
        let mut value = dispatch_value(&[("WO-1", true, false), ("WO-2", false, false)]);
        value["work_orders"][1]["depends_on"] = json!(["WO-1"]);
        let fixture = Fixture::from_value(&root, value).await?;
        let harness = control(&fixture);
        let mut events = harness.journal().subscribe();

        let run_id = harness.start_run().await?;
        let outcome = harness.run_loop(&run_id).await?;

        assert_eq!(outcome, CycleOutcome::Done);
        let dispatch = harness.store().load().await?;
        assert!(dispatch.work_orders.iter().all(|wo| wo.done && !wo.ready));
        assert_eq!(
            fixture.vcs.commits(),
            vec![
                "harness: complete WO-1",
                "harness: promote WO-2",
                "harness: complete WO-2",
            ]
        );
        assert_eq!(receipt_kinds(&fixture, "WO-1").await?, vec!["COMPLETE"]);
        assert_eq!(receipt_kinds(&fixture, "WO-2").await?, vec!["COMPLETE", "PROMOTE"]);
        assert_eq!(receipt_kinds(&fixture, "RUN").await?, vec!["RUN_DONE"]);

        let status = fs::read_to_string(&fixture.config.status_path).await?;
        let lines: Vec<&str> = status
            .lines()
            .filter_map(|line| line.split_once(' ').map(|(_, text)| text))
            .collect();
        assert_eq!(lines, vec!["PASS WO-1", "PROMOTE WO-2", "PASS WO-2", "DONE DoD=PASS"]);

        let cycles: Vec<String> = harness
            .journal()
            .read_all()
            .await?
            .iter()
            .filter_map(EventRecord::as_lifecycle)
            .filter(|event| event.event_type == LifecycleEventType::CycleStart)
            .filter_map(|event| event.cycle_id.as_ref().map(|id| id.as_str().to_owned()))
            .collect();
        assert_eq!(cycles, vec!["cycle-0001", "cycle-0002"]);
        assert!(events.try_recv().is_ok());

        let run = harness.runs().load_aggregates(&run_id).await?;
        assert_eq!(run.telemetry.counts_by_name["acceptance:check"], 2);
        assert_eq!(run.telemetry.counts_by_name["verify:work"], 2);
        assert!(harness.verifier().run_mode(VerifyMode::Dod).await.passed());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn idle_cycle_promotes_first_eligible_order() -> Result<()> {
        let root = unique_test_root("harness-loop-promote");
        let fixture = Fixture::new(&root, &[("WO-2", false, false), ("WO-1", false, false)]).await?;
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;

        let outcome = harness.run_cycle(&run_id).await?;

        assert_eq!(outcome, CycleOutcome::Advanced);
        assert_eq!(fixture.vcs.commits(), vec!["harness: promote WO-2"]);
        let dispatch = harness.store().load().await?;
        assert_eq!(dispatch.ready_ids().len(), 1);
        assert_eq!(receipt_kinds(&fixture, "WO-2").await?, vec!["PROMOTE"]);
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn failed_acceptance_writes_run_fail_and_keeps_order_ready() -> Result<()> {
        let root = unique_test_root("harness-loop-fail");
        let fixture = Fixture::new(&root, &[("WO-1", true, false)]).await?;
        fixture.runner.fail("check WO-1");
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;

        let outcome = harness.run_cycle(&run_id).await?;

        assert_eq!(outcome, CycleOutcome::Failed);
        assert_eq!(outcome.exit_code(), 1);
        assert!(fixture.vcs.commits().is_empty());
        assert_eq!(receipt_kinds(&fixture, "RUN").await?, vec!["RUN_FAIL"]);
        assert!(harness.store().load().await?.work_orders[0].ready);

        let run = harness.runs().load_aggregates(&run_id).await?;
        assert_eq!(run.telemetry.errors_by_class["acceptance_failed"], 1);

        let ends: Vec<String> = harness
            .journal()
            .read_all()
            .await?
            .iter()
            .filter_map(EventRecord::as_lifecycle)
            .filter(|event| event.event_type == LifecycleEventType::CycleEnd)
            .map(|event| event.detail["status"].to_string())
            .collect();
        assert_eq!(ends, vec!["\"fail\"".to_owned()]);
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn scope_violation_fails_the_cycle() -> Result<()> {
        let root = unique_test_root("harness-loop-scope");
        let fixture = Fixture::new(&root, &[("WO-1", true, false)]).await?;
        fixture.vcs.set_changed(&["secret.token"]);
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;

        assert_eq!(harness.run_cycle(&run_id).await?, CycleOutcome::Failed);

        let run = harness.runs().load_aggregates(&run_id).await?;
        assert_eq!(run.telemetry.errors_by_class["scope_violation"], 1);
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn two_ready_orders_halt_before_any_event() -> Result<()> {
        let root = unique_test_root("harness-loop-wip");
        let fixture = Fixture::new(&root, &[("WO-1", true, false), ("WO-2", true, false)]).await?;
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;

        assert_eq!(harness.run_cycle(&run_id).await?, CycleOutcome::Failed);
        assert_eq!(receipt_kinds(&fixture, "RUN").await?, vec!["RUN_FAIL"]);
        assert!(harness.journal().read_all().await?.is_empty());
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn acceptance_commands_see_run_and_work_order_ids() -> Result<()> {
        let root = unique_test_root("harness-loop-env");
        let fixture = Fixture::new(&root, &[("WO-1", true, false)]).await?;
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;

        harness.run_cycle(&run_id).await?;

        let envs = fixture.runner.envs();
        assert_eq!(fixture.runner.calls()[0], "check WO-1");
        assert_eq!(
            envs[0],
            vec![
                ("HARNESS_RUN_ID".to_owned(), run_id.to_string()),
                ("HARNESS_WORK_ORDER_ID".to_owned(), "WO-1".to_owned()),
            ]
        );
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn receipt_collision_halts_without_another_receipt() -> Result<()> {
        let root = unique_test_root("harness-loop-collision");
        let fixture = Fixture::new(&root, &[("WO-1", true, false), ("WO-2", true, false)]).await?;
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;
        assert_eq!(harness.run_cycle(&run_id).await?, CycleOutcome::Failed);

        let err = harness.run_cycle(&run_id).await.unwrap_err();

        assert!(is_fatal(&err));
        assert!(matches!(harness_error(&err), Some(HarnessError::AlreadyExists(_))));
        assert_eq!(receipt_kinds(&fixture, "RUN").await?, vec!["RUN_FAIL"]);
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn commit_failure_ends_the_run_with_run_fail() -> Result<()> {
        let root = unique_test_root("harness-loop-commit-error");
        let fixture = Fixture::new(&root, &[("WO-1", true, false)]).await?;
        fixture.vcs.fail_commits();
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;

        assert_eq!(harness.run_cycle(&run_id).await?, CycleOutcome::Failed);

        assert_eq!(receipt_kinds(&fixture, "RUN").await?, vec!["RUN_FAIL"]);
        assert!(receipt_names(&fixture, "WO-1").await?.is_empty());
        let name = receipt_names(&fixture, "RUN").await?.remove(0);
        let raw = fs::read_to_string(fixture.config.receipts_dir.join("RUN").join(name)).await?;
        let receipt: Value = serde_json::from_str(&raw)?;
        assert_eq!(receipt["summary"]["reason"], "cycle error");
        assert!(
            receipt["summary"]["error"]
                .as_str()
                .is_some_and(|e| e.contains("git commit failed"))
        );
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn empty_dispatch_finishes_done() -> Result<()> {
        let root = unique_test_root("harness-loop-empty");
        let fixture = Fixture::new(&root, &[]).await?;
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;

        assert_eq!(harness.run_cycle(&run_id).await?, CycleOutcome::Done);
        assert_eq!(receipt_kinds(&fixture, "RUN").await?, vec!["RUN_DONE"]);
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn done_order_without_receipt_fails_definition_of_done() -> Result<()> {
        let root = unique_test_root("harness-loop-dod");
        let fixture = Fixture::new(&root, &[("WO-1", false, true)]).await?;
        let harness = control(&fixture);
        let run_id = harness.start_run().await?;

        assert_eq!(harness.run_cycle(&run_id).await?, CycleOutcome::Failed);
        let status = fs::read_to_string(&fixture.config.status_path).await?;
        assert!(status.ends_with("FAIL DoD=FAIL\n"));
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn mark_ready_commits_only_on_change() -> Result<()> {
        let root = unique_test_root("harness-loop-ready");
        let fixture = Fixture::new(&root, &[("WO-1", true, false), ("WO-2", false, false)]).await?;
        let harness = control(&fixture);
        let id = WorkOrderId::from("WO-2");

        assert!(harness.mark_ready(&id).await?);
        assert!(!harness.mark_ready(&id).await?);

        assert_eq!(fixture.vcs.commits(), vec!["dispatch: ready WO-2"]);
        assert_eq!(harness.store().load().await?.ready_ids(), vec![id]);
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
