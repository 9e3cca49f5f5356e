use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use harness_kernel::bench::{BENCH_RESULTS, BENCHMARKS_DIR, BenchOptions};
use harness_kernel::suite::{SuitePlan, builtin_scenarios};
use harness_kernel::watch::WatchOptions;
use harness_kernel::{DEFAULT_SCENARIOS, DEFAULT_THRESHOLDS, HarnessBuilder};
use harness_protocol::{EventRecord, RUN_ID_ENV, canonical};
use harness_runtime::{CycleOutcome, VerifyMode};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const ECHO_ENV: &str = "HARNESS_STDOUT_EVENTS";

#[derive(Debug, Parser)]
#[command(name = "harnessd")]
#[command(about = "Work-order harness: dispatch, verify, gate")]
struct Cli {
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Mirror lifecycle events to stdout as `HARNESS_EVENT {json}`.
    #[arg(long)]
    echo_events: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one cycle, or cycles until done or failed. `HARNESS_RUN_ID`
    /// continues a run allocated by `suite-run`.
    Run {
        #[arg(long, conflicts_with = "run_loop")]
        once: bool,
        #[arg(long = "loop")]
        run_loop: bool,
    },
    Verify {
        #[arg(long, value_enum, default_value = "work")]
        check: CheckArg,
    },
    /// Mark a work order ready.
    Ready { id: String },
    /// Summarize the active work order.
    Brief,
    Doctor,
    Aggregate {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        partial: bool,
    },
    Gate {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        scenario: Option<String>,
        #[arg(long, default_value = DEFAULT_THRESHOLDS)]
        thresholds: PathBuf,
        #[arg(long, default_value = DEFAULT_SCENARIOS)]
        scenarios_contract: PathBuf,
    },
    SuiteGate {
        #[arg(long)]
        runs: PathBuf,
        #[arg(long, default_value = DEFAULT_SCENARIOS)]
        scenarios_contract: PathBuf,
    },
    /// Run scenarios repeatedly, then roll up and gate the suite.
    SuiteRun {
        #[arg(long = "scenario", required = true)]
        scenarios: Vec<String>,
        #[arg(long, default_value_t = 1)]
        runs: u32,
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        suite_id: Option<String>,
        #[arg(long, default_value = DEFAULT_SCENARIOS)]
        scenarios_contract: PathBuf,
    },
    /// Score benchmark parameter matrices against the latest finished run.
    Bench {
        #[arg(long, default_value = BENCHMARKS_DIR)]
        benchmarks: PathBuf,
        #[arg(long, default_value = BENCH_RESULTS)]
        results: PathBuf,
        /// Run the loop before scoring each combination.
        #[arg(long)]
        execute: bool,
    },
    /// Tail a run's telemetry (default: follow `LATEST`).
    Watch {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        #[arg(long, default_value_t = 5)]
        errors: usize,
        /// Stop after this many updates.
        #[arg(long)]
        ticks: Option<u64>,
        /// Redraw a full-screen panel instead of printing lines.
        #[arg(long)]
        tui: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CheckArg {
    Schema,
    Work,
    Dod,
}

impl From<CheckArg> for VerifyMode {
    fn from(arg: CheckArg) -> Self {
        match arg {
            CheckArg::Schema => Self::Schema,
            CheckArg::Work => Self::Work,
            CheckArg::Dod => Self::Dod,
        }
    }
}

fn print_reasons(reasons: &[String]) -> u8 {
    if reasons.is_empty() {
        println!("PASS");
        return 0;
    }
    for reason in reasons {
        println!("- {reason}");
    }
    1
}

fn echo_enabled(flag: bool) -> bool {
    flag || std::env::var(ECHO_ENV).is_ok_and(|value| value.trim() == "1")
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let harness = HarnessBuilder::new(&cli.root).build();

    let echo_task = echo_enabled(cli.echo_events).then(|| {
        let mut events = harness.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EventRecord::Lifecycle(event)) => {
                        match canonical::to_canonical_string(&event) {
                            Ok(line) => println!("HARNESS_EVENT {line}"),
                            Err(error) => warn!(%error, "failed rendering echoed event"),
                        }
                    }
                    Ok(EventRecord::Telemetry(_)) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event echo lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let code = match cli.command {
        Command::Run { once, run_loop } => {
            let once = once || !run_loop;
            let allocated = std::env::var(RUN_ID_ENV).ok();
            let (run_id, outcome) = harness.run(allocated.as_deref(), once).await?;
            let label = match outcome {
                CycleOutcome::Advanced => "ADVANCED",
                CycleOutcome::Done => "DONE",
                CycleOutcome::Failed => "FAIL",
            };
            println!("{label} run_id={run_id}");
            u8::try_from(outcome.exit_code()).unwrap_or(1)
        }
        Command::Verify { check } => {
            let report = harness.verify(check.into()).await;
            print!("{}", report.render());
            u8::from(!report.passed())
        }
        Command::Ready { id } => {
            if harness.ready(&id).await? {
                println!("READY {id}");
            } else {
                println!("UNCHANGED {id}");
            }
            0
        }
        Command::Brief => {
            print!("{}", harness.brief().await?);
            0
        }
        Command::Doctor => {
            let report = harness.doctor().await?;
            for path in &report.missing {
                println!("missing {path}");
            }
            print!("{}", report.render());
            u8::from(!report.healthy())
        }
        Command::Aggregate { run_id, partial } => {
            let (run_id, path, aggregates) = harness.aggregate(run_id.as_deref(), partial).await?;
            println!(
                "{} run_id={run_id} events={}",
                harness.config().display_path(&path),
                aggregates.event_count
            );
            0
        }
        Command::Gate {
            run_id,
            scenario,
            thresholds,
            scenarios_contract,
        } => {
            let outcome = harness
                .gate(
                    run_id.as_deref(),
                    scenario.as_deref(),
                    &thresholds,
                    &scenarios_contract,
                )
                .await?;
            print_reasons(&outcome.reasons)
        }
        Command::SuiteGate {
            runs,
            scenarios_contract,
        } => {
            let (_report, outcome) = harness.suite_gate(&runs, &scenarios_contract).await?;
            print_reasons(&outcome.reasons)
        }
        Command::SuiteRun {
            scenarios,
            runs,
            concurrency,
            seed,
            suite_id,
            scenarios_contract,
        } => {
            let program = std::env::current_exe().context("cannot locate harnessd binary")?;
            let root = tokio::fs::canonicalize(&cli.root)
                .await
                .with_context(|| format!("invalid root {}", cli.root.display()))?;
            let plan = SuitePlan::new(scenarios, runs)
                .with_concurrency(concurrency)
                .with_seed(seed)
                .with_suite_id(suite_id);
            let result = harness
                .suite_run(&plan, &builtin_scenarios(&program, &root), &scenarios_contract)
                .await?;
            println!(
                "{} suite_id={}",
                harness.config().display_path(&result.runs_file),
                result.suite_id
            );
            print_reasons(&result.outcome.reasons)
        }
        Command::Bench {
            benchmarks,
            results,
            execute,
        } => {
            let options = BenchOptions {
                benchmarks_dir: benchmarks,
                results_path: results,
                execute,
            };
            let (path, report) = harness.bench(&options).await?;
            println!(
                "{} results={}",
                harness.config().display_path(&path),
                report.results.len()
            );
            0
        }
        Command::Watch {
            run_id,
            interval_ms,
            errors,
            ticks,
            tui,
        } => {
            let options = WatchOptions {
                run_id,
                interval: Duration::from_millis(interval_ms),
                max_errors: errors,
                ticks: ticks.filter(|n| *n > 0),
            };
            harness
                .watch(&options, |frame| {
                    if tui {
                        print!("\x1b[2J\x1b[H{}", frame.render_panel());
                    } else {
                        println!("{}", frame.render_plain());
                    }
                    let _ = std::io::Write::flush(&mut std::io::stdout());
                })
                .await?;
            0
        }
    };

    drop(harness);
    if let Some(task) = echo_task {
        if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
            warn!("event echo did not drain");
        }
    }
    Ok(code)
}
