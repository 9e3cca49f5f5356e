use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use harness_protocol::{CommandEnv, CommandOutcome, CommandRunner, HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument, warn};

/// Exit code reported for a command killed by its time limit.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandLimits {
    pub max_runtime_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for CommandLimits {
    fn default() -> Self {
        Self {
            max_runtime_secs: 600,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Runs commands through `sh -c` with the repository root as working
/// directory. The parent environment is inherited, plus the per-call `env`.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    root: PathBuf,
    limits: CommandLimits,
}

impl ShellCommandRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            limits: CommandLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: CommandLimits) -> Self {
        self.limits = limits;
        self
    }

    fn truncate(mut output: Vec<u8>, max_output_bytes: usize) -> String {
        if output.len() > max_output_bytes {
            output.truncate(max_output_bytes);
        }
        String::from_utf8_lossy(&output).into_owned()
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    #[instrument(skip(self, env), fields(cwd = %self.root.display()))]
    async fn run_with_env(
        &self,
        command: &str,
        env: &CommandEnv,
    ) -> HarnessResult<CommandOutcome> {
        let started = Instant::now();

        let mut child = Command::new("sh");
        child
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .envs(env.iter().map(|(key, value)| (key, value)))
            .kill_on_drop(true);

        let limit = Duration::from_secs(self.limits.max_runtime_secs.max(1));
        match timeout(limit, child.output()).await {
            Ok(output) => {
                let output = output
                    .map_err(|err| HarnessError::Io(format!("failed to start `{command}`: {err}")))?;
                let outcome = CommandOutcome {
                    command: command.to_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: Self::truncate(output.stdout, self.limits.max_output_bytes),
                    stderr: Self::truncate(output.stderr, self.limits.max_output_bytes),
                    duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                    timed_out: false,
                };
                debug!(
                    exit_code = outcome.exit_code,
                    duration_ms = outcome.duration_ms,
                    "command finished"
                );
                Ok(outcome)
            }
            Err(_) => {
                warn!(
                    max_runtime_secs = self.limits.max_runtime_secs,
                    "command timed out"
                );
                Ok(CommandOutcome {
                    command: command.to_owned(),
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!(
                        "command timeout after {} seconds",
                        self.limits.max_runtime_secs
                    ),
                    duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                    timed_out: true,
                })
            }
        }
    }
}
