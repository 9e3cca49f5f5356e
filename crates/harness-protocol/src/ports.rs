//! Boundary ports between the control loop and the outside world.
//!
//! The harness does not perform edits itself and does not own version
//! control; both reach it through these traits. Traits use `async-trait`
//! for dyn-dispatch.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HarnessResult;

/// Result of one shell command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: f64,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stderr if present, else stdout; trimmed for display.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Run id exported to acceptance and scenario commands.
pub const RUN_ID_ENV: &str = "HARNESS_RUN_ID";
/// Work order id exported to acceptance commands.
pub const WORK_ORDER_ID_ENV: &str = "HARNESS_WORK_ORDER_ID";

/// Extra environment variables for one command, on top of the inherited ones.
pub type CommandEnv = [(String, String)];

/// Runs acceptance and verification commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` through the shell in the repository root. A non-zero
    /// exit is an `Ok` outcome; `Err` means the command could not be started.
    async fn run(&self, command: &str) -> HarnessResult<CommandOutcome> {
        self.run_with_env(command, &[]).await
    }

    /// [`run`](Self::run) with `env` added to the child's environment.
    async fn run_with_env(&self, command: &str, env: &CommandEnv)
    -> HarnessResult<CommandOutcome>;
}

/// The version-control operations the control loop depends on.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Initializes a repository if the root is not one yet.
    async fn ensure_repo(&self) -> HarnessResult<()>;

    /// Current commit id, or an empty string before the first commit.
    async fn head(&self) -> String;

    /// Files changed since the last commit: tracked diff against HEAD (when
    /// HEAD exists) plus untracked files that are not ignored. Sorted, unique.
    async fn changed_files(&self) -> HarnessResult<Vec<String>>;

    /// Stages everything and commits.
    async fn commit_all(&self, message: &str) -> HarnessResult<()>;

    /// Stages only `paths` and commits.
    async fn commit_paths(&self, paths: &[PathBuf], message: &str) -> HarnessResult<()>;

    /// Short status listing for diagnostics.
    async fn status_short(&self) -> HarnessResult<String>;
}
