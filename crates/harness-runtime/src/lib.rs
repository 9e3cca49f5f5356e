//! The harness control loop and the checks it verifies work against.
//!
//! [`ControlLoop`] drives one cycle at a time: select the active work order,
//! run its acceptance commands, verify, then complete and promote or write
//! the run's terminal receipt. [`Verifier`] runs the named checks on their
//! own for `verify --check`.

pub mod config;
pub mod control;
pub mod status;
pub mod verify;

pub use config::{HooksConfig, ProjectHooks, RuntimeConfig};
pub use control::{ControlLoop, CycleOutcome};
pub use status::StatusJournal;
pub use verify::{CheckName, CheckReport, Verifier, VerifyMode, VerifyReport};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;
    use harness_protocol::{
        BASELINE_DENY_GLOBS, CommandEnv, CommandOutcome, CommandRunner, HarnessError,
        HarnessResult, VersionControl,
    };
    use serde_json::{Value, json};
    use tokio::fs;

    use crate::config::RuntimeConfig;

    pub fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    /// Schema-valid dispatch with `(id, ready, done)` orders. Each order's
    /// single acceptance command is `check {id}`.
    pub fn dispatch_value(orders: &[(&str, bool, bool)]) -> Value {
        let work_orders: Vec<Value> = orders
            .iter()
            .enumerate()
            .map(|(idx, (id, ready, done))| {
                json!({
                    "id": id,
                    "title": format!("order {id}"),
                    "role": "builder",
                    "priority": idx,
                    "ready": ready,
                    "done": done,
                    "scope": {"allow_globs": ["src/**"], "deny_globs": BASELINE_DENY_GLOBS},
                    "steps": ["do it"],
                    "acceptance": [{"name": "check", "cmd": format!("check {id}")}],
                    "artifacts": {"receipt_required": true},
                })
            })
            .collect();
        json!({"meta": {"version": "harness.v1"}, "work_orders": work_orders})
    }

    #[derive(Default)]
    pub struct FakeVcs {
        changed: Mutex<Vec<String>>,
        commits: Mutex<Vec<String>>,
        commits_fail: Mutex<bool>,
    }

    impl FakeVcs {
        /// Every later commit returns an I/O error.
        pub fn fail_commits(&self) {
            if let Ok(mut fail) = self.commits_fail.lock() {
                *fail = true;
            }
        }

        fn check_commit(&self) -> HarnessResult<()> {
            if self.commits_fail.lock().map(|f| *f).unwrap_or(false) {
                return Err(HarnessError::Io("git commit failed".to_owned()));
            }
            Ok(())
        }

        pub fn set_changed(&self, paths: &[&str]) {
            if let Ok(mut changed) = self.changed.lock() {
                *changed = paths.iter().map(|p| (*p).to_owned()).collect();
            }
        }

        pub fn commits(&self) -> Vec<String> {
            self.commits.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, message: &str) {
            if let Ok(mut commits) = self.commits.lock() {
                commits.push(message.to_owned());
            }
        }
    }

    #[async_trait]
    impl VersionControl for FakeVcs {
        async fn ensure_repo(&self) -> HarnessResult<()> {
            Ok(())
        }

        async fn head(&self) -> String {
            let count = self.commits.lock().map(|c| c.len()).unwrap_or(0);
            if count == 0 {
                String::new()
            } else {
                format!("commit-{count}")
            }
        }

        async fn changed_files(&self) -> HarnessResult<Vec<String>> {
            Ok(self.changed.lock().map(|c| c.clone()).unwrap_or_default())
        }

        async fn commit_all(&self, message: &str) -> HarnessResult<()> {
            self.check_commit()?;
            self.set_changed(&[]);
            self.record(message);
            Ok(())
        }

        async fn commit_paths(&self, _paths: &[PathBuf], message: &str) -> HarnessResult<()> {
            self.check_commit()?;
            self.record(message);
            Ok(())
        }

        async fn status_short(&self) -> HarnessResult<String> {
            Ok(String::new())
        }
    }

    /// Succeeds for every command except those marked with [`Self::fail`].
    #[derive(Default)]
    pub struct FakeRunner {
        failing: Mutex<BTreeSet<String>>,
        calls: Mutex<Vec<String>>,
        envs: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl FakeRunner {
        pub fn fail(&self, command: &str) {
            if let Ok(mut failing) = self.failing.lock() {
                failing.insert(command.to_owned());
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        /// Extra environment of each call, in call order.
        pub fn envs(&self) -> Vec<Vec<(String, String)>> {
            self.envs.lock().map(|e| e.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run_with_env(
            &self,
            command: &str,
            env: &CommandEnv,
        ) -> HarnessResult<CommandOutcome> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(command.to_owned());
            }
            if let Ok(mut envs) = self.envs.lock() {
                envs.push(env.to_vec());
            }
            let fails = self
                .failing
                .lock()
                .map(|f| f.contains(command))
                .unwrap_or(false);
            Ok(CommandOutcome {
                command: command.to_owned(),
                exit_code: i32::from(fails),
                stdout: String::new(),
                stderr: if fails {
                    format!("{command} failed")
                } else {
                    String::new()
                },
                duration_ms: 5.0,
                timed_out: false,
            })
        }
    }

    pub struct Fixture {
        pub config: RuntimeConfig,
        pub vcs: Arc<FakeVcs>,
        pub runner: Arc<FakeRunner>,
    }

    impl Fixture {
        /// No dispatch file written.
        pub fn bare(root: &Path) -> Self {
            Self {
                config: RuntimeConfig::new(root),
                vcs: Arc::new(FakeVcs::default()),
                runner: Arc::new(FakeRunner::default()),
            }
        }

        pub async fn new(root: &Path, orders: &[(&str, bool, bool)]) -> anyhow::Result<Self> {
            Self::from_value(root, dispatch_value(orders)).await
        }

        pub async fn from_value(root: &Path, dispatch: Value) -> anyhow::Result<Self> {
            let fixture = Self::bare(root);
            let path = &fixture.config.dispatch_path;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(path, serde_json::to_string_pretty(&dispatch)?).await?;
            Ok(fixture)
        }
    }
}
