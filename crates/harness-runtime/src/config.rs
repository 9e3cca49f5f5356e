use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use harness_sandbox::CommandLimits;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Repository-relative layout of everything the harness reads and writes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub root: PathBuf,
    pub dispatch_path: PathBuf,
    pub hooks_path: PathBuf,
    pub receipts_dir: PathBuf,
    pub lifecycle_log: PathBuf,
    pub lifecycle_aggregates: PathBuf,
    pub runs_dir: PathBuf,
    pub status_path: PathBuf,
    pub agent_id: String,
    pub limits: CommandLimits,
}

impl RuntimeConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            dispatch_path: root.join(".harness/contracts/dispatch.json"),
            hooks_path: root.join(".harness/contracts/hooks.json"),
            receipts_dir: root.join("receipts"),
            lifecycle_log: root.join("artifacts/abm/events.jsonl"),
            lifecycle_aggregates: root.join("artifacts/abm/aggregates.json"),
            runs_dir: root.join("artifacts/abm_runs"),
            status_path: root.join("docs/STATUS.md"),
            agent_id: "harness".to_owned(),
            limits: CommandLimits::default(),
            root,
        }
    }

    pub fn with_dispatch_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dispatch_path = path.into();
        self
    }

    pub fn with_receipts_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.receipts_dir = path.into();
        self
    }

    pub fn with_runs_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.runs_dir = path.into();
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_limits(mut self, limits: CommandLimits) -> Self {
        self.limits = limits;
        self
    }

    /// `path` relative to the root, with `/` separators, for display and
    /// for matching against version-control paths.
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Files and directories the harness writes during a cycle and has not
    /// committed when the scope check runs. Scope checks skip them. The
    /// dispatch is absent: every harness dispatch change is committed first.
    pub fn bookkeeping_paths(&self) -> Vec<String> {
        [
            &self.receipts_dir,
            &self.lifecycle_log,
            &self.lifecycle_aggregates,
            &self.runs_dir,
            &self.status_path,
        ]
        .into_iter()
        .map(|path| self.display_path(path))
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectHooks {
    pub verify_cmd: String,
    pub proof_cmd: String,
}

/// `hooks.json`: project-level commands run by the `project` check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub project: ProjectHooks,
}

impl HooksConfig {
    /// An absent file yields empty hooks.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading hooks {path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid hooks {path:?}"))
    }

    /// `(name, command)` pairs in execution order, skipping empty commands.
    pub fn project_commands(&self) -> Vec<(&'static str, &str)> {
        [
            ("proof_cmd", self.project.proof_cmd.as_str()),
            ("verify_cmd", self.project.verify_cmd.as_str()),
        ]
        .into_iter()
        .filter(|(_, cmd)| !cmd.trim().is_empty())
        .collect()
    }
}
