use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use harness_protocol::{HarnessError, HarnessResult, VersionControl};
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// [`VersionControl`] over the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    identity: Option<(String, String)>,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            identity: None,
        }
    }

    /// Commits as `name <email>` regardless of the user's git config.
    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.identity = Some((name.into(), email.into()));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn output(&self, args: &[&str]) -> HarnessResult<Output> {
        let mut command = Command::new("git");
        command.arg("-C").arg(&self.root);
        if let Some((name, email)) = &self.identity {
            command
                .arg("-c")
                .arg(format!("user.name={name}"))
                .arg("-c")
                .arg(format!("user.email={email}"));
        }
        command
            .args(args)
            .output()
            .await
            .map_err(|err| HarnessError::Io(format!("failed to run git: {err}")))
    }

    async fn git(&self, args: &[&str]) -> HarnessResult<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(HarnessError::Io(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn lines(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
}

#[async_trait]
impl VersionControl for GitCli {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn ensure_repo(&self) -> HarnessResult<()> {
        let inside = self.output(&["rev-parse", "--is-inside-work-tree"]).await?;
        if inside.status.success() {
            return Ok(());
        }
        self.git(&["init"]).await?;
        info!("initialized git repository");
        Ok(())
    }

    async fn head(&self) -> String {
        match self.git(&["rev-parse", "HEAD"]).await {
            Ok(head) => head.trim().to_owned(),
            Err(_) => String::new(),
        }
    }

    async fn changed_files(&self) -> HarnessResult<Vec<String>> {
        let mut changed = BTreeSet::new();
        if !self.head().await.is_empty() {
            changed.extend(lines(&self.git(&["diff", "--name-only", "HEAD"]).await?));
        }
        changed.extend(lines(
            &self
                .git(&["ls-files", "--others", "--exclude-standard"])
                .await?,
        ));
        Ok(changed.into_iter().collect())
    }

    #[instrument(skip(self))]
    async fn commit_all(&self, message: &str) -> HarnessResult<()> {
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "--allow-empty", "-q", "-m", message])
            .await?;
        debug!("committed all changes");
        Ok(())
    }

    #[instrument(skip(self, paths), fields(paths = paths.len()))]
    async fn commit_paths(&self, paths: &[PathBuf], message: &str) -> HarnessResult<()> {
        let rendered: Vec<String> = paths
            .iter()
            .map(|path| path.strip_prefix(&self.root).unwrap_or(path).display().to_string())
            .collect();
        let mut add = vec!["add", "--"];
        add.extend(rendered.iter().map(String::as_str));
        self.git(&add).await?;

        let mut commit = vec!["commit", "--allow-empty", "-q", "-m", message, "--"];
        commit.extend(rendered.iter().map(String::as_str));
        self.git(&commit).await?;
        debug!("committed paths");
        Ok(())
    }

    async fn status_short(&self) -> HarnessResult<String> {
        self.git(&["status", "--short"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::fs;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn tracks_changes_across_commits() -> anyhow::Result<()> {
        if !git_available().await {
            return Ok(());
        }
        let root = unique_test_root("harness-git-cli");
        fs::create_dir_all(&root).await?;
        let git = GitCli::new(&root).with_identity("harness", "harness@localhost");

        git.ensure_repo().await?;
        assert_eq!(git.head().await, "");

        fs::write(root.join("a.txt"), "one").await?;
        assert_eq!(git.changed_files().await?, vec!["a.txt".to_owned()]);

        git.commit_all("initial").await?;
        let first = git.head().await;
        assert!(!first.is_empty());
        assert!(git.changed_files().await?.is_empty());

        fs::write(root.join("a.txt"), "two").await?;
        fs::write(root.join("b.txt"), "new").await?;
        assert_eq!(
            git.changed_files().await?,
            vec!["a.txt".to_owned(), "b.txt".to_owned()]
        );

        git.commit_paths(&[root.join("b.txt")], "only b").await?;
        assert_ne!(git.head().await, first);
        assert_eq!(git.changed_files().await?, vec!["a.txt".to_owned()]);
        assert!(git.status_short().await?.contains("a.txt"));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn empty_commit_is_allowed() -> anyhow::Result<()> {
        if !git_available().await {
            return Ok(());
        }
        let root = unique_test_root("harness-git-empty");
        fs::create_dir_all(&root).await?;
        let git = GitCli::new(&root).with_identity("harness", "harness@localhost");
        git.ensure_repo().await?;

        git.commit_all("nothing yet").await?;
        assert!(!git.head().await.is_empty());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
