//! Replay determinism: a persisted aggregates file must canonically equal
//! a fresh recomputation from its log. Mismatches are reported, never
//! repaired.

use std::path::Path;

use anyhow::{Context, Result};
use harness_protocol::canonical;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// No aggregates file has been persisted yet.
    Missing,
    Match,
    Mismatch,
}

impl ReplayOutcome {
    pub fn is_ok(self) -> bool {
        !matches!(self, Self::Mismatch)
    }
}

pub async fn check_replay<T: Serialize>(persisted: &Path, recomputed: &T) -> Result<ReplayOutcome> {
    if !fs::try_exists(persisted).await.unwrap_or(false) {
        return Ok(ReplayOutcome::Missing);
    }
    let raw = fs::read_to_string(persisted)
        .await
        .with_context(|| format!("failed reading aggregates {persisted:?}"))?;
    // An unparseable file cannot match any recomputation.
    let Ok(stored) = serde_json::from_str::<Value>(&raw) else {
        warn!(path = ?persisted, "persisted aggregates are not valid JSON");
        return Ok(ReplayOutcome::Mismatch);
    };
    let fresh = serde_json::to_value(recomputed).context("failed serializing aggregates")?;

    if canonical::canonical_eq(&stored, &fresh) {
        Ok(ReplayOutcome::Match)
    } else {
        warn!(path = ?persisted, "aggregates replay mismatch");
        Ok(ReplayOutcome::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_test_root;
    use serde_json::json;

    #[tokio::test]
    async fn missing_match_and_mismatch() -> Result<()> {
        let root = unique_test_root("harness-events-replay");
        fs::create_dir_all(&root).await?;
        let path = root.join("aggregates.json");
        let value = json!({"b": [1, 2], "a": {"y": 1.5, "x": 0}});

        assert_eq!(check_replay(&path, &value).await?, ReplayOutcome::Missing);

        fs::write(&path, "{\n  \"a\": {\"x\": 0, \"y\": 1.5},\n  \"b\": [1, 2]\n}\n").await?;
        assert_eq!(check_replay(&path, &value).await?, ReplayOutcome::Match);

        let drifted = json!({"b": [1, 2], "a": {"y": 1.5, "x": 1}});
        let outcome = check_replay(&path, &drifted).await?;
        assert_eq!(outcome, ReplayOutcome::Mismatch);
        assert!(!outcome.is_ok());

        fs::write(&path, "{not json").await?;
        assert_eq!(check_replay(&path, &value).await?, ReplayOutcome::Mismatch);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
