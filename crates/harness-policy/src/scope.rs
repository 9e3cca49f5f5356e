//! File-scope enforcement for the active work order.
//!
//! Every changed path must match at least one allow glob and no deny glob.
//! A denied path is reported once as denied; "not allowed" is only reported
//! for paths that were not already denied.

use globset::{Glob, GlobSet, GlobSetBuilder};
use harness_protocol::{HarnessError, HarnessResult, Scope};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeReport {
    pub denied: Vec<String>,
    pub not_allowed: Vec<String>,
}

impl ScopeReport {
    pub fn is_clean(&self) -> bool {
        self.denied.is_empty() && self.not_allowed.is_empty()
    }

    /// `scope denied: {path}` lines followed by `scope not allowed: {path}`.
    pub fn reasons(&self) -> Vec<String> {
        self.denied
            .iter()
            .map(|path| format!("scope denied: {path}"))
            .chain(
                self.not_allowed
                    .iter()
                    .map(|path| format!("scope not allowed: {path}")),
            )
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScopeEnforcer {
    allow: GlobSet,
    deny: GlobSet,
}

fn build_set(field: &str, patterns: &[String]) -> HarnessResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut errors = Vec::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => errors.push(format!("invalid {field} pattern '{pattern}': {err}")),
        }
    }
    if !errors.is_empty() {
        return Err(HarnessError::Schema(errors));
    }
    builder
        .build()
        .map_err(|err| HarnessError::schema(format!("{field} globset build failed: {err}")))
}

impl ScopeEnforcer {
    pub fn compile(scope: &Scope) -> HarnessResult<Self> {
        Ok(Self {
            allow: build_set("allow_globs", &scope.allow_globs)?,
            deny: build_set("deny_globs", &scope.deny_globs)?,
        })
    }

    pub fn is_denied(&self, path: &str) -> bool {
        self.deny.is_match(path)
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        !self.is_denied(path) && self.allow.is_match(path)
    }

    /// Checks `changed` paths in sorted, de-duplicated order. No changes is
    /// a clean report.
    pub fn check<I, S>(&self, changed: I) -> ScopeReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut paths: Vec<String> = changed
            .into_iter()
            .map(|p| p.as_ref().trim().to_owned())
            .filter(|p| !p.is_empty())
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        paths.sort();

        let mut report = ScopeReport::default();
        for path in paths {
            if self.deny.is_match(&path) {
                warn!(path = %path, "changed path denied by scope");
                report.denied.push(path);
            } else if !self.allow.is_match(&path) {
                warn!(path = %path, "changed path outside allowed scope");
                report.not_allowed.push(path);
            }
        }
        report
    }
}
