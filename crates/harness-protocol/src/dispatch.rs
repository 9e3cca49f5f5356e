//! Work orders, the dispatch document, and the dispatch state machine.
//!
//! Per-order states are `pending` (¬ready ∧ ¬done) → `ready` (ready ∧ ¬done)
//! → `done`. At most one order may be `ready` at a time (WIP=1); every
//! transition here preserves that, and [`Dispatch::validate`] reports
//! documents that violate it instead of repairing them.

use std::collections::BTreeSet;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};
use crate::event::Payload;
use crate::ids::WorkOrderId;
use crate::schema;

/// Version tag every dispatch document must carry in `meta.version`.
pub const DISPATCH_VERSION: &str = "harness.v1";

/// Deny patterns that every work order's scope must include.
pub const BASELINE_DENY_GLOBS: [&str; 5] = [
    "**/.env",
    "**/*.pem",
    "**/*token*",
    "**/package-lock.json",
    "**/yarn.lock",
];

/// Reason reported when WIP=1 is violated.
pub const MULTIPLE_READY_REASON: &str = "multiple ready work orders";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub allow_globs: Vec<String>,
    pub deny_globs: Vec<String>,
}

impl Scope {
    /// Allow-list plus the mandatory baseline deny list.
    pub fn with_baseline(allow_globs: Vec<String>) -> Self {
        Self {
            allow_globs,
            deny_globs: BASELINE_DENY_GLOBS.iter().map(|g| (*g).to_owned()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCheck {
    pub name: String,
    #[serde(rename = "cmd")]
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRequirements {
    pub receipt_required: bool,
    #[serde(flatten)]
    pub extra: Payload,
}

impl Default for ArtifactRequirements {
    fn default() -> Self {
        Self {
            receipt_required: true,
            extra: Payload::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOrderState {
    Pending,
    Ready,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: WorkOrderId,
    pub title: String,
    pub role: String,
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<IndexSet<WorkOrderId>>,
    pub ready: bool,
    pub done: bool,
    pub scope: Scope,
    pub steps: Vec<String>,
    pub acceptance: Vec<AcceptanceCheck>,
    pub artifacts: ArtifactRequirements,
    /// Fields this crate does not interpret; kept so rewrites stay lossless.
    #[serde(flatten)]
    pub extra: Payload,
}

impl WorkOrder {
    pub fn state(&self) -> WorkOrderState {
        match (self.ready, self.done) {
            (_, true) => WorkOrderState::Done,
            (true, false) => WorkOrderState::Ready,
            (false, false) => WorkOrderState::Pending,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ready && !self.done
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &WorkOrderId> {
        self.depends_on.iter().flatten()
    }

    fn sort_key(&self) -> (i64, &str) {
        (self.priority, self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMeta {
    pub version: String,
    #[serde(flatten)]
    pub extra: Payload,
}

impl Default for DispatchMeta {
    fn default() -> Self {
        Self {
            version: DISPATCH_VERSION.to_owned(),
            extra: Payload::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub meta: DispatchMeta,
    pub work_orders: Vec<WorkOrder>,
    #[serde(flatten)]
    pub extra: Payload,
}

impl Dispatch {
    pub fn new(work_orders: Vec<WorkOrder>) -> Self {
        Self {
            meta: DispatchMeta::default(),
            work_orders,
            extra: Payload::new(),
        }
    }

    /// Parse a dispatch document, failing with field-level reasons when it
    /// is not shaped like one. Semantic rules are left to [`Self::validate`].
    pub fn from_value(value: Value) -> HarnessResult<Self> {
        let reasons = schema::check_dispatch_document(&value);
        if !reasons.is_empty() {
            return Err(HarnessError::Schema(reasons));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn get(&self, id: &WorkOrderId) -> Option<&WorkOrder> {
        self.work_orders.iter().find(|wo| wo.id == *id)
    }

    /// Ids of ready ∧ ¬done orders, sorted by (priority, id).
    pub fn ready_ids(&self) -> Vec<WorkOrderId> {
        let mut ready: Vec<&WorkOrder> = self.work_orders.iter().filter(|wo| wo.is_active()).collect();
        ready.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        ready.into_iter().map(|wo| wo.id.clone()).collect()
    }

    /// The single ready ∧ ¬done order, if any. More than one is an error.
    pub fn active_work_order(&self) -> HarnessResult<Option<&WorkOrder>> {
        let ready = self.ready_ids();
        if ready.len() > 1 {
            return Err(HarnessError::Invariant(format!(
                "{MULTIPLE_READY_REASON} (wip=1): {}",
                join_ids(&ready)
            )));
        }
        Ok(ready.first().and_then(|id| self.get(id)))
    }

    pub fn done_ids(&self) -> BTreeSet<&WorkOrderId> {
        self.work_orders
            .iter()
            .filter(|wo| wo.done)
            .map(|wo| &wo.id)
            .collect()
    }

    /// Clears `ready` on every other undone order, then readies `id`.
    /// Returns whether the document changed.
    pub fn mark_ready(&mut self, id: &WorkOrderId) -> HarnessResult<bool> {
        let target = self
            .get(id)
            .ok_or_else(|| HarnessError::NotFound(format!("unknown work order: {id}")))?;
        if target.done {
            return Err(HarnessError::Invariant(format!(
                "work order already done: {id}"
            )));
        }

        let mut changed = false;
        for wo in &mut self.work_orders {
            if wo.done {
                continue;
            }
            let ready = wo.id == *id;
            if wo.ready != ready {
                wo.ready = ready;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Sets done=true, ready=false. Callers invoke this only after the
    /// order passed verification.
    pub fn mark_done(&mut self, id: &WorkOrderId) -> HarnessResult<()> {
        let wo = self
            .work_orders
            .iter_mut()
            .find(|wo| wo.id == *id)
            .ok_or_else(|| HarnessError::NotFound(format!("unknown work order: {id}")))?;
        wo.done = true;
        wo.ready = false;
        Ok(())
    }

    /// Lowest (priority, id) among undone orders whose dependencies are all done.
    pub fn select_next_eligible(&self) -> Option<&WorkOrder> {
        let done = self.done_ids();
        self.work_orders
            .iter()
            .filter(|wo| !wo.done)
            .filter(|wo| wo.dependencies().all(|dep| done.contains(dep)))
            .min_by(|a, b| a.sort_key().cmp(&b.sort_key()))
    }

    /// Readies the next eligible order. No-op when nothing is eligible.
    pub fn promote_next(&mut self) -> HarnessResult<Option<WorkOrderId>> {
        let Some(next) = self.select_next_eligible().map(|wo| wo.id.clone()) else {
            return Ok(None);
        };
        self.mark_ready(&next)?;
        Ok(Some(next))
    }

    /// Semantic rules over a well-typed document: uniqueness, the WIP and
    /// done ⇒ ¬ready invariants, dependency references, non-empty fields,
    /// the baseline deny list, and the receipt requirement.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut ids = BTreeSet::new();

        for (idx, wo) in self.work_orders.iter().enumerate() {
            let prefix = format!("work_orders[{idx}]");
            if wo.id.as_str().is_empty() {
                errors.push(format!("{prefix} id must be non-empty string"));
            } else if !ids.insert(wo.id.as_str()) {
                errors.push(format!("duplicate id {}", wo.id));
            }
            if wo.title.is_empty() {
                errors.push(format!("{prefix} title must be non-empty string"));
            }
            if wo.role.is_empty() {
                errors.push(format!("{prefix} role must be non-empty string"));
            }
            if wo.done && wo.ready {
                errors.push(format!("{prefix} done implies ready=false"));
            }
            if wo.scope.allow_globs.is_empty() {
                errors.push(format!("{prefix} scope.allow_globs must be non-empty list"));
            }
            if wo.scope.deny_globs.is_empty() {
                errors.push(format!("{prefix} scope.deny_globs must be non-empty list"));
            }
            for required in BASELINE_DENY_GLOBS {
                if !wo.scope.deny_globs.iter().any(|g| g == required) {
                    errors.push(format!("{prefix} scope.deny_globs missing {required}"));
                }
            }
            if wo.steps.is_empty() || wo.steps.iter().any(String::is_empty) {
                errors.push(format!("{prefix} steps must be non-empty list of strings"));
            }
            if wo.acceptance.is_empty() {
                errors.push(format!("{prefix} acceptance must be non-empty list"));
            }
            for (a_idx, check) in wo.acceptance.iter().enumerate() {
                if check.name.is_empty() {
                    errors.push(format!(
                        "{prefix}.acceptance[{a_idx}] name must be non-empty string"
                    ));
                }
                if check.command.is_empty() {
                    errors.push(format!(
                        "{prefix}.acceptance[{a_idx}] cmd must be non-empty string"
                    ));
                }
            }
            if !wo.artifacts.receipt_required {
                errors.push(format!("{prefix} artifacts.receipt_required must be true"));
            }
        }

        if self.ready_ids().len() > 1 {
            errors.push(MULTIPLE_READY_REASON.to_owned());
        }

        for (idx, wo) in self.work_orders.iter().enumerate() {
            for dep in wo.dependencies() {
                if !ids.contains(dep.as_str()) {
                    errors.push(format!("work_orders[{idx}] depends_on missing id {dep}"));
                }
            }
        }

        errors
    }
}

pub(crate) fn join_ids(ids: &[WorkOrderId]) -> String {
    ids.iter()
        .map(WorkOrderId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
