//! Threshold and scenario contracts.
//!
//! Layers apply in order: the threshold file, `defaults.thresholds` of the
//! scenario contract, then `scenarios.{name}.thresholds`. A later layer
//! overrides per key. Step ceilings merge per step name in the same order.
//! Artifact lists replace wholesale per key (`required`, `forbidden`).

use std::collections::BTreeMap;

use harness_protocol::{HarnessError, HarnessResult};
use serde_json::{Map, Number, Value};
use tracing::warn;

/// A ceiling exactly as the document wrote it, so reasons print `5` for an
/// integer limit and `5.5` for a float one.
#[derive(Debug, Clone, PartialEq)]
pub struct Limit(Number);

impl Limit {
    pub fn as_f64(&self) -> f64 {
        self.0.as_f64().unwrap_or(f64::INFINITY)
    }

    pub fn as_u64(&self) -> u64 {
        self.0.as_u64().unwrap_or(u64::MAX)
    }
}

impl From<f64> for Limit {
    fn from(value: f64) -> Self {
        Self(Number::from_f64(value).unwrap_or_else(|| Number::from(0)))
    }
}

impl From<u64> for Limit {
    fn from(value: u64) -> Self {
        Self(Number::from(value))
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Thresholds {
    pub max_total_ms: Option<Limit>,
    pub max_errors: Option<Limit>,
    pub max_retries: Option<Limit>,
    pub max_tokens_total: Option<Limit>,
    pub max_cost_total_usd: Option<Limit>,
    pub max_p95_step_ms: BTreeMap<String, Limit>,
}

impl Thresholds {
    fn overlay(&mut self, layer: Thresholds) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if layer.$field.is_some() { self.$field = layer.$field; })*
            };
        }
        take!(max_total_ms, max_errors, max_retries, max_tokens_total, max_cost_total_usd);
        self.max_p95_step_ms.extend(layer.max_p95_step_ms);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactRules {
    pub required: Vec<String>,
    pub forbidden: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateConfig {
    pub thresholds: Thresholds,
    pub artifacts: ArtifactRules,
}

/// Collects field-level reasons while reading a JSON contract.
#[derive(Default)]
struct Reader {
    errors: Vec<String>,
}

impl Reader {
    fn object<'v>(&mut self, value: Option<&'v Value>, path: &str) -> Option<&'v Map<String, Value>> {
        match value {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                self.errors.push(format!("{path} must be an object"));
                None
            }
        }
    }

    fn number(&mut self, value: &Value, path: &str) -> Option<Limit> {
        match value {
            Value::Number(n) => Some(Limit(n.clone())),
            _ => {
                self.errors.push(format!("{path} must be a number"));
                None
            }
        }
    }

    fn count(&mut self, value: &Value, path: &str) -> Option<Limit> {
        match value {
            Value::Number(n) if n.is_u64() => Some(Limit(n.clone())),
            _ => {
                self.errors
                    .push(format!("{path} must be a non-negative integer"));
                None
            }
        }
    }

    fn strings(&mut self, value: &Value, path: &str) -> Option<Vec<String>> {
        let items = value.as_array().and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
        });
        if items.is_none() {
            self.errors.push(format!("{path} must be list of strings"));
        }
        items
    }

    fn steps(&mut self, map: Option<&Map<String, Value>>, path: &str) -> BTreeMap<String, Limit> {
        let mut steps = BTreeMap::new();
        for (name, value) in map.into_iter().flatten() {
            if let Some(limit) = self.number(value, &format!("{path}.{name}")) {
                steps.insert(name.clone(), limit);
            }
        }
        steps
    }

    fn thresholds(&mut self, map: Option<&Map<String, Value>>, path: &str) -> Thresholds {
        let mut out = Thresholds::default();
        let Some(map) = map else {
            return out;
        };
        for (key, value) in map {
            let field = format!("{path}.{key}");
            match key.as_str() {
                "max_total_ms" => out.max_total_ms = self.number(value, &field),
                "max_cost_total_usd" => out.max_cost_total_usd = self.number(value, &field),
                "max_errors" => out.max_errors = self.count(value, &field),
                "max_retries" => out.max_retries = self.count(value, &field),
                "max_tokens_total" => out.max_tokens_total = self.count(value, &field),
                "max_p95_step_ms" => {
                    let steps = self.object(Some(value), &field);
                    out.max_p95_step_ms = self.steps(steps, &field);
                }
                other => warn!(key = other, path, "ignoring unknown threshold key"),
            }
        }
        out
    }

    fn artifacts(&mut self, map: Option<&Map<String, Value>>, path: &str, base: &mut ArtifactRules) {
        let Some(map) = map else {
            return;
        };
        if let Some(value) = map.get("required") {
            if let Some(list) = self.strings(value, &format!("{path}.required")) {
                base.required = list;
            }
        }
        if let Some(value) = map.get("forbidden") {
            if let Some(list) = self.strings(value, &format!("{path}.forbidden")) {
                base.forbidden = list;
            }
        }
    }

    fn finish<T>(self, value: T) -> HarnessResult<T> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(HarnessError::Schema(self.errors))
        }
    }
}

impl GateConfig {
    /// Resolves the effective gate configuration for `scenario` (or the
    /// defaults alone when `None`). An unknown scenario name gets the
    /// defaults alone.
    pub fn resolve(
        thresholds_doc: &Value,
        scenarios_doc: Option<&Value>,
        scenario: Option<&str>,
    ) -> HarnessResult<Self> {
        let mut reader = Reader::default();
        let mut config = GateConfig::default();

        let Value::Object(base) = thresholds_doc else {
            return Err(HarnessError::schema("thresholds must be an object"));
        };
        config.thresholds = reader.thresholds(Some(base), "thresholds");

        let scenarios_doc = scenarios_doc.filter(|doc| !doc.is_null());
        let contract = match scenarios_doc {
            Some(Value::Object(map)) => Some(map),
            Some(_) => return Err(HarnessError::schema("scenarios contract must be an object")),
            None => None,
        };

        if let Some(contract) = contract {
            let defaults = reader.object(contract.get("defaults"), "defaults");
            if let Some(defaults) = defaults {
                let layer = reader.object(defaults.get("thresholds"), "defaults.thresholds");
                let layer = reader.thresholds(layer, "defaults.thresholds");
                config.thresholds.overlay(layer);

                let steps = reader.object(defaults.get("steps"), "defaults.steps");
                let step_map = steps.and_then(|s| {
                    reader.object(s.get("max_p95_step_ms"), "defaults.steps.max_p95_step_ms")
                });
                let step_limits = reader.steps(step_map, "defaults.steps.max_p95_step_ms");
                config.thresholds.max_p95_step_ms.extend(step_limits);

                let artifacts = reader.object(defaults.get("artifacts"), "defaults.artifacts");
                reader.artifacts(artifacts, "defaults.artifacts", &mut config.artifacts);
            }
        }

        if let Some(name) = scenario.filter(|name| !name.is_empty()) {
            let scenarios = contract
                .and_then(|c| reader.object(c.get("scenarios"), "scenarios"));
            let entry = scenarios.and_then(|s| s.get(name));
            if entry.is_none() {
                warn!(scenario = %name, "unknown scenario, using defaults");
            }
            let prefix = format!("scenarios.{name}");
            if let Some(entry) = reader.object(entry, &prefix) {
                let path = format!("{prefix}.thresholds");
                let layer = reader.object(entry.get("thresholds"), &path);
                let layer = reader.thresholds(layer, &path);
                config.thresholds.overlay(layer);

                let path = format!("{prefix}.steps");
                let steps = reader.object(entry.get("steps"), &path);
                let path = format!("{path}.max_p95_step_ms");
                let step_map = steps.and_then(|s| reader.object(s.get("max_p95_step_ms"), &path));
                let step_limits = reader.steps(step_map, &path);
                config.thresholds.max_p95_step_ms.extend(step_limits);

                let path = format!("{prefix}.artifacts");
                let artifacts = reader.object(entry.get("artifacts"), &path);
                reader.artifacts(artifacts, &path, &mut config.artifacts);
            }
        }

        reader.finish(config)
    }
}

/// Suite-level ceilings from the scenario contract's `suite` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuiteRules {
    pub min_pass_rate: Option<Limit>,
    pub max_p95_total_ms: Option<Limit>,
    pub max_mean_cost_total_usd: Option<Limit>,
}

impl SuiteRules {
    pub fn from_contract(scenarios_doc: &Value) -> HarnessResult<Self> {
        let mut reader = Reader::default();
        let mut rules = SuiteRules::default();
        if let Some(suite) = reader.object(scenarios_doc.get("suite"), "suite") {
            for (key, value) in suite {
                let path = format!("suite.{key}");
                match key.as_str() {
                    "min_pass_rate" => rules.min_pass_rate = reader.number(value, &path),
                    "max_p95_total_ms" => rules.max_p95_total_ms = reader.number(value, &path),
                    "max_mean_cost_total_usd" => {
                        rules.max_mean_cost_total_usd = reader.number(value, &path)
                    }
                    other => warn!(key = other, "ignoring unknown suite key"),
                }
            }
        }
        reader.finish(rules)
    }
}
