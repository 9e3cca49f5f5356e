//! Document-level type checks for dispatch files.
//!
//! These run on the raw JSON before typed deserialization so that a
//! malformed document yields one reason per offending field rather than the
//! first serde error.

use serde_json::{Map, Value};

use crate::dispatch::DISPATCH_VERSION;

const REQUIRED_WORK_ORDER_KEYS: [&str; 10] = [
    "id",
    "title",
    "ready",
    "done",
    "role",
    "priority",
    "scope",
    "steps",
    "acceptance",
    "artifacts",
];

/// Field-level type reasons for a dispatch document; empty when well-typed.
pub fn check_dispatch_document(value: &Value) -> Vec<String> {
    let Some(root) = value.as_object() else {
        return vec!["dispatch must be an object".to_owned()];
    };
    let Some(meta) = root.get("meta").and_then(Value::as_object) else {
        return vec!["meta must be an object".to_owned()];
    };
    if meta.get("version").and_then(Value::as_str) != Some(DISPATCH_VERSION) {
        return vec![format!("meta.version must be {DISPATCH_VERSION}")];
    }
    let Some(work_orders) = root.get("work_orders").and_then(Value::as_array) else {
        return vec!["work_orders must be a list".to_owned()];
    };

    let mut errors = Vec::new();
    for (idx, wo) in work_orders.iter().enumerate() {
        let prefix = format!("work_orders[{idx}]");
        match wo.as_object() {
            Some(wo) => check_work_order(&prefix, wo, &mut errors),
            None => errors.push(format!("{prefix} must be an object")),
        }
    }
    errors
}

fn check_work_order(prefix: &str, wo: &Map<String, Value>, errors: &mut Vec<String>) {
    for key in REQUIRED_WORK_ORDER_KEYS {
        if !wo.contains_key(key) {
            errors.push(format!("{prefix} missing {key}"));
        }
    }

    for key in ["id", "title", "role"] {
        expect(wo, key, Value::is_string, "string", prefix, errors);
    }
    for key in ["ready", "done"] {
        expect(wo, key, Value::is_boolean, "bool", prefix, errors);
    }
    expect(wo, "priority", Value::is_i64, "int", prefix, errors);
    expect(wo, "steps", is_string_list, "list of strings", prefix, errors);

    if let Some(depends_on) = wo.get("depends_on")
        && !depends_on.is_null()
        && !is_string_list(depends_on)
    {
        errors.push(format!("{prefix} depends_on must be list of strings"));
    }

    if let Some(scope) = wo.get("scope") {
        match scope.as_object() {
            Some(scope) => {
                for key in ["allow_globs", "deny_globs"] {
                    if !scope.get(key).is_some_and(is_string_list) {
                        errors.push(format!("{prefix} scope.{key} must be list of strings"));
                    }
                }
            }
            None => errors.push(format!("{prefix} scope must be object")),
        }
    }

    if let Some(acceptance) = wo.get("acceptance") {
        match acceptance.as_array() {
            Some(items) => {
                for (a_idx, item) in items.iter().enumerate() {
                    let a_prefix = format!("{prefix}.acceptance[{a_idx}]");
                    let Some(item) = item.as_object() else {
                        errors.push(format!("{a_prefix} must be object"));
                        continue;
                    };
                    for key in ["name", "cmd"] {
                        if !item.get(key).is_some_and(Value::is_string) {
                            errors.push(format!("{a_prefix} {key} must be string"));
                        }
                    }
                }
            }
            None => errors.push(format!("{prefix} acceptance must be list")),
        }
    }

    if let Some(artifacts) = wo.get("artifacts") {
        match artifacts.as_object() {
            Some(artifacts) => {
                if !artifacts.get("receipt_required").is_some_and(Value::is_boolean) {
                    errors.push(format!("{prefix} artifacts.receipt_required must be bool"));
                }
            }
            None => errors.push(format!("{prefix} artifacts must be object")),
        }
    }
}

fn expect(
    wo: &Map<String, Value>,
    key: &str,
    check: fn(&Value) -> bool,
    expected: &str,
    prefix: &str,
    errors: &mut Vec<String>,
) {
    if let Some(value) = wo.get(key)
        && !check(value)
    {
        errors.push(format!("{prefix} {key} must be {expected}"));
    }
}

fn is_string_list(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|items| items.iter().all(Value::is_string))
}
