//! Pure aggregation over event sequences.
//!
//! Lifecycle records roll up into per-work-order and per-run counters;
//! telemetry records roll up into counts, duration percentiles, and
//! token/cost budgets. Both functions are deterministic in their input
//! order and carry no other state.

use std::collections::BTreeMap;

use harness_protocol::{
    AggregatesMeta, Budgets, DurationStats, EventRecord, LifecycleAggregates, LifecycleEvent,
    LifecycleEventType, RunAggregates, RunId, RunRollup, TelemetryAggregates, TelemetryEvent,
    TokenBudget, TokenTotals, WorkOrderRollup, percentile,
};
use serde_json::Value;

/// Characters per token for the payload-size estimate.
const CHARS_PER_TOKEN: u64 = 4;

pub fn compute_lifecycle_aggregates(events: &[EventRecord]) -> LifecycleAggregates {
    let mut aggregates = LifecycleAggregates {
        meta: AggregatesMeta::default(),
        ..LifecycleAggregates::default()
    };

    for event in events.iter().filter_map(EventRecord::as_lifecycle) {
        *aggregates
            .event_counts
            .entry(event.event_type.as_str().to_owned())
            .or_default() += 1;

        let verify = verify_status(event);
        if let Some(work_order) = &event.work_order_id {
            let rollup = aggregates
                .by_work_order
                .entry(work_order.as_str().to_owned())
                .or_default();
            count_into_work_order(rollup, &event.event_type, verify);
            let index = event.cycle_id.as_ref().and_then(|c| c.index()).unwrap_or(0);
            rollup.max_cycle_id = rollup.max_cycle_id.max(index);
        }

        let run = aggregates
            .by_run
            .entry(event.run_id.as_str().to_owned())
            .or_default();
        count_into_run(run, &event.event_type, verify);
        if let Some(work_order) = &event.work_order_id {
            run.work_orders.insert(work_order.clone());
        }
    }

    aggregates
}

fn verify_status(event: &LifecycleEvent) -> Option<bool> {
    if event.event_type != LifecycleEventType::VerifyResult {
        return None;
    }
    match event.detail.get("status").and_then(Value::as_str) {
        Some("pass") => Some(true),
        Some("fail") => Some(false),
        _ => None,
    }
}

fn count_into_work_order(
    rollup: &mut WorkOrderRollup,
    event_type: &LifecycleEventType,
    verify: Option<bool>,
) {
    match event_type {
        LifecycleEventType::CycleStart => rollup.cycle_count += 1,
        LifecycleEventType::AttemptStart => rollup.attempt_count += 1,
        LifecycleEventType::StateTransition => rollup.state_transitions += 1,
        _ => {}
    }
    match verify {
        Some(true) => rollup.verify_pass += 1,
        Some(false) => rollup.verify_fail += 1,
        None => {}
    }
}

fn count_into_run(rollup: &mut RunRollup, event_type: &LifecycleEventType, verify: Option<bool>) {
    match event_type {
        LifecycleEventType::CycleStart => rollup.cycle_count += 1,
        LifecycleEventType::AttemptStart => rollup.attempt_count += 1,
        LifecycleEventType::StateTransition => rollup.state_transitions += 1,
        _ => {}
    }
    match verify {
        Some(true) => rollup.verify_pass += 1,
        Some(false) => rollup.verify_fail += 1,
        None => {}
    }
}

/// Lenient integer read of a meta value: numbers truncate, numeric strings
/// parse, anything else counts as zero.
fn meta_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

fn meta_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn error_class(event: &TelemetryEvent) -> String {
    match event.meta.get("error_class") {
        Some(Value::String(class)) if !class.is_empty() => class.clone(),
        _ => "unknown".to_owned(),
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

pub fn compute_telemetry_aggregates(events: &[EventRecord]) -> TelemetryAggregates {
    let mut aggregates = TelemetryAggregates::default();
    let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut payload_chars: u64 = 0;
    let mut cost_total = 0.0_f64;

    for event in events.iter().filter_map(EventRecord::as_telemetry) {
        *aggregates
            .counts_by_kind
            .entry(event.kind.clone())
            .or_default() += 1;
        *aggregates
            .counts_by_name
            .entry(event.name.clone())
            .or_default() += 1;
        *aggregates
            .counts_by_kind_name
            .entry(event.kind.clone())
            .or_default()
            .entry(event.name.clone())
            .or_default() += 1;

        if let Some(ms) = event.ms.filter(|ms| ms.is_finite()) {
            samples.entry(event.name.clone()).or_default().push(ms);
        }

        match event.kind.as_str() {
            "error" => *aggregates.errors_by_class.entry(error_class(event)).or_default() += 1,
            "retry" => *aggregates.retries_by_class.entry(error_class(event)).or_default() += 1,
            _ => {}
        }

        aggregates.tokens.tokens_in += meta_u64(event.meta.get("tokens_in"));
        aggregates.tokens.tokens_out += meta_u64(event.meta.get("tokens_out"));
        let chars = event
            .meta
            .get("payload_chars")
            .or_else(|| event.meta.get("text_bytes"));
        payload_chars += meta_u64(chars);
        cost_total += meta_f64(event.meta.get("cost_estimate_usd"));
    }

    let mut total_ms = 0.0;
    for (name, mut values) in samples {
        values.sort_by(f64::total_cmp);
        let total: f64 = values.iter().sum();
        total_ms += total;
        let stats = DurationStats {
            count: values.len() as u64,
            total_ms: total,
            max_ms: values.last().copied().unwrap_or(0.0),
            p50_ms: percentile(&values, 50.0),
            p90_ms: percentile(&values, 90.0),
            p95_ms: percentile(&values, 95.0),
            samples_ms: values,
        };
        aggregates.durations_by_name.insert(name, stats);
    }
    aggregates.total_ms = total_ms;

    let TokenTotals {
        tokens_in,
        tokens_out,
        ..
    } = aggregates.tokens;
    let tokens_total = tokens_in + tokens_out;
    aggregates.tokens.tokens_total = tokens_total;

    let tokens_est_total = payload_chars.div_ceil(CHARS_PER_TOKEN);
    let estimated = tokens_total == 0 && tokens_est_total > 0;
    aggregates.budgets = Budgets {
        tokens: TokenBudget {
            tokens_in_total: tokens_in,
            tokens_out_total: tokens_out,
            tokens_total: if estimated { tokens_est_total } else { tokens_total },
            tokens_est_total,
            estimated,
        },
        cost_total_usd: round6(cost_total),
    };

    aggregates
}

/// Telemetry aggregates stamped with the run id and record count, as
/// persisted in a run directory.
pub fn compute_run_aggregates(run_id: &RunId, events: &[EventRecord]) -> RunAggregates {
    RunAggregates {
        telemetry: compute_telemetry_aggregates(events),
        run_id: run_id.clone(),
        event_count: events.len() as u64,
    }
}
