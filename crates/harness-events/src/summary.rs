use std::collections::BTreeMap;
use std::fmt::Write;

use harness_protocol::TelemetryAggregates;

/// Markdown digest of a run's telemetry aggregates.
pub fn render_summary(aggregates: &TelemetryAggregates) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# ABM Agent Test Summary");
    let _ = writeln!(out);
    let _ = writeln!(out, "Total ms: {:.2}", aggregates.total_ms);
    let _ = writeln!(out);

    let _ = writeln!(out, "## Counts by kind");
    for (kind, count) in &aggregates.counts_by_kind {
        let _ = writeln!(out, "- {kind}: {count}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Errors by class");
    write_counts(&mut out, &aggregates.errors_by_class);
    let _ = writeln!(out);

    let _ = writeln!(out, "## Retries by class");
    write_counts(&mut out, &aggregates.retries_by_class);
    let _ = writeln!(out);

    let _ = writeln!(out, "## Durations by name (p95 ms)");
    if aggregates.durations_by_name.is_empty() {
        let _ = writeln!(out, "- none");
    }
    for (name, stats) in &aggregates.durations_by_name {
        let _ = writeln!(out, "- {name}: {:.2}", stats.p95_ms);
    }
    out
}

fn write_counts(out: &mut String, counts: &BTreeMap<String, u64>) {
    if counts.is_empty() {
        let _ = writeln!(out, "- none");
    }
    for (name, count) in counts {
        let _ = writeln!(out, "- {name}: {count}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::compute_telemetry_aggregates;
    use harness_protocol::{EventRecord, TelemetryEvent};

    #[test]
    fn empty_aggregates_render_none_sections() {
        let text = render_summary(&TelemetryAggregates::default());
        assert_eq!(
            text,
            "# ABM Agent Test Summary\n\nTotal ms: 0.00\n\n## Counts by kind\n\n\
             ## Errors by class\n- none\n\n## Retries by class\n- none\n\n\
             ## Durations by name (p95 ms)\n- none\n"
        );
    }

    #[test]
    fn populated_sections_are_sorted() {
        let events: Vec<EventRecord> = vec![
            TelemetryEvent::new("step", "test").with_ms(2.5).into(),
            TelemetryEvent::new("step", "build").with_ms(1.0).into(),
            TelemetryEvent::new("error", "test").with_meta("error_class", "timeout").into(),
        ];
        let text = render_summary(&compute_telemetry_aggregates(&events));

        assert!(text.contains("Total ms: 3.50\n"));
        assert!(text.contains("## Counts by kind\n- error: 1\n- step: 2\n"));
        assert!(text.contains("## Errors by class\n- timeout: 1\n"));
        assert!(text.contains("## Durations by name (p95 ms)\n- build: 1.00\n- test: 2.50\n"));
    }
}
