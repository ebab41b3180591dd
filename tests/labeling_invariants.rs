//! End-to-end labeling and analysis invariants on synthetic data.
//!
//! Exercises the pipeline from observed rows through treatment labeling to
//! the per-pair statistical test: every variable gets one label column per
//! treatment, label values are drawn from the treatment name and
//! "NoTreatment", and a row carries the treatment name exactly when its
//! timestamp (in the variable's native unit) falls inside the treatment
//! interval.

use std::collections::BTreeMap;

use oxn::report::{partition_by_label, welch_ttest};
use oxn::responses::{MetricRow, NO_TREATMENT_LABEL, ResponseVariable, TraceRow};
use oxn::spec::ResponseParams;

fn trace_variable_with_rows(start_times_us: &[i64], durations_us: &[i64]) -> ResponseVariable {
    let params = ResponseParams::Trace {
        service_name: "frontend".to_string(),
        left_window: "2m".to_string(),
        right_window: "0m".to_string(),
        limit: 100,
    };
    let mut variable = ResponseVariable::from_spec("frontend_traces", &params, 1_000.0, 2_000.0);
    let ResponseVariable::Trace(trace) = &mut variable else {
        panic!("expected a trace variable");
    };
    for (start_time, duration) in start_times_us.iter().zip(durations_us) {
        trace.data.push(TraceRow {
            trace_id: format!("trace-{start_time}"),
            span_id: format!("span-{start_time}"),
            operation: "GET /".to_string(),
            start_time: *start_time,
            end_time: start_time + duration,
            duration: *duration,
            service_name: "frontend".to_string(),
            treatment_labels: BTreeMap::new(),
        });
    }
    variable
}

fn metric_variable_with_rows(timestamps: &[f64], values: &[f64]) -> ResponseVariable {
    let params = ResponseParams::Metric {
        metric_name: "app_requests_total".to_string(),
        step: 1,
        left_window: "1m".to_string(),
        right_window: "1m".to_string(),
        labels: BTreeMap::new(),
    };
    let mut variable = ResponseVariable::from_spec("request_rate", &params, 1_000.0, 2_000.0);
    let ResponseVariable::Metric(metric) = &mut variable else {
        panic!("expected a metric variable");
    };
    for (timestamp, value) in timestamps.iter().zip(values) {
        metric.data.push(MetricRow {
            labels: BTreeMap::new(),
            timestamp: *timestamp,
            value: *value,
            treatment_labels: BTreeMap::new(),
        });
    }
    variable
}

#[test]
fn pause_interval_labels_spans_by_start_time() {
    // Treatment interval [1200 s, 1230 s]; spans at 1100 s, 1210 s, 1229 s,
    // 1300 s (scaled to microseconds).
    let mut variable = trace_variable_with_rows(
        &[
            1_100_000_000,
            1_210_000_000,
            1_229_000_000,
            1_300_000_000,
        ],
        &[500, 40_000, 35_000, 700],
    );
    variable.label(1_200.0, 1_230.0, "pause", "pause");

    let oxn::responses::ResponseData::Traces(rows) = variable.data() else {
        panic!("expected trace data");
    };
    let labels: Vec<&str> = rows
        .iter()
        .map(|row| row.treatment_labels["pause"].as_str())
        .collect();
    assert_eq!(labels, vec![NO_TREATMENT_LABEL, "pause", "pause", NO_TREATMENT_LABEL]);

    // Labeled rows are exactly the rows whose start time is inside the
    // scaled interval.
    for row in &rows {
        let inside =
            row.start_time >= 1_200_000_000 && row.start_time <= 1_230_000_000;
        assert_eq!(row.treatment_labels["pause"] == "pause", inside);
    }
}

#[test]
fn every_treatment_gets_its_own_label_column() {
    let mut variable = metric_variable_with_rows(
        &[1_010.0, 1_110.0, 1_210.0, 1_310.0],
        &[1.0, 2.0, 3.0, 4.0],
    );
    variable.label(1_000.0, 1_050.0, "pause_frontend", "pause_frontend");
    variable.label(1_100.0, 1_150.0, "kill_backend", "kill_backend");
    variable.label(1_200.0, 1_250.0, "delay_frontend", "delay_frontend");

    let oxn::responses::ResponseData::Metrics(rows) = variable.data() else {
        panic!("expected metric data");
    };
    for row in &rows {
        for column in ["pause_frontend", "kill_backend", "delay_frontend"] {
            let value = &row.treatment_labels[column];
            assert!(
                value == column || value == NO_TREATMENT_LABEL,
                "label values are the treatment name or NoTreatment"
            );
        }
    }
    // Each treatment interval captured exactly one row.
    for (index, column) in ["pause_frontend", "kill_backend", "delay_frontend"]
        .iter()
        .enumerate()
    {
        let captured: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.treatment_labels[*column] == **column)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(captured, vec![index]);
    }
}

#[test]
fn labeled_data_flows_into_the_welch_test() {
    // Treated rows are slower on average; the pipeline should pick up the
    // separation with a small p-value.
    let timestamps: Vec<f64> = (0..40).map(|i| 1_000.0 + i as f64 * 10.0).collect();
    let values: Vec<f64> = (0..40)
        .map(|i| {
            let timestamp = 1_000.0 + i as f64 * 10.0;
            if (1_100.0..=1_200.0).contains(&timestamp) {
                50.0 + (i % 3) as f64
            } else {
                10.0 + (i % 3) as f64
            }
        })
        .collect();
    let mut variable = metric_variable_with_rows(&timestamps, &values);
    variable.label(1_100.0, 1_200.0, "stress_cpu", "stress_cpu");

    let data = variable.data();
    let (experiment, control) = partition_by_label(&data, "stress_cpu").expect("partitions");
    assert_eq!(experiment.len(), 11);
    assert_eq!(control.len(), 29);

    let result = welch_ttest(&experiment, &control);
    assert!(result.statistic > 0.0, "treated rows are slower");
    assert!(result.p_value < 1e-6);
}

#[test]
fn windows_bracket_the_experiment_interval() {
    let variable = metric_variable_with_rows(&[], &[]);
    assert!(variable.start() <= 1_000.0);
    assert!(variable.end() >= 2_000.0);
    assert_eq!(variable.start(), 940.0);
    assert_eq!(variable.end(), 2_060.0);
}
