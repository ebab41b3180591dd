//! Response variable implementations.
//!
//! A response variable is a typed observation over an explicit time window:
//! either a Prometheus metric series or a table of Jaeger trace spans. The
//! observation window is anchored to the experiment interval; it opens
//! `left_window` before `experiment_start` and closes `right_window` after
//! `experiment_end`. After observation, each treatment stamps its interval
//! onto the data as a label column.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backends::{Jaeger, Prometheus};
use crate::error::{MetricBackendError, OxnError, TraceBackendError};
use crate::spec::ResponseParams;
use crate::util::{humanize_utc_timestamp, time_string_to_seconds, to_microseconds};

/// Label value marking rows outside every treatment interval.
pub const NO_TREATMENT_LABEL: &str = "NoTreatment";

/// One sample of a metric series. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRow {
    /// Series labels as returned by the metrics backend.
    pub labels: BTreeMap<String, String>,
    pub timestamp: f64,
    pub value: f64,
    /// Treatment label columns: column name to treatment name or
    /// [`NO_TREATMENT_LABEL`].
    #[serde(default)]
    pub treatment_labels: BTreeMap<String, String>,
}

/// One trace span. Timestamps and duration are microseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceRow {
    pub trace_id: String,
    pub span_id: String,
    pub operation: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub service_name: String,
    #[serde(default)]
    pub treatment_labels: BTreeMap<String, String>,
}

/// The observed table of a response variable, persisted to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResponseData {
    Metrics(Vec<MetricRow>),
    Traces(Vec<TraceRow>),
}

impl ResponseData {
    pub fn len(&self) -> usize {
        match self {
            ResponseData::Metrics(rows) => rows.len(),
            ResponseData::Traces(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A response variable of either kind.
#[derive(Debug)]
pub enum ResponseVariable {
    Metric(MetricVariable),
    Trace(TraceVariable),
}

impl ResponseVariable {
    /// Build a variable from its spec entry once the experiment interval is
    /// known. Window endpoints are fixed at this point.
    pub fn from_spec(
        name: &str,
        params: &ResponseParams,
        experiment_start: f64,
        experiment_end: f64,
    ) -> Self {
        match params {
            ResponseParams::Metric {
                metric_name,
                step,
                left_window,
                right_window,
                labels,
            } => ResponseVariable::Metric(MetricVariable {
                id: uuid::Uuid::new_v4().simple().to_string(),
                name: name.to_string(),
                metric_name: metric_name.clone(),
                labels: labels.clone(),
                step: *step,
                experiment_start,
                experiment_end,
                start: experiment_start - time_string_to_seconds(left_window),
                end: experiment_end + time_string_to_seconds(right_window),
                prometheus: Prometheus::new(),
                data: Vec::new(),
            }),
            ResponseParams::Trace {
                service_name,
                left_window,
                right_window,
                limit,
            } => ResponseVariable::Trace(TraceVariable {
                id: uuid::Uuid::new_v4().simple().to_string(),
                name: name.to_string(),
                service_name: service_name.clone(),
                limit: *limit,
                experiment_start,
                experiment_end,
                start: experiment_start - time_string_to_seconds(left_window),
                end: experiment_end + time_string_to_seconds(right_window),
                jaeger: Jaeger::new(),
                data: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ResponseVariable::Metric(v) => &v.name,
            ResponseVariable::Trace(v) => &v.name,
        }
    }

    /// Kind name used in reports.
    pub fn response_type(&self) -> &'static str {
        match self {
            ResponseVariable::Metric(_) => "MetricResponseVariable",
            ResponseVariable::Trace(_) => "TraceResponseVariable",
        }
    }

    /// Start of the observation window, unix seconds.
    pub fn start(&self) -> f64 {
        match self {
            ResponseVariable::Metric(v) => v.start,
            ResponseVariable::Trace(v) => v.start,
        }
    }

    /// End of the observation window, unix seconds.
    pub fn end(&self) -> f64 {
        match self {
            ResponseVariable::Metric(v) => v.end,
            ResponseVariable::Trace(v) => v.end,
        }
    }

    pub fn humanized_start_timestamp(&self) -> String {
        humanize_utc_timestamp(self.start())
    }

    pub fn humanized_end_timestamp(&self) -> String {
        humanize_utc_timestamp(self.end())
    }

    /// The column holding the tested value: the metric name for metric
    /// variables, span duration for trace variables.
    pub fn value_column(&self) -> &str {
        match self {
            ResponseVariable::Metric(v) => &v.metric_name,
            ResponseVariable::Trace(_) => "duration",
        }
    }

    /// Fetch the variable's data from its backend.
    pub async fn observe(&mut self) -> Result<(), OxnError> {
        match self {
            ResponseVariable::Metric(v) => v.observe().await.map_err(OxnError::from),
            ResponseVariable::Trace(v) => v.observe().await.map_err(OxnError::from),
        }
    }

    /// Stamp a treatment interval onto every row.
    ///
    /// A row gets `label` when its timestamp, in the variable's native unit,
    /// lies in `[treatment_start, treatment_end]`; otherwise it gets
    /// [`NO_TREATMENT_LABEL`].
    pub fn label(
        &mut self,
        treatment_start: f64,
        treatment_end: f64,
        label_column: &str,
        label: &str,
    ) {
        match self {
            ResponseVariable::Metric(v) => {
                for row in &mut v.data {
                    let value = if treatment_start <= row.timestamp
                        && row.timestamp <= treatment_end
                    {
                        label
                    } else {
                        NO_TREATMENT_LABEL
                    };
                    row.treatment_labels
                        .insert(label_column.to_string(), value.to_string());
                }
            }
            ResponseVariable::Trace(v) => {
                let scaled_start = to_microseconds(treatment_start) as i64;
                let scaled_end = to_microseconds(treatment_end) as i64;
                for row in &mut v.data {
                    let value = if row.start_time >= scaled_start && row.start_time <= scaled_end
                    {
                        label
                    } else {
                        NO_TREATMENT_LABEL
                    };
                    row.treatment_labels
                        .insert(label_column.to_string(), value.to_string());
                }
            }
        }
    }

    /// A copy of the observed data for persistence.
    pub fn data(&self) -> ResponseData {
        match self {
            ResponseVariable::Metric(v) => ResponseData::Metrics(v.data.clone()),
            ResponseVariable::Trace(v) => ResponseData::Traces(v.data.clone()),
        }
    }
}

/// A Prometheus-backed metric response variable.
#[derive(Debug)]
pub struct MetricVariable {
    pub id: String,
    pub name: String,
    pub metric_name: String,
    pub labels: BTreeMap<String, String>,
    pub step: u32,
    pub experiment_start: f64,
    pub experiment_end: f64,
    pub start: f64,
    pub end: f64,
    prometheus: Prometheus,
    pub data: Vec<MetricRow>,
}

impl MetricVariable {
    async fn observe(&mut self) -> Result<(), MetricBackendError> {
        let query = Prometheus::build_query(&self.metric_name, &self.labels);
        let response = self
            .prometheus
            .range_query(&query, self.start, self.end, self.step)
            .await?;
        self.data = tabulate_range_query(&response)?;
        Ok(())
    }
}

/// Flatten a Prometheus range-query response into rows.
pub fn tabulate_range_query(response: &serde_json::Value) -> Result<Vec<MetricRow>, MetricBackendError> {
    let results = response
        .pointer("/data/result")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| MetricBackendError::Shape {
            explanation: "range query response is missing data.result".to_string(),
        })?;
    if results.is_empty() {
        return Err(MetricBackendError::EmptyResponse {
            explanation: "range query returned no series".to_string(),
        });
    }
    let mut rows = Vec::new();
    for result in results {
        let labels: BTreeMap<String, String> = result
            .get("metric")
            .and_then(serde_json::Value::as_object)
            .map(|metric| {
                metric
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let values = result
            .get("values")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| MetricBackendError::Shape {
                explanation: "range query result is missing values".to_string(),
            })?;
        for sample in values {
            let timestamp = sample
                .get(0)
                .and_then(serde_json::Value::as_f64)
                .ok_or_else(|| MetricBackendError::Shape {
                    explanation: "sample is missing its timestamp".to_string(),
                })?;
            // Prometheus renders sample values as strings; non-numeric
            // values become NaN and are omitted by the t-test.
            let value = sample
                .get(1)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.parse::<f64>().unwrap_or(f64::NAN),
                    serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
                    _ => f64::NAN,
                })
                .unwrap_or(f64::NAN);
            rows.push(MetricRow {
                labels: labels.clone(),
                timestamp,
                value,
                treatment_labels: BTreeMap::new(),
            });
        }
    }
    Ok(rows)
}

/// A Jaeger-backed trace response variable.
#[derive(Debug)]
pub struct TraceVariable {
    pub id: String,
    pub name: String,
    pub service_name: String,
    pub limit: usize,
    pub experiment_start: f64,
    pub experiment_end: f64,
    pub start: f64,
    pub end: f64,
    jaeger: Jaeger,
    pub data: Vec<TraceRow>,
}

impl TraceVariable {
    async fn observe(&mut self) -> Result<(), TraceBackendError> {
        let response = self
            .jaeger
            .search_traces(
                &self.service_name,
                to_microseconds(self.start) as i64,
                to_microseconds(self.end) as i64,
                self.limit,
            )
            .await?;
        self.data = tabulate_traces(&response)?;
        Ok(())
    }
}

/// Flatten a Jaeger trace search response into span rows.
pub fn tabulate_traces(response: &serde_json::Value) -> Result<Vec<TraceRow>, TraceBackendError> {
    let traces = response
        .get("data")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| TraceBackendError::Shape {
            explanation: "trace search response is missing the data array".to_string(),
        })?;
    let mut rows = Vec::new();
    for trace in traces {
        let processes = trace
            .get("processes")
            .and_then(serde_json::Value::as_object);
        let spans = trace
            .get("spans")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| TraceBackendError::Shape {
                explanation: "trace is missing its spans".to_string(),
            })?;
        for span in spans {
            let get_str = |key: &str| {
                span.get(key)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let start_time = span
                .get("startTime")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or_default();
            let duration = span
                .get("duration")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or_default();
            let service_name = processes
                .and_then(|processes| processes.get(&get_str("processID")))
                .and_then(|process| process.get("serviceName"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            rows.push(TraceRow {
                trace_id: get_str("traceID"),
                span_id: get_str("spanID"),
                operation: get_str("operationName"),
                start_time,
                end_time: start_time + duration,
                duration,
                service_name,
                treatment_labels: BTreeMap::new(),
            });
        }
    }
    if rows.is_empty() {
        return Err(TraceBackendError::EmptyResponse {
            explanation: "cannot build a span table from zero traces".to_string(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ResponseParams;
    use serde_json::json;

    fn metric_params() -> ResponseParams {
        ResponseParams::Metric {
            metric_name: "app_requests_total".to_string(),
            step: 1,
            left_window: "1m".to_string(),
            right_window: "2m".to_string(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn window_brackets_the_experiment_interval() {
        let variable =
            ResponseVariable::from_spec("requests", &metric_params(), 1_000.0, 2_000.0);
        assert_eq!(variable.start(), 940.0);
        assert_eq!(variable.end(), 2_120.0);
        assert!(variable.start() <= 1_000.0);
        assert!(variable.end() >= 2_000.0);
    }

    #[test]
    fn metric_rows_label_by_seconds() {
        let mut variable =
            ResponseVariable::from_spec("requests", &metric_params(), 0.0, 100.0);
        if let ResponseVariable::Metric(v) = &mut variable {
            for timestamp in [10.0, 20.0, 30.0] {
                v.data.push(MetricRow {
                    labels: BTreeMap::new(),
                    timestamp,
                    value: 1.0,
                    treatment_labels: BTreeMap::new(),
                });
            }
        }
        variable.label(15.0, 25.0, "pause_frontend", "pause_frontend");
        if let ResponseVariable::Metric(v) = &variable {
            let labels: Vec<&str> = v
                .data
                .iter()
                .map(|row| row.treatment_labels["pause_frontend"].as_str())
                .collect();
            assert_eq!(labels, vec![NO_TREATMENT_LABEL, "pause_frontend", NO_TREATMENT_LABEL]);
        } else {
            panic!("expected metric variable");
        }
    }

    #[test]
    fn trace_rows_label_by_microseconds() {
        let params = ResponseParams::Trace {
            service_name: "frontend".to_string(),
            left_window: "0s".to_string(),
            right_window: "0s".to_string(),
            limit: 100,
        };
        let mut variable = ResponseVariable::from_spec("traces", &params, 0.0, 100.0);
        if let ResponseVariable::Trace(v) = &mut variable {
            for start_time in [10_000_000i64, 20_000_000, 30_000_000] {
                v.data.push(TraceRow {
                    trace_id: "t".into(),
                    span_id: "s".into(),
                    operation: "op".into(),
                    start_time,
                    end_time: start_time + 500,
                    duration: 500,
                    service_name: "frontend".into(),
                    treatment_labels: BTreeMap::new(),
                });
            }
        }
        variable.label(15.0, 25.0, "pause", "pause");
        if let ResponseVariable::Trace(v) = &variable {
            let labels: Vec<&str> = v
                .data
                .iter()
                .map(|row| row.treatment_labels["pause"].as_str())
                .collect();
            assert_eq!(labels, vec![NO_TREATMENT_LABEL, "pause", NO_TREATMENT_LABEL]);
        } else {
            panic!("expected trace variable");
        }
    }

    #[test]
    fn tabulates_range_query_responses() {
        let response = json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {
                        "metric": { "job": "frontend", "instance": "frontend:8080" },
                        "values": [[1000.0, "41"], [1001.0, "42"], [1002.0, "oops"]]
                    }
                ]
            }
        });
        let rows = tabulate_range_query(&response).expect("tabulates");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].labels["job"], "frontend");
        assert_eq!(rows[1].value, 42.0);
        assert!(rows[2].value.is_nan());
    }

    #[test]
    fn empty_range_query_fails() {
        let response = json!({ "data": { "result": [] } });
        let err = tabulate_range_query(&response).expect_err("must fail");
        assert!(matches!(err, MetricBackendError::EmptyResponse { .. }));
    }

    #[test]
    fn tabulates_trace_responses() {
        let response = json!({
            "data": [
                {
                    "traceID": "abc",
                    "spans": [
                        {
                            "traceID": "abc",
                            "spanID": "s1",
                            "operationName": "GET /",
                            "startTime": 1_000_000,
                            "duration": 2_500,
                            "processID": "p1"
                        }
                    ],
                    "processes": { "p1": { "serviceName": "frontend" } }
                }
            ]
        });
        let rows = tabulate_traces(&response).expect("tabulates");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].end_time, 1_002_500);
        assert_eq!(rows[0].service_name, "frontend");
    }

    #[test]
    fn empty_trace_response_fails() {
        let response = json!({ "data": [] });
        let err = tabulate_traces(&response).expect_err("must fail");
        assert!(matches!(err, TraceBackendError::EmptyResponse { .. }));
    }
}
