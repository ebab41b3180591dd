//! Semantic validation of experiment specifications against live backends.
//!
//! Syntactic validation happens at spec load. The semantic validator goes
//! further and checks the spec against what the telemetry backends actually
//! know: metric names, label names and values from Prometheus, service
//! names from Jaeger. It therefore requires a provisioned SUE with both
//! backends reachable.

use std::collections::{HashMap, HashSet};

use crate::backends::{Jaeger, Prometheus};
use crate::error::OxnError;
use crate::spec::{ExperimentSpec, ResponseParams};

pub struct SemanticValidator {
    metric_names: HashSet<String>,
    label_names: HashSet<String>,
    label_values: HashMap<String, HashSet<String>>,
    service_names: HashSet<String>,
    messages: Vec<String>,
}

fn string_set(value: &serde_json::Value) -> HashSet<String> {
    value
        .get("data")
        .and_then(serde_json::Value::as_array)
        .map(|data| {
            data.iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl SemanticValidator {
    /// Populate the name sets from the backends.
    pub async fn new(prometheus: &Prometheus, jaeger: &Jaeger) -> Result<Self, OxnError> {
        let metric_names = string_set(&prometheus.metrics().await?);
        let label_names = string_set(&prometheus.labels().await?);
        let mut label_values = HashMap::new();
        for label in &label_names {
            label_values.insert(label.clone(), string_set(&prometheus.label_values(label).await?));
        }
        let service_names: HashSet<String> = jaeger.services().await?.into_iter().collect();
        Ok(Self {
            metric_names,
            label_names,
            label_values,
            service_names,
            messages: Vec::new(),
        })
    }

    #[cfg(test)]
    fn with_names(
        metric_names: &[&str],
        label_names: &[&str],
        label_values: &[(&str, &[&str])],
        service_names: &[&str],
    ) -> Self {
        Self {
            metric_names: metric_names.iter().map(|s| s.to_string()).collect(),
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            label_values: label_values
                .iter()
                .map(|(label, values)| {
                    (
                        label.to_string(),
                        values.iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
            service_names: service_names.iter().map(|s| s.to_string()).collect(),
            messages: Vec::new(),
        }
    }

    fn validate_metric_response(
        &mut self,
        metric_name: &str,
        labels: &std::collections::BTreeMap<String, String>,
    ) {
        if !self.metric_names.contains(metric_name) {
            self.messages.push(format!(
                "Prometheus does not recognize metric name {metric_name}"
            ));
        }
        for (label, value) in labels {
            if !self.label_names.contains(label) {
                self.messages
                    .push(format!("Prometheus does not recognize label name {label}"));
            }
            let known_value = self
                .label_values
                .get(label)
                .is_some_and(|values| values.contains(value));
            if !known_value {
                self.messages.push(format!(
                    "Prometheus does not recognize label value {value} for label {label}"
                ));
            }
        }
    }

    fn validate_trace_response(&mut self, service_name: &str) {
        if !self.service_names.contains(service_name) {
            self.messages.push(format!(
                "Jaeger does not know service name {service_name}"
            ));
        }
    }

    /// Validate every response variable of the spec. All failures are
    /// accumulated and surfaced in one error.
    pub fn validate(&mut self, spec: &ExperimentSpec) -> Result<(), OxnError> {
        for response in &spec.experiment.responses {
            match &response.params {
                ResponseParams::Metric {
                    metric_name,
                    labels,
                    ..
                } => self.validate_metric_response(metric_name, labels),
                ResponseParams::Trace { service_name, .. } => {
                    self.validate_trace_response(service_name)
                }
            }
        }
        if self.messages.is_empty() {
            Ok(())
        } else {
            let err = OxnError::validation(
                "Experiment specification did not pass semantic validation",
                &self.messages,
            );
            self.messages.clear();
            Err(err)
        }
    }
}
