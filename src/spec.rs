//! Experiment specification model.
//!
//! The spec is immutable after load. It carries four sections: the response
//! variables to observe, the ordered treatments to apply, the system under
//! experiment (a compose file plus include/exclude filters), and the load
//! generation plan.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::error::OxnError;

/// A fully parsed experiment specification.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentSpec {
    pub experiment: Experiment,
}

/// The `experiment` document root.
#[derive(Debug, Clone, Deserialize)]
pub struct Experiment {
    pub responses: Vec<ResponseSpec>,
    #[serde(default)]
    pub treatments: Vec<TreatmentSpec>,
    pub sue: SueSpec,
    pub loadgen: LoadgenSpec,
}

/// A named response variable description.
#[derive(Debug, Clone)]
pub struct ResponseSpec {
    pub name: String,
    pub params: ResponseParams,
}

/// Response variable parameters, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseParams {
    Metric {
        metric_name: String,
        step: u32,
        left_window: String,
        right_window: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
    Trace {
        service_name: String,
        left_window: String,
        right_window: String,
        #[serde(default = "default_trace_limit")]
        limit: usize,
    },
}

impl ResponseParams {
    /// The left observation window as a duration string.
    pub fn left_window(&self) -> &str {
        match self {
            ResponseParams::Metric { left_window, .. } => left_window,
            ResponseParams::Trace { left_window, .. } => left_window,
        }
    }

    /// The right observation window as a duration string.
    pub fn right_window(&self) -> &str {
        match self {
            ResponseParams::Metric { right_window, .. } => right_window,
            ResponseParams::Trace { right_window, .. } => right_window,
        }
    }
}

fn default_trace_limit() -> usize {
    100
}

/// A named treatment description: action tag plus kind-specific params.
#[derive(Debug, Clone)]
pub struct TreatmentSpec {
    pub name: String,
    pub action: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct TreatmentBody {
    action: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// The system under experiment: a compose description plus service filters.
#[derive(Debug, Clone, Deserialize)]
pub struct SueSpec {
    pub compose: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include: Vec<String>,
}

/// The load generation plan.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadgenSpec {
    pub run_time: String,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    pub tasks: Vec<TaskSpec>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

/// One stage of a load shape: hold `users` at `spawn_rate` until the
/// cumulative `duration` (seconds) is reached.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    pub duration: u64,
    pub users: u64,
    pub spawn_rate: u64,
}

/// One load generation task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub name: String,
    pub endpoint: String,
    pub verb: HttpVerb,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

fn default_weight() -> u32 {
    1
}

/// HTTP verbs supported by load generation tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpVerb {
    Get,
    Post,
}

impl HttpVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVerb::Get => "get",
            HttpVerb::Post => "post",
        }
    }
}

// Responses and treatments are written as single-key maps (name -> body) in
// the spec file; deserialize them into (name, body) pairs so insertion order
// survives.

impl<'de> Deserialize<'de> for ResponseSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = BTreeMap::<String, ResponseParams>::deserialize(deserializer)?;
        single_entry(map)
            .map(|(name, params)| ResponseSpec { name, params })
            .map_err(D::Error::custom)
    }
}

impl<'de> Deserialize<'de> for TreatmentSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = BTreeMap::<String, TreatmentBody>::deserialize(deserializer)?;
        single_entry(map)
            .map(|(name, body)| TreatmentSpec {
                name,
                action: body.action,
                params: body.params,
            })
            .map_err(D::Error::custom)
    }
}

fn single_entry<V>(map: BTreeMap<String, V>) -> Result<(String, V), String> {
    let mut entries = map.into_iter();
    match (entries.next(), entries.next()) {
        (Some(entry), None) => Ok(entry),
        _ => Err("expected a single-key map naming the entry".to_string()),
    }
}

impl ExperimentSpec {
    /// Read a specification file and confirm that it is valid YAML.
    ///
    /// YAML-level failures and schema-level failures are distinguished so the
    /// user learns whether the file is malformed or merely mis-shaped.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OxnError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Parse a specification from a YAML string.
    pub fn from_yaml_str(contents: &str) -> Result<Self, OxnError> {
        Self::from_yaml_value(Self::read_yaml(contents)?)
    }

    /// Confirm that spec contents are valid YAML, without schema validation.
    pub fn read_yaml(contents: &str) -> Result<serde_yaml::Value, OxnError> {
        serde_yaml::from_str(contents).map_err(|e| {
            OxnError::validation_explained(
                "Provided experiment spec is not valid YAML",
                e.to_string(),
            )
        })
    }

    /// Validate a parsed YAML document against the spec schema.
    pub fn from_yaml_value(document: serde_yaml::Value) -> Result<Self, OxnError> {
        serde_yaml::from_value(document).map_err(|e| {
            OxnError::validation_explained("Can't validate experiment spec", e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
experiment:
  responses:
    - frontend_traces:
        type: trace
        service_name: frontend
        left_window: 2m
        right_window: 0m
    - recommendations_total:
        type: metric
        metric_name: app_recommendations_counter_total
        labels:
          recommendation_type: catalog
        step: 1
        left_window: 1m
        right_window: 2m
  treatments:
    - pause_frontend:
        action: pause
        params:
          service_name: frontend
          duration: 30s
  sue:
    compose: docker-compose.yml
    exclude:
      - load-generator
  loadgen:
    run_time: 10m
    tasks:
      - endpoint: /
        verb: get
        weight: 2
      - endpoint: /api/cart
        verb: post
        params:
          item: "1"
"#;

    #[test]
    fn parses_a_complete_spec() {
        let spec = ExperimentSpec::from_yaml_str(SPEC).expect("spec parses");
        let experiment = &spec.experiment;
        assert_eq!(experiment.responses.len(), 2);
        assert_eq!(experiment.responses[0].name, "frontend_traces");
        assert!(matches!(
            experiment.responses[0].params,
            ResponseParams::Trace { limit: 100, .. }
        ));
        match &experiment.responses[1].params {
            ResponseParams::Metric {
                metric_name,
                step,
                labels,
                ..
            } => {
                assert_eq!(metric_name, "app_recommendations_counter_total");
                assert_eq!(*step, 1);
                assert_eq!(labels.get("recommendation_type").map(String::as_str), Some("catalog"));
            }
            other => panic!("expected metric params, got {other:?}"),
        }
        assert_eq!(experiment.treatments.len(), 1);
        assert_eq!(experiment.treatments[0].name, "pause_frontend");
        assert_eq!(experiment.treatments[0].action, "pause");
        assert_eq!(experiment.sue.exclude, vec!["load-generator"]);
        assert_eq!(experiment.loadgen.tasks[0].weight, 2);
        assert_eq!(experiment.loadgen.tasks[1].weight, 1);
        assert_eq!(experiment.loadgen.base_url, "http://localhost:8080");
        assert!(!experiment.loadgen.sequential);
    }

    #[test]
    fn missing_responses_fails_with_schema_message() {
        let bad = "experiment:\n  sue:\n    compose: docker-compose.yml\n  loadgen:\n    run_time: 1m\n    tasks: []\n";
        let err = ExperimentSpec::from_yaml_str(bad).expect_err("must fail");
        assert!(err.to_string().contains("Can't validate experiment spec"));
    }

    #[test]
    fn invalid_yaml_fails_with_yaml_message() {
        let err = ExperimentSpec::from_yaml_str("experiment: [unclosed").expect_err("must fail");
        assert!(err.to_string().contains("not valid YAML"));
    }

    #[test]
    fn unknown_response_type_fails() {
        let bad = r#"
experiment:
  responses:
    - weird:
        type: histogram
        left_window: 1m
        right_window: 1m
  sue:
    compose: docker-compose.yml
  loadgen:
    run_time: 1m
    tasks: []
"#;
        let err = ExperimentSpec::from_yaml_str(bad).expect_err("must fail");
        assert!(err.to_string().contains("Can't validate experiment spec"));
    }

    #[test]
    fn treatments_default_to_empty() {
        let minimal = r#"
experiment:
  responses:
    - t:
        type: trace
        service_name: frontend
        left_window: 1m
        right_window: 1m
  sue:
    compose: docker-compose.yml
  loadgen:
    run_time: 1m
    tasks:
      - endpoint: /
        verb: get
"#;
        let spec = ExperimentSpec::from_yaml_str(minimal).expect("spec parses");
        assert!(spec.experiment.treatments.is_empty());
    }
}
