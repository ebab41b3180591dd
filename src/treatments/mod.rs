//! Treatment model and library.
//!
//! A treatment is a named, typed fault or configuration action with a
//! validated lifecycle: construction validates and transforms the supplied
//! parameters (an invalid treatment is never built), preconditions gate
//! execution once the SUE is up, `inject` applies the fault, and `clean`
//! removes any residual effect. Runtime treatments act on a live SUE;
//! compile-time treatments mutate configuration before the SUE is built and
//! restore it after teardown.

mod empty;
mod kill;
mod metrics_interval;
mod network;
mod otel_sampling;
mod pause;
mod prometheus_interval;
mod stress;

pub use empty::EmptyTreatment;
pub use kill::KillTreatment;
pub use metrics_interval::MetricsExportIntervalTreatment;
pub use network::{CorruptPacketTreatment, NetworkDelayTreatment, PacketLossTreatment};
pub use otel_sampling::{ProbabilisticSamplingTreatment, TailSamplingTreatment};
pub use pause::PauseTreatment;
pub use prometheus_interval::PrometheusIntervalTreatment;
pub use stress::StressTreatment;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{OrchestrationError, OxnError};
use crate::util::{humanize_utc_timestamp, validate_time_string, TIME_STRING_FORMAT};

/// Percentage literals accepted by the netem treatments: 1%..100%.
pub const PERCENTAGE_FORMAT: &str = r"^([1-9][0-9]?|100)%$";

static PERCENTAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PERCENTAGE_FORMAT).expect("percentage regex is valid"));

/// Validate a percentage literal like `"35%"`.
pub fn validate_percentage_string(value: &str) -> bool {
    PERCENTAGE_REGEX.is_match(value)
}

/// State shared by every treatment: identity, user-supplied config, the
/// diagnostic message accumulator, and the execution interval.
#[derive(Debug)]
pub struct TreatmentCore {
    pub id: String,
    pub name: String,
    pub config: Map<String, Value>,
    pub messages: Vec<String>,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TreatmentCore {
    fn new(name: &str, params: &Value) -> Self {
        let config = params.as_object().cloned().unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            config,
            messages: Vec::new(),
            start: None,
            end: None,
        }
    }
}

/// The treatment lifecycle contract.
///
/// Implementations are constructed through the registry; construction runs
/// parameter validation and transformation, so a reachable treatment is
/// always in the Validated and Transformed states.
#[async_trait]
pub trait Treatment: Send + std::fmt::Debug {
    fn core(&self) -> &TreatmentCore;
    fn core_mut(&mut self) -> &mut TreatmentCore;

    /// The action tag matching treatment descriptions in the spec.
    fn action(&self) -> &'static str;

    /// The concrete kind name, used in reports.
    fn treatment_type(&self) -> &'static str;

    /// True if the treatment is applied while the SUE is live, false if it
    /// mutates configuration before the SUE is built.
    fn is_runtime(&self) -> bool;

    /// Check whether this treatment can execute. Implementations populate
    /// the message accumulator on unmet preconditions. Runtime treatments
    /// may depend on a provisioned SUE; compile-time treatments must not.
    async fn preconditions(&mut self) -> bool;

    /// Apply the treatment. Parameters were supplied at construction.
    async fn inject(&mut self) -> Result<(), OxnError>;

    /// Remove any residual effect of the injection.
    async fn clean(&mut self) -> Result<(), OxnError>;

    /// The config file this treatment mutates, if any. Used to reject
    /// overlapping mutations of one file within a run.
    fn mutated_file(&self) -> Option<PathBuf> {
        None
    }

    fn name(&self) -> &str {
        &self.core().name
    }

    /// Truncated unique id for log lines.
    fn short_id(&self) -> &str {
        &self.core().id[..8]
    }

    fn messages(&self) -> &[String] {
        &self.core().messages
    }

    fn start(&self) -> Option<f64> {
        self.core().start
    }

    fn end(&self) -> Option<f64> {
        self.core().end
    }

    fn set_start(&mut self, timestamp: f64) {
        self.core_mut().start = Some(timestamp);
    }

    fn set_end(&mut self, timestamp: f64) {
        self.core_mut().end = Some(timestamp);
    }

    fn humanize_start_time(&self) -> String {
        self.start().map(humanize_utc_timestamp).unwrap_or_default()
    }

    fn humanize_end_time(&self) -> String {
        self.end().map(humanize_utc_timestamp).unwrap_or_default()
    }
}

/// Expected kind of a treatment parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Int,
    Map,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::Str => value.is_string(),
            ParamKind::Int => value.is_i64() || value.is_u64(),
            ParamKind::Map => value.is_object(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ParamKind::Str => "string",
            ParamKind::Int => "integer",
            ParamKind::Map => "mapping",
        }
    }
}

/// Accumulating validator over a treatment's config map.
///
/// Individual failures never abort; every rule appends a message and the
/// final verdict is the absence of messages.
pub(crate) struct ParamValidator<'a> {
    config: &'a Map<String, Value>,
    treatment_type: &'static str,
    messages: Vec<String>,
}

impl<'a> ParamValidator<'a> {
    pub(crate) fn new(config: &'a Map<String, Value>, treatment_type: &'static str) -> Self {
        Self {
            config,
            treatment_type,
            messages: Vec::new(),
        }
    }

    /// Require a key of the given kind.
    pub(crate) fn require(&mut self, key: &str, kind: ParamKind) -> &mut Self {
        match self.config.get(key) {
            None => self.messages.push(format!(
                "Parameter {key} has to be supplied for {}",
                self.treatment_type
            )),
            Some(value) if !kind.matches(value) => self.messages.push(format!(
                "Parameter {key} has to be of type {} for {}",
                kind.describe(),
                self.treatment_type
            )),
            Some(_) => {}
        }
        self
    }

    /// Check the kind of an optional key when present.
    pub(crate) fn optional(&mut self, key: &str, kind: ParamKind) -> &mut Self {
        if let Some(value) = self.config.get(key)
            && !kind.matches(value)
        {
            self.messages.push(format!(
                "Parameter {key} has to be of type {} for {}",
                kind.describe(),
                self.treatment_type
            ));
        }
        self
    }

    /// Check that a present string key parses as a duration string.
    pub(crate) fn duration(&mut self, key: &str) -> &mut Self {
        if let Some(value) = self.config.get(key).and_then(Value::as_str)
            && !validate_time_string(value)
        {
            self.messages.push(format!(
                "Value for parameter {key} has to match {TIME_STRING_FORMAT} for {}",
                self.treatment_type
            ));
        }
        self
    }

    /// Check that a present string key is a percentage literal.
    pub(crate) fn percentage(&mut self, key: &str) -> &mut Self {
        if let Some(value) = self.config.get(key).and_then(Value::as_str)
            && !validate_percentage_string(value)
        {
            self.messages.push(format!(
                "Value for parameter {key} has to match {PERCENTAGE_FORMAT} for {}",
                self.treatment_type
            ));
        }
        self
    }

    /// Check that a present string key is one of the allowed values.
    pub(crate) fn one_of(&mut self, key: &str, allowed: &[&str]) -> &mut Self {
        if let Some(value) = self.config.get(key).and_then(Value::as_str)
            && !allowed.contains(&value)
        {
            self.messages.push(format!(
                "Value for parameter {key} has to be one of {allowed:?} for {}",
                self.treatment_type
            ));
        }
        self
    }

    /// The accumulated messages; empty means the config validates.
    pub(crate) fn finish(self) -> Vec<String> {
        self.messages
    }
}

/// Fetch a required string parameter after validation has passed.
pub(crate) fn config_str(config: &Map<String, Value>, key: &str) -> String {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

/// Fetch an optional string parameter with a default.
pub(crate) fn config_str_or(config: &Map<String, Value>, key: &str, default: &str) -> String {
    config
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

/// Error helper raised when a treatment config fails validation.
pub(crate) fn invalid_config(
    treatment_type: &str,
    name: &str,
    messages: Vec<String>,
) -> OxnError {
    OxnError::validation(
        format!("Invalid configuration for {treatment_type}(name={name}) provided"),
        &messages,
    )
}

/// Connect to the local docker daemon for container-level treatments.
pub(crate) fn docker_client() -> Result<Docker, OxnError> {
    Docker::connect_with_local_defaults()
        .map_err(|e| OrchestrationError::Connection(e.to_string()).into())
}

/// Run a command inside a container and return its exit code.
pub(crate) async fn exec_in_container(
    docker: &Docker,
    container: &str,
    cmd: Vec<String>,
) -> Result<i64, OxnError> {
    let exec = docker
        .create_exec(
            container,
            CreateExecOptions {
                cmd: Some(cmd),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(OrchestrationError::Api)?;
    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(OrchestrationError::Api)?
    {
        while let Some(chunk) = output.next().await {
            if let Ok(log) = chunk {
                tracing::trace!(container, output = %log, "exec output");
            }
        }
    }
    let inspection = docker
        .inspect_exec(&exec.id)
        .await
        .map_err(OrchestrationError::Api)?;
    Ok(inspection.exit_code.unwrap_or(-1))
}

/// Probe a container for the `tc` binary; appends a message on failure.
pub(crate) async fn probe_tc(
    docker: &Docker,
    service: &str,
    treatment_type: &str,
    messages: &mut Vec<String>,
) -> bool {
    let command = vec!["tc".to_string(), "-Version".to_string()];
    match exec_in_container(docker, service, command).await {
        Ok(0) => true,
        Ok(status) => {
            tracing::info!(service, status, "probed container for tc");
            messages.push(format!(
                "Container {service} does not have tc installed which is required for \
                 {treatment_type}. Please install package iproute2 in the container"
            ));
            false
        }
        Err(error) => {
            messages.push(format!("Can't probe container {service}: {error}"));
            false
        }
    }
}

/// Check that a container exists and is in state "running"; appends a
/// message otherwise.
pub(crate) async fn probe_running(
    docker: &Docker,
    service: &str,
    treatment_type: &str,
    messages: &mut Vec<String>,
) -> bool {
    use bollard::container::InspectContainerOptions;
    use bollard::models::ContainerStateStatusEnum;

    match docker
        .inspect_container(service, None::<InspectContainerOptions>)
        .await
    {
        Ok(inspection) => {
            let status = inspection.state.and_then(|state| state.status);
            tracing::info!(service, ?status, "probed container for state running");
            if status == Some(ContainerStateStatusEnum::RUNNING) {
                true
            } else {
                messages.push(format!(
                    "Container {service} is not running which is required for {treatment_type}."
                ));
                false
            }
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            messages.push(format!("Can't find container {service} for {treatment_type}"));
            false
        }
        Err(error) => {
            messages.push(format!(
                "Can't talk to the Docker API: {error} in {treatment_type}"
            ));
            false
        }
    }
}

/// Constructor signature stored in the treatment registry.
pub type TreatmentConstructor = fn(&str, &Value) -> Result<Box<dyn Treatment>, OxnError>;

/// Registry mapping action tags to treatment constructors.
///
/// User-supplied treatments extend the registry before the runner builds;
/// the built-in set covers the treatment library.
pub struct TreatmentRegistry {
    constructors: HashMap<String, TreatmentConstructor>,
}

impl Default for TreatmentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TreatmentRegistry {
    /// Registry pre-populated with the built-in treatment library.
    pub fn builtin() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("empty", |name, params| {
            Ok(Box::new(EmptyTreatment::new(name, params)?))
        });
        registry.register("pause", |name, params| {
            Ok(Box::new(PauseTreatment::new(name, params)?))
        });
        registry.register("kill", |name, params| {
            Ok(Box::new(KillTreatment::new(name, params)?))
        });
        registry.register("delay", |name, params| {
            Ok(Box::new(NetworkDelayTreatment::new(name, params)?))
        });
        registry.register("loss", |name, params| {
            Ok(Box::new(PacketLossTreatment::new(name, params)?))
        });
        registry.register("corrupt", |name, params| {
            Ok(Box::new(CorruptPacketTreatment::new(name, params)?))
        });
        registry.register("stress", |name, params| {
            Ok(Box::new(StressTreatment::new(name, params)?))
        });
        registry.register("sampling", |name, params| {
            Ok(Box::new(PrometheusIntervalTreatment::new(name, params)?))
        });
        registry.register("tail", |name, params| {
            Ok(Box::new(TailSamplingTreatment::new(name, params)?))
        });
        registry.register("probl", |name, params| {
            Ok(Box::new(ProbabilisticSamplingTreatment::new(name, params)?))
        });
        registry.register("otel_metrics_interval", |name, params| {
            Ok(Box::new(MetricsExportIntervalTreatment::new(name, params)?))
        });
        registry
    }

    /// Register (or replace) a constructor under an action tag.
    pub fn register(&mut self, action: &str, constructor: TreatmentConstructor) {
        self.constructors.insert(action.to_string(), constructor);
    }

    /// Build a treatment from a spec description.
    pub fn build(
        &self,
        action: &str,
        name: &str,
        params: &Value,
    ) -> Result<Box<dyn Treatment>, OxnError> {
        let constructor = self.constructors.get(action).ok_or_else(|| {
            OxnError::validation_explained(
                format!("Error while building treatment {name}"),
                format!("Treatment key {action} does not exist in the treatment library"),
            )
        })?;
        constructor(name, params)
    }

    /// The registered action tags, for diagnostics.
    pub fn actions(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn percentage_boundaries() {
        assert!(!validate_percentage_string("0%"));
        assert!(validate_percentage_string("1%"));
        assert!(validate_percentage_string("35%"));
        assert!(validate_percentage_string("100%"));
        assert!(!validate_percentage_string("101%"));
        assert!(!validate_percentage_string("35"));
    }

    #[test]
    fn validator_accumulates_all_failures() {
        let params = json!({ "duration": "fast" });
        let config = params.as_object().expect("object");
        let mut validator = ParamValidator::new(config, "PauseTreatment");
        validator
            .require("service_name", ParamKind::Str)
            .require("duration", ParamKind::Str)
            .duration("duration");
        let messages = validator.finish();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("service_name"));
        assert!(messages[1].contains("duration"));
    }

    #[test]
    fn unknown_action_names_the_missing_key() {
        let registry = TreatmentRegistry::builtin();
        let err = registry
            .build("explode", "boom", &json!({}))
            .expect_err("unknown action must fail");
        assert!(err.to_string().contains("explode"));
        assert!(err.to_string().contains("does not exist in the treatment library"));
    }

    #[test]
    fn builtin_registry_covers_the_treatment_library() {
        let registry = TreatmentRegistry::builtin();
        let mut actions = registry.actions();
        actions.sort_unstable();
        assert_eq!(
            actions,
            vec![
                "corrupt",
                "delay",
                "empty",
                "kill",
                "loss",
                "otel_metrics_interval",
                "pause",
                "probl",
                "sampling",
                "stress",
                "tail",
            ]
        );
    }

    #[test]
    fn registry_accepts_user_extensions() {
        let mut registry = TreatmentRegistry::builtin();
        registry.register("noop", |name, params| {
            Ok(Box::new(EmptyTreatment::new(name, params)?))
        });
        let treatment = registry
            .build("noop", "custom", &json!({ "duration": "1s" }))
            .expect("extension builds");
        assert_eq!(treatment.name(), "custom");
    }
}
