//! OpenTelemetry collector sampling treatments.
//!
//! Both treatments patch the collector's extras config file. The collector
//! cannot hot-reload, so the tail-sampling treatment restarts the collector
//! container after writing the patch; the probabilistic sampler is applied
//! before the SUE is built. The pre-mutation file contents are memorized at
//! construction and restored on cleanup.

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{StartContainerOptions, StopContainerOptions, WaitContainerOptions};
use futures::StreamExt;
use serde_json::Value;
use serde_yaml::Mapping;
use tokio::time::{Duration, sleep};

use crate::error::{OrchestrationError, OxnError};
use crate::treatments::{
    ParamKind, ParamValidator, Treatment, TreatmentCore, config_str, docker_client,
    invalid_config,
};
use crate::util::time_string_to_seconds;

/// Container name of the OpenTelemetry collector in the SUE.
const OTELCOL_CONTAINER: &str = "otel-col";

fn read_extras(path: &str) -> Result<serde_yaml::Value, OxnError> {
    let contents = std::fs::read_to_string(path)?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(|e| {
        OxnError::validation_explained(
            format!("Collector extras file at {path} is not valid YAML"),
            e.to_string(),
        )
    })?;
    // An empty extras file parses to null; treat it as an empty mapping.
    Ok(match parsed {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(Mapping::new()),
        other => other,
    })
}

fn write_extras(path: &str, value: &serde_yaml::Value) -> Result<(), OxnError> {
    let contents = serde_yaml::to_string(value).map_err(|e| {
        OxnError::validation_explained(
            format!("Cannot serialize collector extras file at {path}"),
            e.to_string(),
        )
    })?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Build the `service.pipelines.traces.processors` patch for one processor.
fn traces_pipeline_patch(processor: &str) -> serde_yaml::Value {
    let mut traces = Mapping::new();
    traces.insert(
        "processors".into(),
        serde_yaml::Value::Sequence(vec![processor.into()]),
    );
    let mut pipelines = Mapping::new();
    pipelines.insert("traces".into(), serde_yaml::Value::Mapping(traces));
    let mut service = Mapping::new();
    service.insert("pipelines".into(), serde_yaml::Value::Mapping(pipelines));
    serde_yaml::Value::Mapping(service)
}

/// Add a tail-sampling policy to the collector and restart it.
#[derive(Debug)]
pub struct TailSamplingTreatment {
    core: TreatmentCore,
    docker: Docker,
    original_extras: serde_yaml::Value,
}

impl TailSamplingTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "TailSamplingTreatment");
        validator
            .require("otelcol_extras", ParamKind::Str)
            .require("policy_name", ParamKind::Str)
            .require("type", ParamKind::Str)
            .require("policy_params", ParamKind::Map)
            .optional("decision_wait", ParamKind::Str)
            .optional("num_traces", ParamKind::Int)
            .optional("expected_new_traces", ParamKind::Int)
            .optional("duration", ParamKind::Str)
            .duration("duration");
        let messages = validator.finish();
        if !messages.is_empty() {
            return Err(invalid_config("TailSamplingTreatment", name, messages));
        }
        let path = config_str(&core.config, "otelcol_extras");
        let original_extras = read_extras(&path)?;
        Ok(Self {
            core,
            docker: docker_client()?,
            original_extras,
        })
    }

    fn build_patch(&self) -> Result<serde_yaml::Value, OxnError> {
        let policy_type = config_str(&self.core.config, "type");
        let policy_name = config_str(&self.core.config, "policy_name");
        let policy_params: serde_yaml::Value = self
            .core
            .config
            .get("policy_params")
            .map(|params| serde_yaml::to_value(params))
            .transpose()
            .map_err(|e| {
                OxnError::validation_explained(
                    "Cannot convert tail sampling policy params",
                    e.to_string(),
                )
            })?
            .unwrap_or(serde_yaml::Value::Mapping(Mapping::new()));

        let mut policy = Mapping::new();
        policy.insert("name".into(), policy_name.into());
        policy.insert("type".into(), policy_type.clone().into());
        policy.insert(policy_type.into(), policy_params);

        let mut tail_sampling = Mapping::new();
        for key in ["decision_wait", "num_traces", "expected_new_traces"] {
            if let Some(value) = self.core.config.get(key) {
                let value = serde_yaml::to_value(value).map_err(|e| {
                    OxnError::validation_explained(
                        "Cannot convert tail sampling settings",
                        e.to_string(),
                    )
                })?;
                tail_sampling.insert(key.into(), value);
            }
        }
        tail_sampling.insert(
            "policies".into(),
            serde_yaml::Value::Sequence(vec![serde_yaml::Value::Mapping(policy)]),
        );

        let mut processors = Mapping::new();
        processors.insert("tail_sampling".into(), serde_yaml::Value::Mapping(tail_sampling));

        let mut patch = Mapping::new();
        patch.insert("processors".into(), serde_yaml::Value::Mapping(processors));
        if let serde_yaml::Value::Mapping(service) = traces_pipeline_patch("tail_sampling") {
            for (key, value) in service {
                patch.insert(key, value);
            }
        }
        Ok(serde_yaml::Value::Mapping(patch))
    }

    async fn restart_collector(&self) -> Result<(), OxnError> {
        self.docker
            .stop_container(OTELCOL_CONTAINER, None::<StopContainerOptions>)
            .await
            .map_err(OrchestrationError::Api)?;
        let mut wait = std::pin::pin!(
            self.docker
                .wait_container(OTELCOL_CONTAINER, None::<WaitContainerOptions<String>>)
        );
        while let Some(status) = wait.next().await {
            if let Err(error) = status {
                tracing::debug!(%error, "wait for collector stop");
                break;
            }
        }
        self.docker
            .start_container(OTELCOL_CONTAINER, None::<StartContainerOptions<String>>)
            .await
            .map_err(OrchestrationError::Api)?;
        Ok(())
    }
}

#[async_trait]
impl Treatment for TailSamplingTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "tail"
    }

    fn treatment_type(&self) -> &'static str {
        "TailSamplingTreatment"
    }

    fn is_runtime(&self) -> bool {
        true
    }

    async fn preconditions(&mut self) -> bool {
        true
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let path = config_str(&self.core.config, "otelcol_extras");
        let patch = self.build_patch()?;
        write_extras(&path, &patch)?;
        self.restart_collector().await?;
        tracing::info!(path, "installed tail sampling policy and restarted collector");
        let duration = config_str(&self.core.config, "duration");
        if !duration.is_empty() {
            sleep(Duration::from_secs_f64(time_string_to_seconds(&duration))).await;
        }
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let path = config_str(&self.core.config, "otelcol_extras");
        write_extras(&path, &self.original_extras)?;
        tracing::info!(path, "restored collector extras file");
        Ok(())
    }

    fn mutated_file(&self) -> Option<PathBuf> {
        Some(PathBuf::from(config_str(&self.core.config, "otelcol_extras")))
    }
}

/// Add a probabilistic sampler processor to the collector config.
#[derive(Debug)]
pub struct ProbabilisticSamplingTreatment {
    core: TreatmentCore,
    original_extras: serde_yaml::Value,
}

impl ProbabilisticSamplingTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "ProbabilisticSamplingTreatment");
        validator
            .require("otelcol_extras", ParamKind::Str)
            .require("percentage", ParamKind::Int)
            .require("seed", ParamKind::Int);
        let mut messages = validator.finish();
        if let Some(percentage) = core.config.get("percentage").and_then(Value::as_i64)
            && !(0..=100).contains(&percentage)
        {
            messages.push(
                "Value for parameter percentage has to be in the range [0, 100] for \
                 ProbabilisticSamplingTreatment"
                    .to_string(),
            );
        }
        if !messages.is_empty() {
            return Err(invalid_config("ProbabilisticSamplingTreatment", name, messages));
        }
        let path = config_str(&core.config, "otelcol_extras");
        let original_extras = read_extras(&path)?;
        Ok(Self {
            core,
            original_extras,
        })
    }
}

#[async_trait]
impl Treatment for ProbabilisticSamplingTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "probl"
    }

    fn treatment_type(&self) -> &'static str {
        "ProbabilisticSamplingTreatment"
    }

    fn is_runtime(&self) -> bool {
        false
    }

    async fn preconditions(&mut self) -> bool {
        true
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let path = config_str(&self.core.config, "otelcol_extras");
        let percentage = self.core.config.get("percentage").and_then(Value::as_i64);
        let seed = self.core.config.get("seed").and_then(Value::as_i64);

        let mut sampler = Mapping::new();
        sampler.insert(
            "hash_seed".into(),
            serde_yaml::Value::from(seed.unwrap_or_default()),
        );
        sampler.insert(
            "sampling_percentage".into(),
            serde_yaml::Value::from(percentage.unwrap_or_default()),
        );
        let mut processors = Mapping::new();
        processors.insert("probabilistic_sampler".into(), serde_yaml::Value::Mapping(sampler));

        // Upsert into the existing extras so unrelated settings survive.
        let mut extras = self.original_extras.clone();
        if let Some(mapping) = extras.as_mapping_mut() {
            mapping.insert("processors".into(), serde_yaml::Value::Mapping(processors));
            if let serde_yaml::Value::Mapping(service) =
                traces_pipeline_patch("probabilistic_sampler")
            {
                for (key, value) in service {
                    mapping.insert(key, value);
                }
            }
        }
        write_extras(&path, &extras)?;
        tracing::info!(path, "installed probabilistic sampler");
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let path = config_str(&self.core.config, "otelcol_extras");
        write_extras(&path, &self.original_extras)?;
        tracing::info!(path, "restored collector extras file");
        Ok(())
    }

    fn mutated_file(&self) -> Option<PathBuf> {
        Some(PathBuf::from(config_str(&self.core.config, "otelcol_extras")))
    }
}
