//! Stress treatment: run stress-ng inside a container.
//!
//! stress-ng is invoked synchronously with `--timeout` and exits on its own,
//! so the treatment is classified compile-time and cleanup is a no-op.

use async_trait::async_trait;
use bollard::Docker;
use serde_json::Value;

use crate::error::OxnError;
use crate::treatments::{
    ParamKind, ParamValidator, Treatment, TreatmentCore, config_str, docker_client,
    exec_in_container, invalid_config,
};

#[derive(Debug)]
pub struct StressTreatment {
    core: TreatmentCore,
    docker: Docker,
    stressors: Vec<(String, String)>,
}

impl StressTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "StressTreatment");
        validator
            .require("service_name", ParamKind::Str)
            .require("duration", ParamKind::Str)
            .require("stressors", ParamKind::Map)
            .duration("duration");
        let mut messages = validator.finish();
        if core
            .config
            .get("stressors")
            .and_then(Value::as_object)
            .is_some_and(serde_json::Map::is_empty)
        {
            messages.push(
                "Parameter stressors has to have at least one stressor for StressTreatment"
                    .to_string(),
            );
        }
        if !messages.is_empty() {
            return Err(invalid_config("StressTreatment", name, messages));
        }
        // Prefix stressor names with -- so they can be passed to stress-ng
        // directly.
        let stressors = core
            .config
            .get("stressors")
            .and_then(Value::as_object)
            .map(|stressors| {
                stressors
                    .iter()
                    .map(|(stressor, count)| {
                        let count = match count {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (format!("--{stressor}"), count)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            core,
            docker: docker_client()?,
            stressors,
        })
    }

    fn build_command(&self) -> Vec<String> {
        let mut command = vec!["stress-ng".to_string()];
        for (stressor, count) in &self.stressors {
            command.push(stressor.clone());
            command.push(count.clone());
        }
        command.push("--timeout".to_string());
        command.push(config_str(&self.core.config, "duration"));
        command
    }
}

#[async_trait]
impl Treatment for StressTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "stress"
    }

    fn treatment_type(&self) -> &'static str {
        "StressTreatment"
    }

    fn is_runtime(&self) -> bool {
        false
    }

    async fn preconditions(&mut self) -> bool {
        let service = config_str(&self.core.config, "service_name");
        let command = vec!["stress-ng".to_string(), "--version".to_string()];
        match exec_in_container(&self.docker, &service, command).await {
            Ok(0) => true,
            Ok(status) => {
                tracing::debug!(service, status, "probed container for stress-ng");
                self.core.messages.push(format!(
                    "Container {service} does not have stress-ng installed which is required \
                     for StressTreatment."
                ));
                false
            }
            Err(error) => {
                self.core
                    .messages
                    .push(format!("Can't probe container {service}: {error}"));
                false
            }
        }
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let service = config_str(&self.core.config, "service_name");
        let command = self.build_command();
        let status = exec_in_container(&self.docker, &service, command).await?;
        tracing::debug!(service, status, "stress-ng terminated in container");
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        // stress-ng cleans up after itself
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_empty_stressor_map() {
        let err = StressTreatment::new(
            "stress",
            &json!({ "service_name": "x", "duration": "30s", "stressors": {} }),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("at least one stressor"));
    }

    #[test]
    fn builds_the_stress_ng_command() {
        let treatment = StressTreatment::new(
            "stress",
            &json!({
                "service_name": "x",
                "duration": "30s",
                "stressors": { "cpu": 4 },
            }),
        )
        .expect("builds");
        assert_eq!(
            treatment.build_command(),
            vec!["stress-ng", "--cpu", "4", "--timeout", "30s"]
        );
        assert!(!treatment.is_runtime());
    }
}
