//! Pause treatment: freeze a container for a duration.

use async_trait::async_trait;
use bollard::Docker;
use serde_json::Value;
use tokio::time::{Duration, sleep};

use crate::error::{OrchestrationError, OxnError};
use crate::treatments::{
    ParamKind, ParamValidator, Treatment, TreatmentCore, config_str, docker_client,
    invalid_config, probe_running,
};
use crate::util::time_string_to_seconds;

#[derive(Debug)]
pub struct PauseTreatment {
    core: TreatmentCore,
    docker: Docker,
    duration_seconds: f64,
}

impl PauseTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "PauseTreatment");
        validator
            .require("service_name", ParamKind::Str)
            .require("duration", ParamKind::Str)
            .duration("duration");
        let messages = validator.finish();
        if !messages.is_empty() {
            return Err(invalid_config("PauseTreatment", name, messages));
        }
        let duration_seconds = core
            .config
            .get("duration")
            .and_then(Value::as_str)
            .map(time_string_to_seconds)
            .unwrap_or_default();
        Ok(Self {
            core,
            docker: docker_client()?,
            duration_seconds,
        })
    }

    fn service(&self) -> String {
        config_str(&self.core.config, "service_name")
    }
}

#[async_trait]
impl Treatment for PauseTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "pause"
    }

    fn treatment_type(&self) -> &'static str {
        "PauseTreatment"
    }

    fn is_runtime(&self) -> bool {
        true
    }

    async fn preconditions(&mut self) -> bool {
        let service = self.service();
        probe_running(&self.docker, &service, "PauseTreatment", &mut self.core.messages).await
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let service = self.service();
        self.docker
            .pause_container(&service)
            .await
            .map_err(OrchestrationError::Api)?;
        tracing::info!(
            service,
            duration_seconds = self.duration_seconds,
            "injected pause into container"
        );
        sleep(Duration::from_secs_f64(self.duration_seconds)).await;
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let service = self.service();
        self.docker
            .unpause_container(&service)
            .await
            .map_err(OrchestrationError::Api)?;
        tracing::debug!(service, "cleaned pause from container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requires_service_and_duration() {
        let err = PauseTreatment::new("pause", &json!({})).expect_err("must fail");
        let rendered = err.to_string();
        assert!(rendered.contains("service_name"));
        assert!(rendered.contains("duration"));
    }

    #[test]
    fn builds_with_valid_params() {
        let treatment = PauseTreatment::new(
            "pause",
            &json!({ "service_name": "frontend", "duration": "30s" }),
        )
        .expect("builds");
        assert_eq!(treatment.duration_seconds, 30.0);
        assert_eq!(treatment.service(), "frontend");
        assert!(treatment.is_runtime());
    }
}
