//! Kill treatment: kill a container, restart it on cleanup.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{KillContainerOptions, RestartContainerOptions};
use serde_json::Value;
use tokio::time::{Duration, sleep};

use crate::error::{OrchestrationError, OxnError};
use crate::treatments::{
    ParamKind, ParamValidator, Treatment, TreatmentCore, config_str, docker_client,
    invalid_config, probe_running,
};
use crate::util::time_string_to_seconds;

#[derive(Debug)]
pub struct KillTreatment {
    core: TreatmentCore,
    docker: Docker,
    duration_seconds: f64,
}

impl KillTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "KillTreatment");
        validator
            .require("service_name", ParamKind::Str)
            .optional("duration", ParamKind::Str)
            .duration("duration");
        let messages = validator.finish();
        if !messages.is_empty() {
            return Err(invalid_config("KillTreatment", name, messages));
        }
        // A missing duration means kill-and-restart immediately.
        let duration_seconds = core
            .config
            .get("duration")
            .and_then(Value::as_str)
            .map(time_string_to_seconds)
            .unwrap_or(0.0);
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
impl Treatment for KillTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "kill"
    }

    fn treatment_type(&self) -> &'static str {
        "KillTreatment"
    }

    fn is_runtime(&self) -> bool {
        true
    }

    async fn preconditions(&mut self) -> bool {
        let service = self.service();
        probe_running(&self.docker, &service, "KillTreatment", &mut self.core.messages).await
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let service = self.service();
        self.docker
            .kill_container(&service, None::<KillContainerOptions<String>>)
            .await
            .map_err(OrchestrationError::Api)?;
        tracing::debug!(
            service,
            duration_seconds = self.duration_seconds,
            "killed container"
        );
        sleep(Duration::from_secs_f64(self.duration_seconds)).await;
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let service = self.service();
        self.docker
            .restart_container(&service, None::<RestartContainerOptions>)
            .await
            .map_err(OrchestrationError::Api)?;
        tracing::debug!(service, "restarted container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duration_defaults_to_zero() {
        let treatment =
            KillTreatment::new("kill", &json!({ "service_name": "frontend" })).expect("builds");
        assert_eq!(treatment.duration_seconds, 0.0);
    }

    #[test]
    fn requires_a_service_name() {
        let err = KillTreatment::new("kill", &json!({ "duration": "10s" })).expect_err("must fail");
        assert!(err.to_string().contains("service_name"));
    }
}
