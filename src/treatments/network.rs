//! Network fault treatments over netem qdiscs.
//!
//! Delay, loss, and corruption share a shape: install a netem root qdisc on
//! an interface inside the target container, sleep for the treatment
//! duration, and remove the qdisc on cleanup. All of them require `tc`
//! inside the container.

use async_trait::async_trait;
use bollard::Docker;
use serde_json::Value;
use tokio::time::{Duration, sleep};

use crate::error::OxnError;
use crate::treatments::{
    ParamKind, ParamValidator, Treatment, TreatmentCore, config_str, config_str_or,
    docker_client, exec_in_container, invalid_config, probe_tc,
};
use crate::util::time_string_to_seconds;

const DELAY_DISTRIBUTIONS: [&str; 4] = ["uniform", "pareto", "normal", "paretonormal"];

async fn install_netem(
    docker: &Docker,
    service: &str,
    interface: &str,
    netem_args: Vec<String>,
) -> Result<i64, OxnError> {
    let mut command = vec![
        "tc".to_string(),
        "qdisc".to_string(),
        "add".to_string(),
        "dev".to_string(),
        interface.to_string(),
        "root".to_string(),
        "netem".to_string(),
    ];
    command.extend(netem_args);
    exec_in_container(docker, service, command).await
}

async fn remove_netem(docker: &Docker, service: &str, interface: &str) -> Result<i64, OxnError> {
    let command = vec![
        "tc".to_string(),
        "qdisc".to_string(),
        "del".to_string(),
        "dev".to_string(),
        interface.to_string(),
        "root".to_string(),
        "netem".to_string(),
    ];
    exec_in_container(docker, service, command).await
}

/// Inject network delay into a service.
#[derive(Debug)]
pub struct NetworkDelayTreatment {
    core: TreatmentCore,
    docker: Docker,
    duration_seconds: f64,
}

impl NetworkDelayTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "NetworkDelayTreatment");
        validator
            .require("service_name", ParamKind::Str)
            .require("interface", ParamKind::Str)
            .require("duration", ParamKind::Str)
            .require("delay_time", ParamKind::Str)
            .optional("delay_jitter", ParamKind::Str)
            .optional("delay_correlation", ParamKind::Str)
            .optional("delay_distribution", ParamKind::Str)
            .duration("duration")
            .duration("delay_time")
            .duration("delay_jitter")
            .percentage("delay_correlation")
            .one_of("delay_distribution", &DELAY_DISTRIBUTIONS);
        let messages = validator.finish();
        if !messages.is_empty() {
            return Err(invalid_config("NetworkDelayTreatment", name, messages));
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
}

#[async_trait]
impl Treatment for NetworkDelayTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "delay"
    }

    fn treatment_type(&self) -> &'static str {
        "NetworkDelayTreatment"
    }

    fn is_runtime(&self) -> bool {
        true
    }

    async fn preconditions(&mut self) -> bool {
        let service = config_str(&self.core.config, "service_name");
        probe_tc(&self.docker, &service, "NetworkDelayTreatment", &mut self.core.messages).await
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let service = config_str(&self.core.config, "service_name");
        let interface = config_str(&self.core.config, "interface");
        let delay_time = config_str(&self.core.config, "delay_time");
        // Defaults keep the tc invocation uniform across optional params.
        let jitter = config_str_or(&self.core.config, "delay_jitter", "0ms");
        let correlation = config_str_or(&self.core.config, "delay_correlation", "0%");
        let mut netem_args = vec!["delay".to_string(), delay_time, jitter, correlation];
        if let Some(distribution) = self.core.config.get("delay_distribution").and_then(Value::as_str)
        {
            netem_args.push("distribution".to_string());
            netem_args.push(distribution.to_string());
        }
        install_netem(&self.docker, &service, &interface, netem_args).await?;
        tracing::info!(
            service,
            duration_seconds = self.duration_seconds,
            "injected delay into container"
        );
        sleep(Duration::from_secs_f64(self.duration_seconds)).await;
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let service = config_str(&self.core.config, "service_name");
        let interface = config_str_or(&self.core.config, "interface", "eth0");
        remove_netem(&self.docker, &service, &interface).await?;
        tracing::info!(service, "cleaned delay treatment from container");
        Ok(())
    }
}

/// Inject packet loss into a service.
#[derive(Debug)]
pub struct PacketLossTreatment {
    core: TreatmentCore,
    docker: Docker,
    duration_seconds: f64,
}

impl PacketLossTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "PacketLossTreatment");
        validator
            .require("service_name", ParamKind::Str)
            .require("interface", ParamKind::Str)
            .require("duration", ParamKind::Str)
            .require("loss_percentage", ParamKind::Str)
            .duration("duration")
            .percentage("loss_percentage");
        let messages = validator.finish();
        if !messages.is_empty() {
            return Err(invalid_config("PacketLossTreatment", name, messages));
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
}

#[async_trait]
impl Treatment for PacketLossTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "loss"
    }

    fn treatment_type(&self) -> &'static str {
        "PacketLossTreatment"
    }

    fn is_runtime(&self) -> bool {
        true
    }

    async fn preconditions(&mut self) -> bool {
        let service = config_str(&self.core.config, "service_name");
        probe_tc(&self.docker, &service, "PacketLossTreatment", &mut self.core.messages).await
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let service = config_str(&self.core.config, "service_name");
        let interface = config_str(&self.core.config, "interface");
        let percentage = config_str(&self.core.config, "loss_percentage");
        let netem_args = vec!["loss".to_string(), "random".to_string(), percentage];
        let status = install_netem(&self.docker, &service, &interface, netem_args).await?;
        tracing::debug!(
            service,
            status,
            duration_seconds = self.duration_seconds,
            "injected packet loss into container"
        );
        sleep(Duration::from_secs_f64(self.duration_seconds)).await;
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let service = config_str(&self.core.config, "service_name");
        let interface = config_str_or(&self.core.config, "interface", "eth0");
        remove_netem(&self.docker, &service, &interface).await?;
        tracing::info!(service, "cleaned packet loss treatment in container");
        Ok(())
    }
}

/// Inject packet corruption into a service.
#[derive(Debug)]
pub struct CorruptPacketTreatment {
    core: TreatmentCore,
    docker: Docker,
    duration_seconds: f64,
}

impl CorruptPacketTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "CorruptPacketTreatment");
        validator
            .require("service_name", ParamKind::Str)
            .require("interface", ParamKind::Str)
            .require("duration", ParamKind::Str)
            .require("corrupt_percentage", ParamKind::Str)
            .optional("corrupt_correlation", ParamKind::Str)
            .duration("duration")
            .percentage("corrupt_percentage")
            .percentage("corrupt_correlation");
        let messages = validator.finish();
        if !messages.is_empty() {
            return Err(invalid_config("CorruptPacketTreatment", name, messages));
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
}

#[async_trait]
impl Treatment for CorruptPacketTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "corrupt"
    }

    fn treatment_type(&self) -> &'static str {
        "CorruptPacketTreatment"
    }

    fn is_runtime(&self) -> bool {
        true
    }

    async fn preconditions(&mut self) -> bool {
        let service = config_str(&self.core.config, "service_name");
        probe_tc(&self.docker, &service, "CorruptPacketTreatment", &mut self.core.messages).await
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let service = config_str(&self.core.config, "service_name");
        let interface = config_str(&self.core.config, "interface");
        let percentage = config_str(&self.core.config, "corrupt_percentage");
        let correlation = config_str_or(&self.core.config, "corrupt_correlation", "0%");
        let netem_args = vec!["corrupt".to_string(), percentage, correlation];
        install_netem(&self.docker, &service, &interface, netem_args).await?;
        tracing::info!(
            service,
            duration_seconds = self.duration_seconds,
            "injected packet corruption into container"
        );
        sleep(Duration::from_secs_f64(self.duration_seconds)).await;
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let service = config_str(&self.core.config, "service_name");
        let interface = config_str_or(&self.core.config, "interface", "eth0");
        remove_netem(&self.docker, &service, &interface).await?;
        tracing::info!(service, "cleaned corruption treatment from container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delay_requires_core_params() {
        let err = NetworkDelayTreatment::new("delay", &json!({ "service_name": "x" }))
            .expect_err("must fail");
        let rendered = err.to_string();
        assert!(rendered.contains("interface"));
        assert!(rendered.contains("duration"));
        assert!(rendered.contains("delay_time"));
    }

    #[test]
    fn delay_rejects_unknown_distribution() {
        let err = NetworkDelayTreatment::new(
            "delay",
            &json!({
                "service_name": "x",
                "interface": "eth0",
                "duration": "10s",
                "delay_time": "200ms",
                "delay_distribution": "gaussian",
            }),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("delay_distribution"));
    }

    #[test]
    fn delay_accepts_full_config() {
        let treatment = NetworkDelayTreatment::new(
            "delay",
            &json!({
                "service_name": "x",
                "interface": "eth0",
                "duration": "10s",
                "delay_time": "200ms",
                "delay_jitter": "50ms",
                "delay_correlation": "25%",
                "delay_distribution": "pareto",
            }),
        )
        .expect("builds");
        assert_eq!(treatment.duration_seconds, 10.0);
    }

    #[test]
    fn loss_percentage_boundaries() {
        let build = |percentage: &str| {
            PacketLossTreatment::new(
                "loss",
                &json!({
                    "service_name": "x",
                    "interface": "eth0",
                    "duration": "10s",
                    "loss_percentage": percentage,
                }),
            )
        };
        assert!(build("0%").is_err());
        assert!(build("1%").is_ok());
        assert!(build("100%").is_ok());
        assert!(build("101%").is_err());
    }

    #[test]
    fn corrupt_requires_percentage() {
        let err = CorruptPacketTreatment::new(
            "corrupt",
            &json!({
                "service_name": "x",
                "interface": "eth0",
                "duration": "10s",
            }),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("corrupt_percentage"));
    }
}
