//! Orchestration of the system under experiment.
//!
//! The orchestrator owns the SUE lifecycle as defined by a compose
//! description: it derives the effective service set from the spec's
//! `include`/`exclude` filters, maintains bidirectional service/container
//! name maps, brings the composition up detached, polls for readiness, and
//! tears everything down. Compose-level operations go through the
//! `docker compose` CLI; per-container operations go through the Docker API.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bollard::Docker;
use bollard::container::InspectContainerOptions;
use bollard::models::ContainerStateStatusEnum;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::OrchestrationError;
use crate::spec::ExperimentSpec;

/// Seconds to sleep between readiness polls.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Env variable holding an integer seconds delay before teardown, for manual
/// inspection of the SUE.
pub const OXN_WAIT_ENV: &str = "OXN_WAIT";

#[derive(Debug, Deserialize)]
struct ComposeConfig {
    #[serde(default)]
    name: String,
    #[serde(default)]
    services: HashMap<String, ComposeService>,
}

#[derive(Debug, Deserialize)]
struct ComposeService {
    container_name: Option<String>,
}

/// Container orchestration for building the system under experiment.
pub struct DockerComposeOrchestrator {
    docker: Docker,
    compose_file: PathBuf,
    service_names: BTreeSet<String>,
    sue_service_names: Vec<String>,
    service_container: HashMap<String, String>,
    container_service: HashMap<String, String>,
}

impl DockerComposeOrchestrator {
    /// Validate the sue section of the spec and build the orchestrator.
    ///
    /// All validation failures (missing compose file, unparseable compose
    /// file, unknown include/exclude names) are accumulated and surfaced in
    /// one error.
    pub async fn new(spec: &ExperimentSpec) -> Result<Self, OrchestrationError> {
        let sue = &spec.experiment.sue;
        let compose_file = PathBuf::from(&sue.compose);

        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| OrchestrationError::Connection(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| OrchestrationError::Connection(e.to_string()))?;

        let mut messages = Vec::new();
        let mut config = None;
        if !compose_file.is_file() {
            messages.push("Specified compose file does not exist".to_string());
        } else {
            match compose_config(&compose_file).await {
                Ok(parsed) => config = Some(parsed),
                Err(explanation) => {
                    messages.push(format!("Specified compose file has invalid format: {explanation}"));
                }
            }
        }

        if let Some(config) = &config {
            for service_name in &sue.include {
                if !config.services.contains_key(service_name) {
                    messages.push(format!(
                        "Included service {service_name} does not exist in the compose file"
                    ));
                }
            }
            for service_name in &sue.exclude {
                if !config.services.contains_key(service_name) {
                    messages.push(format!(
                        "Excluded service {service_name} does not exist in the compose file"
                    ));
                }
            }
        }

        if !messages.is_empty() {
            return Err(OrchestrationError::Validation {
                explanation: messages.join("\n"),
            });
        }
        let config = config.expect("validated above");

        let mut service_names = BTreeSet::new();
        let mut service_container = HashMap::new();
        let mut container_service = HashMap::new();
        for (service_name, service) in &config.services {
            // Compose names unnamed containers <project>-<service>-1.
            let container_name = service
                .container_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}-1", config.name, service_name));
            service_names.insert(service_name.clone());
            service_container.insert(service_name.clone(), container_name.clone());
            container_service.insert(container_name, service_name.clone());
        }

        let sue_service_names =
            effective_service_set(&service_names, &sue.include, &sue.exclude);

        Ok(Self {
            docker,
            compose_file,
            service_names,
            sue_service_names,
            service_container,
            container_service,
        })
    }

    /// All service names defined in the compose file.
    pub fn service_names(&self) -> &BTreeSet<String> {
        &self.service_names
    }

    /// The effective service set the experiment runs against.
    pub fn sue_service_names(&self) -> &[String] {
        &self.sue_service_names
    }

    /// Translate compose service names to container names. Unmapped names
    /// translate to `None`; callers must tolerate.
    pub fn translate_compose_names(&self, compose_names: &[String]) -> Vec<Option<String>> {
        compose_names
            .iter()
            .map(|name| self.service_container.get(name).cloned())
            .collect()
    }

    /// Translate container names back to compose service names.
    pub fn translate_container_names(&self, container_names: &[String]) -> Vec<Option<String>> {
        container_names
            .iter()
            .map(|name| self.container_service.get(name).cloned())
            .collect()
    }

    /// Bring up exactly the effective service set, detached.
    pub async fn orchestrate(&self) -> Result<(), OrchestrationError> {
        let mut command = Command::new("docker");
        command
            .arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .arg("up")
            .arg("--detach");
        for service in &self.sue_service_names {
            command.arg(service);
        }
        run_compose_command(command, "up").await
    }

    /// Poll each container of the effective set until every one reports
    /// state "running", or the timeout elapses.
    ///
    /// "running" does not imply application-level readiness; the engine
    /// compensates through the left observation window wait.
    pub async fn ready(&self, timeout: Duration) -> Result<bool, OrchestrationError> {
        for service_name in &self.sue_service_names {
            let container_name = self
                .service_container
                .get(service_name)
                .cloned()
                .ok_or_else(|| OrchestrationError::MissingContainer {
                    container: service_name.clone(),
                })?;
            let mut elapsed = Duration::ZERO;
            loop {
                if self.container_running(&container_name).await? {
                    tracing::debug!(container = %container_name, "container is running");
                    break;
                }
                if elapsed >= timeout {
                    tracing::warn!(container = %container_name, ?timeout, "container not running within timeout");
                    return Ok(false);
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
                elapsed += READY_POLL_INTERVAL;
            }
        }
        Ok(true)
    }

    async fn container_running(&self, container_name: &str) -> Result<bool, OrchestrationError> {
        let inspection = self
            .docker
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await
            .map_err(|error| match error {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => OrchestrationError::MissingContainer {
                    container: container_name.to_string(),
                },
                other => OrchestrationError::Api(other),
            })?;
        let status = inspection.state.and_then(|state| state.status);
        Ok(status == Some(ContainerStateStatusEnum::RUNNING))
    }

    /// Tear the composition down and remove orphans. Idempotent.
    ///
    /// Honors `OXN_WAIT` (integer seconds) as a pre-teardown delay for
    /// manual inspection.
    pub async fn teardown(&self) -> Result<(), OrchestrationError> {
        if let Ok(value) = std::env::var(OXN_WAIT_ENV)
            && let Ok(seconds) = value.parse::<u64>()
        {
            tracing::info!(seconds, "delaying teardown per {}", OXN_WAIT_ENV);
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
        let mut command = Command::new("docker");
        command
            .arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .arg("down")
            .arg("--remove-orphans");
        run_compose_command(command, "down").await
    }
}

/// Compute the effective service set from include/exclude filters.
///
/// Exclusions are removed first; a non-empty include list then intersects.
pub fn effective_service_set(
    services: &BTreeSet<String>,
    include: &[String],
    exclude: &[String],
) -> Vec<String> {
    services
        .iter()
        .filter(|service| !exclude.contains(service))
        .filter(|service| include.is_empty() || include.contains(service))
        .cloned()
        .collect()
}

async fn compose_config(compose_file: &Path) -> Result<ComposeConfig, String> {
    let output = Command::new("docker")
        .arg("compose")
        .arg("-f")
        .arg(compose_file)
        .arg("config")
        .arg("--format")
        .arg("json")
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    serde_json::from_slice(&output.stdout).map_err(|e| e.to_string())
}

async fn run_compose_command(
    mut command: Command,
    operation: &str,
) -> Result<(), OrchestrationError> {
    let output = command
        .output()
        .await
        .map_err(|e| OrchestrationError::ComposeCommand {
            explanation: format!("docker compose {operation}: {e}"),
        })?;
    if !output.status.success() {
        return Err(OrchestrationError::ComposeCommand {
            explanation: format!(
                "docker compose {operation}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}
