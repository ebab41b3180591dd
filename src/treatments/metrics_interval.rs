//! Metrics export interval treatment.
//!
//! Sets `OTEL_METRIC_EXPORT_INTERVAL` (milliseconds) in the compose
//! `environment` list of a service before the SUE is built. The compose file
//! contents are memorized at construction and restored byte-for-byte from
//! the parsed document on cleanup.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::OxnError;
use crate::treatments::{
    ParamKind, ParamValidator, Treatment, TreatmentCore, config_str, invalid_config,
};
use crate::util::{add_env_variable, time_string_to_seconds, to_milliseconds};

const EXPORT_INTERVAL_VAR: &str = "OTEL_METRIC_EXPORT_INTERVAL";

#[derive(Debug)]
pub struct MetricsExportIntervalTreatment {
    core: TreatmentCore,
    interval_ms: u64,
    original_compose: String,
}

impl MetricsExportIntervalTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "MetricsExportIntervalTreatment");
        validator
            .require("compose_file", ParamKind::Str)
            .require("service_name", ParamKind::Str)
            .require("interval", ParamKind::Str)
            .duration("interval");
        let messages = validator.finish();
        if !messages.is_empty() {
            return Err(invalid_config("MetricsExportIntervalTreatment", name, messages));
        }
        let interval = config_str(&core.config, "interval");
        let interval_ms = to_milliseconds(time_string_to_seconds(&interval)) as u64;
        let compose_file = config_str(&core.config, "compose_file");
        let original_compose = std::fs::read_to_string(&compose_file)?;
        Ok(Self {
            core,
            interval_ms,
            original_compose,
        })
    }
}

#[async_trait]
impl Treatment for MetricsExportIntervalTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "otel_metrics_interval"
    }

    fn treatment_type(&self) -> &'static str {
        "MetricsExportIntervalTreatment"
    }

    fn is_runtime(&self) -> bool {
        false
    }

    async fn preconditions(&mut self) -> bool {
        true
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let compose_file = config_str(&self.core.config, "compose_file");
        let service = config_str(&self.core.config, "service_name");
        add_env_variable(
            &compose_file,
            &service,
            EXPORT_INTERVAL_VAR,
            &self.interval_ms.to_string(),
        )?;
        tracing::info!(
            service,
            interval_ms = self.interval_ms,
            "set metrics export interval in compose file"
        );
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let compose_file = config_str(&self.core.config, "compose_file");
        std::fs::write(&compose_file, &self.original_compose)?;
        tracing::info!(compose_file, "restored compose file");
        Ok(())
    }

    fn mutated_file(&self) -> Option<PathBuf> {
        Some(PathBuf::from(config_str(&self.core.config, "compose_file")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_compose(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("compose.yml");
        std::fs::write(
            &path,
            "services:\n  frontend:\n    image: frontend:latest\n",
        )
        .expect("write compose");
        path.to_str().expect("utf-8 path").to_string()
    }

    #[test]
    fn converts_the_interval_to_milliseconds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_compose(&dir);
        let treatment = MetricsExportIntervalTreatment::new(
            "interval",
            &json!({ "compose_file": path, "service_name": "frontend", "interval": "5s" }),
        )
        .expect("builds");
        assert_eq!(treatment.interval_ms, 5000);
        assert!(!treatment.is_runtime());
    }

    #[tokio::test]
    async fn inject_then_clean_restores_the_compose_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_compose(&dir);
        let before = std::fs::read_to_string(&path).expect("read compose");

        let mut treatment = MetricsExportIntervalTreatment::new(
            "interval",
            &json!({ "compose_file": path.clone(), "service_name": "frontend", "interval": "1s" }),
        )
        .expect("builds");

        treatment.inject().await.expect("inject");
        let mutated = std::fs::read_to_string(&path).expect("read compose");
        assert!(mutated.contains("OTEL_METRIC_EXPORT_INTERVAL=1000"));

        treatment.clean().await.expect("clean");
        let after = std::fs::read_to_string(&path).expect("read compose");
        assert_eq!(after, before);
    }

    #[test]
    fn missing_params_accumulate_messages() {
        let err = MetricsExportIntervalTreatment::new("interval", &json!({}))
            .expect_err("must fail");
        let rendered = err.to_string();
        assert!(rendered.contains("compose_file"));
        assert!(rendered.contains("service_name"));
        assert!(rendered.contains("interval"));
    }
}
