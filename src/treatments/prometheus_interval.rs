//! Prometheus scrape-interval treatment.
//!
//! Prometheus can hot-reload its configuration on a POST to `/-/reload`, so
//! changing the global scrape interval only needs the config file path and
//! the new interval. The original interval is memorized at transform time
//! and restored on cleanup.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::backends::Prometheus;
use crate::error::OxnError;
use crate::treatments::{
    ParamKind, ParamValidator, Treatment, TreatmentCore, config_str, invalid_config,
};

/// Prometheus duration literals: `1y2w3d4h5m6s7ms` combinations or `0`.
const PROMETHEUS_DURATION_FORMAT: &str =
    r"^(([0-9]+y)?([0-9]+w)?([0-9]+d)?([0-9]+h)?([0-9]+m)?([0-9]+s)?([0-9]+ms)?|0)$";

static PROMETHEUS_DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(PROMETHEUS_DURATION_FORMAT).expect("prometheus duration regex is valid")
});

#[derive(Debug)]
pub struct PrometheusIntervalTreatment {
    core: TreatmentCore,
    prometheus: Prometheus,
    prometheus_yaml: serde_yaml::Value,
    original_interval: String,
}

impl PrometheusIntervalTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "PrometheusIntervalTreatment");
        validator
            .require("prometheus_config", ParamKind::Str)
            .require("interval", ParamKind::Str);
        let mut messages = validator.finish();
        if let Some(interval) = core.config.get("interval").and_then(Value::as_str)
            && !PROMETHEUS_DURATION_REGEX.is_match(interval)
        {
            messages.push(format!(
                "Parameter interval has to match {PROMETHEUS_DURATION_FORMAT} for \
                 PrometheusIntervalTreatment"
            ));
        }
        let config_path = config_str(&core.config, "prometheus_config");
        if !config_path.is_empty() && !std::path::Path::new(&config_path).is_file() {
            messages.push(format!("Prometheus config at {config_path} does not exist"));
        }
        if !messages.is_empty() {
            return Err(invalid_config("PrometheusIntervalTreatment", name, messages));
        }

        // Memorize the original scrape interval for cleanup. Validation has
        // confirmed the file exists.
        let contents = std::fs::read_to_string(&config_path)?;
        let prometheus_yaml: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(|e| {
            OxnError::validation_explained(
                format!("Prometheus config at {config_path} is not valid YAML"),
                e.to_string(),
            )
        })?;
        let original_interval = prometheus_yaml
            .get("global")
            .and_then(|global| global.get("scrape_interval"))
            .and_then(serde_yaml::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                OxnError::validation_explained(
                    format!("Invalid configuration for PrometheusIntervalTreatment(name={name})"),
                    format!("Prometheus config at {config_path} has no global.scrape_interval"),
                )
            })?;

        Ok(Self {
            core,
            prometheus: Prometheus::new(),
            prometheus_yaml,
            original_interval,
        })
    }

    fn write_interval(&mut self, interval: &str) -> Result<(), OxnError> {
        let config_path = config_str(&self.core.config, "prometheus_config");
        if let Some(global) = self
            .prometheus_yaml
            .get_mut("global")
            .and_then(serde_yaml::Value::as_mapping_mut)
        {
            global.insert(
                serde_yaml::Value::String("scrape_interval".into()),
                serde_yaml::Value::String(interval.into()),
            );
        }
        let contents = serde_yaml::to_string(&self.prometheus_yaml).map_err(|e| {
            OxnError::validation_explained(
                format!("Cannot serialize Prometheus config at {config_path}"),
                e.to_string(),
            )
        })?;
        std::fs::write(&config_path, contents)?;
        Ok(())
    }
}

#[async_trait]
impl Treatment for PrometheusIntervalTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "sampling"
    }

    fn treatment_type(&self) -> &'static str {
        "PrometheusIntervalTreatment"
    }

    fn is_runtime(&self) -> bool {
        false
    }

    async fn preconditions(&mut self) -> bool {
        true
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        let interval = config_str(&self.core.config, "interval");
        self.write_interval(&interval)?;
        self.prometheus.reload().await?;
        tracing::info!(interval, "changed Prometheus scrape interval");
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        let original = self.original_interval.clone();
        self.write_interval(&original)?;
        self.prometheus.reload().await?;
        tracing::info!(interval = %original, "restored Prometheus scrape interval");
        Ok(())
    }

    fn mutated_file(&self) -> Option<PathBuf> {
        Some(PathBuf::from(config_str(&self.core.config, "prometheus_config")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_prometheus_config(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("prometheus.yml");
        std::fs::write(
            &path,
            "global:\n  scrape_interval: 30s\n  evaluation_interval: 30s\n",
        )
        .expect("write prometheus config");
        path.to_str().expect("utf-8 path").to_string()
    }

    #[test]
    fn memorizes_the_original_interval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_prometheus_config(&dir);
        let treatment = PrometheusIntervalTreatment::new(
            "sampling",
            &json!({ "prometheus_config": path, "interval": "5s" }),
        )
        .expect("builds");
        assert_eq!(treatment.original_interval, "30s");
        assert!(!treatment.is_runtime());
    }

    #[test]
    fn missing_config_file_fails_validation() {
        let err = PrometheusIntervalTreatment::new(
            "sampling",
            &json!({ "prometheus_config": "/nonexistent/prometheus.yml", "interval": "5s" }),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn rejects_non_prometheus_durations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_prometheus_config(&dir);
        let err = PrometheusIntervalTreatment::new(
            "sampling",
            &json!({ "prometheus_config": path, "interval": "five seconds" }),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn write_interval_round_trips_file_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_prometheus_config(&dir);
        let mut treatment = PrometheusIntervalTreatment::new(
            "sampling",
            &json!({ "prometheus_config": path.clone(), "interval": "5s" }),
        )
        .expect("builds");

        treatment.write_interval("5s").expect("write new interval");
        let contents = std::fs::read_to_string(&path).expect("read config");
        assert!(contents.contains("scrape_interval: 5s"));

        let original = treatment.original_interval.clone();
        treatment.write_interval(&original).expect("restore interval");
        let contents = std::fs::read_to_string(&path).expect("read config");
        assert!(contents.contains("scrape_interval: 30s"));
    }
}
