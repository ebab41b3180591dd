//! Wrapper around the Prometheus HTTP API.
//!
//! Prometheus takes and returns timestamps as unix seconds (float).

use serde_json::Value;

use crate::backends::{http_client, send_with_retry};
use crate::error::MetricBackendError;

const DEFAULT_BASE_URL: &str = "http://localhost:9090";

/// Client for the Prometheus query and admin endpoints.
#[derive(Debug, Clone)]
pub struct Prometheus {
    client: reqwest::Client,
    base_url: String,
}

impl Default for Prometheus {
    fn default() -> Self {
        Self::new()
    }
}

impl Prometheus {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at a non-default Prometheus instance.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/v1/{endpoint}", self.base_url)
    }

    /// Build a query in the Prometheus query language from a metric name and
    /// an optional label map.
    pub fn build_query(metric_name: &str, labels: &std::collections::BTreeMap<String, String>) -> String {
        if labels.is_empty() {
            return metric_name.to_string();
        }
        let label_string: String = labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\","))
            .collect();
        format!("{metric_name}{{{label_string}}}")
    }

    async fn get(&self, url: String, params: Vec<(&str, String)>) -> Result<Value, MetricBackendError> {
        let request = self.client.get(&url).query(&params);
        let response = send_with_retry(request)
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| MetricBackendError::Request {
                url: url.clone(),
                source,
            })?;
        response
            .json()
            .await
            .map_err(|source| MetricBackendError::Request { url, source })
    }

    /// Evaluate a query over a time range. Timestamps are unix seconds.
    pub async fn range_query(
        &self,
        query: &str,
        start: f64,
        end: f64,
        step: u32,
    ) -> Result<Value, MetricBackendError> {
        let params = vec![
            ("query", query.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("step", step.to_string()),
        ];
        self.get(self.api_url("query_range"), params).await
    }

    /// Evaluate a query instantly.
    pub async fn instant_query(
        &self,
        query: &str,
        time: Option<f64>,
    ) -> Result<Value, MetricBackendError> {
        let mut params = vec![("query", query.to_string())];
        if let Some(time) = time {
            params.push(("time", time.to_string()));
        }
        self.get(self.api_url("query"), params).await
    }

    /// Return all label names known to Prometheus.
    pub async fn labels(&self) -> Result<Value, MetricBackendError> {
        self.get(self.api_url("labels"), Vec::new()).await
    }

    /// Return all values for a given label.
    pub async fn label_values(&self, label: &str) -> Result<Value, MetricBackendError> {
        self.get(self.api_url(&format!("label/{label}/values")), Vec::new())
            .await
    }

    /// Return all metric names known to Prometheus.
    pub async fn metrics(&self) -> Result<Value, MetricBackendError> {
        self.get(self.api_url("label/__name__/values"), Vec::new())
            .await
    }

    /// Return metadata about metrics.
    pub async fn metric_metadata(
        &self,
        metric: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Value, MetricBackendError> {
        let mut params = Vec::new();
        if let Some(metric) = metric {
            params.push(("metric", metric.to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        self.get(self.api_url("metadata"), params).await
    }

    /// Return the current state of target discovery.
    pub async fn targets(&self) -> Result<Value, MetricBackendError> {
        self.get(self.api_url("targets"), Vec::new()).await
    }

    /// Return metric metadata with additional target information.
    pub async fn target_metadata(
        &self,
        match_target: Option<&str>,
        metric: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Value, MetricBackendError> {
        let mut params = Vec::new();
        if let Some(match_target) = match_target {
            params.push(("match_target", match_target.to_string()));
        }
        if let Some(metric) = metric {
            params.push(("metric", metric.to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        self.get(self.api_url("targets/metadata"), params).await
    }

    /// Return the loaded Prometheus configuration.
    pub async fn config(&self) -> Result<Value, MetricBackendError> {
        self.get(self.api_url("status/config"), Vec::new()).await
    }

    /// Return the flag values Prometheus was launched with.
    pub async fn flags(&self) -> Result<Value, MetricBackendError> {
        self.get(self.api_url("status/flags"), Vec::new()).await
    }

    /// Ask Prometheus to hot-reload its configuration.
    pub async fn reload(&self) -> Result<(), MetricBackendError> {
        let url = format!("{}/-/reload", self.base_url);
        send_with_retry(self.client.post(&url))
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| MetricBackendError::Request { url, source })?;
        Ok(())
    }
}
