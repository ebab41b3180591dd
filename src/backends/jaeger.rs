//! Wrapper around the internal Jaeger HTTP query API.
//!
//! Jaeger's wire format carries timestamps as microseconds since the unix
//! epoch, UTC.

use serde_json::Value;

use crate::backends::{http_client, send_with_retry};
use crate::error::TraceBackendError;

const DEFAULT_BASE_URL: &str = "http://localhost:8080/jaeger/ui/api";

/// Client for the undocumented Jaeger query endpoints.
#[derive(Debug, Clone)]
pub struct Jaeger {
    client: reqwest::Client,
    base_url: String,
}

impl Default for Jaeger {
    fn default() -> Self {
        Self::new()
    }
}

impl Jaeger {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at a non-default Jaeger instance.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    async fn get(&self, url: String, params: Vec<(&str, String)>) -> Result<Value, TraceBackendError> {
        let request = self.client.get(&url).query(&params);
        let response = send_with_retry(request)
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| TraceBackendError::Request {
                url: url.clone(),
                source,
            })?;
        response
            .json()
            .await
            .map_err(|source| TraceBackendError::Request { url, source })
    }

    /// Return all service names Jaeger has seen traces for.
    pub async fn services(&self) -> Result<Vec<String>, TraceBackendError> {
        let response = self.get(self.url("services"), Vec::new()).await?;
        let data = response
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| TraceBackendError::Shape {
                explanation: "services response is missing the data array".to_string(),
            })?;
        Ok(data
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    /// Search traces for a service. Timestamps are microseconds.
    pub async fn search_traces(
        &self,
        service_name: &str,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Value, TraceBackendError> {
        let params = vec![
            ("service", service_name.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("limit", limit.to_string()),
        ];
        self.get(self.url("traces"), params).await
    }

    /// Return all operations for a service.
    pub async fn service_operations(&self, service: &str) -> Result<Value, TraceBackendError> {
        self.get(self.url(&format!("services/{service}/operations")), Vec::new())
            .await
    }

    /// Return the service dependency graph.
    pub async fn dependencies(
        &self,
        end_timestamp: i64,
        lookback: i64,
    ) -> Result<Value, TraceBackendError> {
        let params = vec![
            ("endTs", end_timestamp.to_string()),
            ("lookback", lookback.to_string()),
        ];
        self.get(self.url("dependencies"), params).await
    }

    /// Fetch a single trace by id.
    pub async fn trace(&self, trace_id: &str) -> Result<Value, TraceBackendError> {
        self.get(self.url(&format!("traces/{trace_id}")), Vec::new())
            .await
    }
}
