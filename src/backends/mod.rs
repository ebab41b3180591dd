//! HTTP clients for the telemetry backends.
//!
//! Thin `reqwest` wrappers around the Prometheus and Jaeger HTTP APIs. Both
//! clients share one retry policy: fixed 100 ms backoff, up to 5 retries, on
//! connection failures and the 500/502/503/504 server errors.

pub mod jaeger;
pub mod prometheus;

pub use jaeger::Jaeger;
pub use prometheus::Prometheus;

use std::time::Duration;

const RETRY_STATUS: [u16; 4] = [500, 502, 503, 504];
const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RETRIES: u32 = 5;

/// Send a request, retrying transient failures under the shared policy.
///
/// The builder must be clonable, which holds for every request these clients
/// issue (query-string GETs and bodyless POSTs).
pub(crate) async fn send_with_retry(
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut attempt = 0;
    loop {
        let request = builder
            .try_clone()
            .expect("backend requests carry no streaming body");
        match request.send().await {
            Ok(response)
                if RETRY_STATUS.contains(&response.status().as_u16())
                    && attempt < MAX_RETRIES =>
            {
                tracing::debug!(status = %response.status(), attempt, "retrying backend request");
            }
            Ok(response) => return Ok(response),
            Err(error) if error.is_connect() && attempt < MAX_RETRIES => {
                tracing::debug!(%error, attempt, "retrying backend request after connect error");
            }
            Err(error) => return Err(error),
        }
        attempt += 1;
        tokio::time::sleep(RETRY_BACKOFF).await;
    }
}

/// Build the shared reqwest client for a backend wrapper.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("failed to create HTTP client")
}
