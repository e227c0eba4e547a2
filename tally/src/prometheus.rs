//! Prometheus-compatible metrics backend.
//!
//! Integrates a rate expression over a range by evaluating an instant query
//! at the range's end:
//!
//! ```text
//! sum_over_time((<query>)[<range>s:<step>s]) * <step>
//! ```
//!
//! The subquery samples the rate every `step` seconds across the range, and
//! multiplying the sum by `step` approximates the integral. Each returned
//! series becomes one [`UsageSample`].
//!
//! This module is only available when the `prometheus` feature is enabled.
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::TimeDelta;
//! use tally::meter::{Meter, MeterRequest};
//! use tally::prometheus::{PrometheusBackend, PrometheusConfig};
//! use tally::Range;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PrometheusConfig::new("http://localhost:9090");
//! let meter = Meter::new(Box::new(PrometheusBackend::new(config)?));
//! let range = Range::from_unix_secs(1_700_000_000, 1_700_003_600)?;
//! let records = meter.run(&MeterRequest::new(
//!     "sum by (pod) (rate(container_cpu_usage_seconds_total[5m]))",
//!     "tenant-a",
//!     range,
//!     TimeDelta::minutes(10),
//! ))?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::error::BackendError;
use crate::meter::{UsageBackend, UsageSample};
use crate::range::Range;

/// Connection settings for a Prometheus HTTP API.
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Base URL of the server, e.g. `http://localhost:9090`.
    pub endpoint: String,
    /// HTTP timeout per query.
    pub timeout: Duration,
    /// Sampling step of the integration subquery.
    pub step: TimeDelta,
    /// Extra HTTP headers (e.g., for authentication).
    pub headers: Vec<(String, String)>,
}

impl PrometheusConfig {
    /// Creates a config with sensible defaults.
    ///
    /// Defaults: 30s timeout, 60s integration step.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            step: TimeDelta::seconds(60),
            headers: Vec::new(),
        }
    }

    /// Adds an HTTP header (e.g., for authentication tokens).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the integration step.
    #[must_use]
    pub fn with_step(mut self, step: TimeDelta) -> Self {
        self.step = step;
        self
    }

    fn query_url(&self) -> String {
        format!("{}/api/v1/query", self.endpoint.trim_end_matches('/'))
    }
}

/// A [`UsageBackend`] querying the Prometheus HTTP API.
#[derive(Debug)]
pub struct PrometheusBackend {
    config: PrometheusConfig,
    client: reqwest::blocking::Client,
}

impl PrometheusBackend {
    /// Creates a backend with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: PrometheusConfig) -> Result<Self, BackendError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Transport {
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }
}

impl UsageBackend for PrometheusBackend {
    fn integrate(&self, query: &str, range: &Range) -> Result<Vec<UsageSample>, BackendError> {
        let expr = integration_query(query, range, self.config.step)?;
        let time = range.end().timestamp().to_string();

        let mut request = self
            .client
            .get(self.config.query_url())
            .query(&[("query", expr.as_str()), ("time", time.as_str())]);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        let response = request.send().map_err(|e| BackendError::Transport {
            reason: e.to_string(),
        })?;
        let status = response.status();
        let body = response.text().map_err(|e| BackendError::Transport {
            reason: format!("failed to read response body: {e}"),
        })?;

        tracing::debug!(query = %expr, status = status.as_u16(), "prometheus query");
        decode_response(status.as_u16(), &body)
    }
}

/// Builds the integration expression for `query` over `range`.
///
/// The step is clamped to `[1s, range]`.
///
/// # Errors
///
/// Returns [`BackendError::UnsupportedRange`] unless `range` starts and ends
/// on whole seconds and is at least one second long. Subquery windows are
/// whole seconds, so any other range would be integrated over a different
/// span than requested.
pub fn integration_query(
    query: &str,
    range: &Range,
    step: TimeDelta,
) -> Result<String, BackendError> {
    let unsupported = |reason: &str| BackendError::UnsupportedRange {
        range: *range,
        reason: reason.to_string(),
    };
    if !range.is_whole_seconds() {
        return Err(unsupported("bounds are not whole seconds"));
    }
    let range_secs = range.duration().num_seconds();
    if range_secs <= 0 {
        return Err(unsupported("range is shorter than one second"));
    }
    let step_secs = step.num_seconds().clamp(1, range_secs);
    Ok(format!(
        "sum_over_time(({query})[{range_secs}s:{step_secs}s]) * {step_secs}"
    ))
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    data: Option<ApiData>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum ApiData {
    Vector(Vec<VectorSample>),
    Scalar((f64, String)),
    Matrix(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

/// Decodes a query API response body into usage samples.
///
/// # Errors
///
/// - [`BackendError::Query`] when the API reports `status: error`
/// - [`BackendError::HttpStatus`] for non-2xx responses without an API error
/// - [`BackendError::Decode`] for malformed bodies, non-finite values, or
///   result types other than vector and scalar
pub fn decode_response(status: u16, body: &str) -> Result<Vec<UsageSample>, BackendError> {
    let parsed: ApiResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) if !(200..300).contains(&status) => {
            return Err(BackendError::HttpStatus {
                status,
                body: body.to_string(),
            });
        }
        Err(e) => {
            return Err(BackendError::Decode {
                reason: e.to_string(),
            });
        }
    };

    if parsed.status != "success" {
        return Err(BackendError::Query {
            error_type: parsed.error_type.unwrap_or_else(|| "unknown".to_string()),
            message: parsed.error.unwrap_or_default(),
        });
    }
    if !(200..300).contains(&status) {
        return Err(BackendError::HttpStatus {
            status,
            body: body.to_string(),
        });
    }

    match parsed.data {
        Some(ApiData::Vector(samples)) => samples
            .into_iter()
            .map(|sample| {
                let mut labels = sample.metric;
                labels.remove("__name__");
                Ok(UsageSample {
                    labels,
                    amount: parse_value(&sample.value.1)?,
                })
            })
            .collect(),
        Some(ApiData::Scalar((_, value))) => Ok(vec![UsageSample::new(parse_value(&value)?)]),
        Some(ApiData::Matrix(_) | ApiData::String(_)) => Err(BackendError::Decode {
            reason: "expected a vector or scalar result".to_string(),
        }),
        None => Err(BackendError::Decode {
            reason: "response has no data".to_string(),
        }),
    }
}

fn parse_value(value: &str) -> Result<f64, BackendError> {
    let amount: f64 = value.parse().map_err(|_| BackendError::Decode {
        reason: format!("sample value {value:?} is not a number"),
    })?;
    if !amount.is_finite() {
        return Err(BackendError::Decode {
            reason: format!("sample value {value:?} is not finite"),
        });
    }
    Ok(amount)
}
