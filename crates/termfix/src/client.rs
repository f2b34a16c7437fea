//! HTTP client for the remote fix-analysis service.
//!
//! One logical operation: send a problem description plus structured
//! context to `POST /agent/analyze` and get back free-form remediation
//! text. The response is opaque here - parsing it into a patch or a fix
//! command is the remediation engine's concern.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration for the fix service client.
#[derive(Debug, Clone)]
pub struct FixServiceConfig {
    /// Base URL of the service (scheme optional, normalized on build)
    pub base_url: String,
    /// Bearer token, if the deployment requires one
    pub token: Option<String>,
    /// Timeout for file-patch analysis requests
    pub patch_timeout: Duration,
    /// Timeout for fix-command analysis requests
    pub command_timeout: Duration,
}

impl Default for FixServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            token: None,
            patch_timeout: Duration::from_secs(180),
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// Errors from the fix service.
#[derive(Debug, Error)]
pub enum FixServiceError {
    #[error("fix service timed out")]
    Timeout,
    #[error("fix service returned {status}: {detail}")]
    Service { status: u16, detail: String },
    #[error("fix service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

impl FixServiceError {
    /// Timeouts and service-side failures degrade to the static fallback;
    /// they are expected operational conditions, not bugs.
    #[must_use]
    pub fn is_degradable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Service { .. }) || {
            if let Self::Transport(e) = self {
                e.is_timeout() || e.is_connect()
            } else {
                false
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    problem_description: &'a str,
    context: serde_json::Value,
    auto_apply: bool,
}

/// Response from the analyze endpoint.
#[derive(Debug, Deserialize)]
pub struct AnalyzeResponse {
    /// Free-form remediation text
    pub analysis: String,
    /// Whether the service fell back to a secondary model
    #[serde(default)]
    pub fallback: bool,
    /// Model that produced the analysis
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// Client for the remote fix-analysis service.
pub struct FixClient {
    http: reqwest::Client,
    config: FixServiceConfig,
}

impl FixClient {
    /// Create a client. Per-request timeouts are applied at call sites
    /// since the patch and command branches use different budgets.
    #[must_use]
    pub fn new(mut config: FixServiceConfig) -> Self {
        config.base_url = normalize_base_url(&config.base_url);
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Ask the service to analyze a problem.
    ///
    /// # Errors
    /// Returns `Timeout` when the budget elapses, `Service` for non-2xx
    /// responses (with the `detail` body when present), and `Transport`
    /// for connection-level failures.
    pub async fn analyze(
        &self,
        problem_description: &str,
        context: serde_json::Value,
        timeout: Duration,
    ) -> Result<AnalyzeResponse, FixServiceError> {
        let url = format!("{}/agent/analyze", self.config.base_url);
        debug!(url = %url, timeout_secs = timeout.as_secs(), "Requesting fix analysis");

        let mut request = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&AnalyzeRequest {
                problem_description,
                context,
                auto_apply: false,
            });
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FixServiceError::Timeout
            } else {
                FixServiceError::Transport(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.detail)
                .unwrap_or_else(|_| "no detail provided".to_string());
            return Err(FixServiceError::Service {
                status: status.as_u16(),
                detail,
            });
        }

        let parsed = response.json::<AnalyzeResponse>().await?;
        debug!(
            model = %parsed.model,
            fallback = parsed.fallback,
            "Fix analysis received"
        );
        Ok(parsed)
    }

    /// Timeout budget for whole-file patch requests.
    #[must_use]
    pub fn patch_timeout(&self) -> Duration {
        self.config.patch_timeout
    }

    /// Timeout budget for fix-command requests.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout
    }
}

/// Normalize a service URL: default the scheme to https and strip any
/// trailing slash so path joins stay predictable.
#[must_use]
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> FixServiceConfig {
        FixServiceConfig {
            base_url: base_url.to_string(),
            token: None,
            patch_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("api.example.com"), "https://api.example.com");
        assert_eq!(normalize_base_url("https://api.example.com/"), "https://api.example.com");
        assert_eq!(normalize_base_url("http://localhost:8000/"), "http://localhost:8000");
    }

    #[tokio::test]
    async fn test_analyze_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/analyze"))
            .and(body_partial_json(serde_json::json!({ "auto_apply": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "analysis": "pip install opencv-python",
                "fallback": false,
                "model": "primary"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = FixClient::new(config(&server.uri()));
        let response = client
            .analyze(
                "fix this",
                serde_json::json!({ "error_type": "module_not_found" }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(response.analysis, "pip install opencv-python");
        assert!(!response.fallback);
    }

    #[tokio::test]
    async fn test_analyze_service_error_carries_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/analyze"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(serde_json::json!({ "detail": "model overloaded" })),
            )
            .mount(&server)
            .await;

        let client = FixClient::new(config(&server.uri()));
        let err = client
            .analyze("fix this", serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            FixServiceError::Service { status, detail } => {
                assert_eq!(status, 500);
                assert_eq!(detail, "model overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(client
            .analyze("fix this", serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err()
            .is_degradable());
    }

    #[tokio::test]
    async fn test_analyze_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/analyze"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "analysis": "late" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client = FixClient::new(config(&server.uri()));
        let err = client
            .analyze("fix this", serde_json::json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, FixServiceError::Timeout));
        assert!(err.is_degradable());
    }
}
