//! HTTP client configuration.

use serde::Deserialize;
use std::time::Duration;

/// Connection settings for the analysis backend.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpBackendConfig {
    /// Base URL all endpoints are resolved against.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds, including chat answers.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bearer token issued by the identity provider, if the backend requires one.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:8000/api/".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            bearer_token: None,
        }
    }
}

impl HttpBackendConfig {
    /// Returns the per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
