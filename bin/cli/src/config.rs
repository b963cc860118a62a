//! CLI configuration.
//!
//! Loaded via the `config` crate from `COUNSEL__`-prefixed environment
//! variables, with `__` separating nested keys:
//!
//! ```text
//! COUNSEL__USER_ID=u-42
//! COUNSEL__BACKEND__BASE_URL=https://counsel.example/api/
//! COUNSEL__CONVERSATION__FETCH_CONCURRENCY=8
//! ```
//!
//! See [`ConversationConfig`] and [`HttpBackendConfig`] for the nested keys.

use counsel_conversation::ConversationConfig;
use counsel_core::UserId;
use counsel_http::HttpBackendConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// CLI configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Identity the backend scopes conversations to.
    pub user_id: UserId,

    /// Directory holding the local session cache.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Conversation engine tunables.
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Analysis backend connection.
    #[serde(default)]
    pub backend: HttpBackendConfig,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".counsel")
}

impl CliConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(environment())
    }

    fn from_source(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("COUNSEL")
        .separator("__")
        .try_parsing(true)
}
