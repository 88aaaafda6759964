//! Process configuration read from the environment at startup

use std::time::Duration;

/// Environment variable names
const ENV_DATABASE_URL: &str = "SPINE_DATABASE_URL";
const ENV_SOURCE_API_KEY: &str = "SPINE_SOURCE_API_KEY";
const ENV_RATE_LIMIT_SLEEP_MS: &str = "SPINE_RATE_LIMIT_SLEEP_MS";

/// Configuration handed to the dispatcher and schedulers
///
/// Environment variables are read once at startup; nothing else in the core
/// touches the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct SpineConfig {
    /// Storage backend URL (e.g. `sqlite://spine.db`, `sqlite::memory:`)
    pub database_url: String,

    /// API key for upstream data sources, when a domain source needs one
    pub source_api_key: Option<String>,

    /// Sleep between consecutive upstream calls (rate limiting)
    pub rate_limit_sleep: Duration,
}

impl Default for SpineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://spine.db".to_string(),
            source_api_key: None,
            rate_limit_sleep: Duration::from_millis(1000),
        }
    }
}

impl SpineConfig {
    /// Load configuration from the environment (and `.env` if present)
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let rate_limit_sleep = std::env::var(ENV_RATE_LIMIT_SLEEP_MS)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.rate_limit_sleep);

        Self {
            database_url: std::env::var(ENV_DATABASE_URL).unwrap_or(defaults.database_url),
            source_api_key: std::env::var(ENV_SOURCE_API_KEY).ok(),
            rate_limit_sleep,
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }
}
