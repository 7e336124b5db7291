//! ODM configuration

use crate::connection::PoolConfig;

/// Comma-separated connection URLs, one per connection index
pub const ENV_MONGODB_URLS: &str = "TESSERA_MONGODB_URLS";
/// `1`/`true` turns on query logging at info level for every model
pub const ENV_ENABLE_LOGS: &str = "TESSERA_ENABLE_LOGS";

#[derive(Debug, Clone, Default)]
pub struct OdmConfig {
    /// Connection URLs by index, used by [`crate::Odm::connect_configured`]
    pub connection_urls: Vec<String>,
    /// Log every executed query at info level instead of trace
    pub enable_logs: bool,
    pub pool: PoolConfig,
}

impl OdmConfig {
    /// Read configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let connection_urls = std::env::var(ENV_MONGODB_URLS)
            .map(|raw| split_urls(&raw))
            .unwrap_or_default();
        let enable_logs = std::env::var(ENV_ENABLE_LOGS)
            .map(|raw| parse_flag(&raw))
            .unwrap_or(false);

        Self {
            connection_urls,
            enable_logs,
            pool: PoolConfig::default(),
        }
    }

    pub fn with_logs(mut self, enable: bool) -> Self {
        self.enable_logs = enable;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Split a comma-separated URL list, skipping blanks
pub fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
