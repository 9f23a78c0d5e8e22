use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors raised while loading or validating search settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(#[from] ::config::ConfigError),

    #[error("{0}")]
    Invalid(String),
}

/// Settings document: the `[search]` section of `octofhir.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchSettings {
    #[serde(default)]
    pub search: PaginationConfig,
}

impl SearchSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.search.validate()
    }
}

/// Process-wide paging behaviour. Read-only after start-up.
#[derive(Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "default_count")]
    pub default_count: usize,
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    #[serde(default = "default_cursor_ttl_secs")]
    pub cursor_ttl_secs: u64,
    /// Keyset pagination with signed cursors; offset paging when off.
    #[serde(default = "default_cursor_enabled")]
    pub cursor_enabled: bool,
    /// Serve the first page instead of failing on a bad or expired cursor.
    #[serde(default)]
    pub fallback_offset: bool,
    /// HMAC key for cursor tokens.
    #[serde(default, skip_serializing)]
    pub secret: String,
}

fn default_count() -> usize {
    10
}
fn default_max_count() -> usize {
    100
}
fn default_cursor_ttl_secs() -> u64 {
    3600
}
fn default_cursor_enabled() -> bool {
    true
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_count: default_count(),
            max_count: default_max_count(),
            cursor_ttl_secs: default_cursor_ttl_secs(),
            cursor_enabled: default_cursor_enabled(),
            fallback_offset: false,
            secret: String::new(),
        }
    }
}

impl fmt::Debug for PaginationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaginationConfig")
            .field("default_count", &self.default_count)
            .field("max_count", &self.max_count)
            .field("cursor_ttl_secs", &self.cursor_ttl_secs)
            .field("cursor_enabled", &self.cursor_enabled)
            .field("fallback_offset", &self.fallback_offset)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl PaginationConfig {
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn cursor_ttl(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.cursor_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_count == 0 {
            return Err("search.default_count must be > 0".into());
        }
        if self.max_count == 0 {
            return Err("search.max_count must be > 0".into());
        }
        if self.default_count > self.max_count {
            return Err("search.default_count must be <= search.max_count".into());
        }
        if self.cursor_ttl_secs == 0 {
            return Err("search.cursor_ttl_secs must be > 0".into());
        }
        if self.cursor_enabled && self.secret.is_empty() {
            return Err("search.cursor_enabled=true requires search.secret".into());
        }
        Ok(())
    }
}

pub mod loader {
    use super::{ConfigError, SearchSettings};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Load settings from an optional TOML file, then `OCTOFHIR__SEARCH__*`
    /// environment overrides, then validate.
    pub fn load_settings(path: Option<&str>) -> Result<SearchSettings, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("octofhir.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., OCTOFHIR__SEARCH__MAX_COUNT=50
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR")
                .try_parsing(true)
                .separator("__"),
        );
        let settings: SearchSettings = builder.build()?.try_deserialize()?;
        settings.validate().map_err(ConfigError::Invalid)?;
        tracing::debug!(
            default_count = settings.search.default_count,
            max_count = settings.search.max_count,
            cursor_enabled = settings.search.cursor_enabled,
            "loaded search settings"
        );
        Ok(settings)
    }
}
