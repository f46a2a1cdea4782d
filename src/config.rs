use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{DEFAULT_API_URL, DEFAULT_USER_AGENT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Upstream API
    pub api_url: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub fetch_retries: u32,
    pub fetch_concurrency: usize,
    pub max_pages: u32,

    // Database
    pub database_path: PathBuf,
    pub busy_timeout: Duration,

    // Persistence
    pub batch_size: usize,
    pub persist_retries: u32,
    pub conflict_policy: ConflictPolicy,
    pub row_error_policy: RowErrorPolicy,
}

/// How an incoming row resolves against an existing row with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Overwrite only when the incoming `modified_gmt` is strictly newer
    NewerOnly,
    /// Always overwrite with the incoming row
    LastWriteWins,
}

/// What the batch writer does with a row that violates a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowErrorPolicy {
    /// Roll back the row, record it, and continue with the rest of the batch
    Skip,
    /// Roll back the current chunk and stop the run
    Abort,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Upstream API
            api_url: env_or_default("API_URL", DEFAULT_API_URL),
            user_agent: env_or_default("API_USER_AGENT", DEFAULT_USER_AGENT),
            request_timeout: Duration::from_secs(parse_env_u64("REQUEST_TIMEOUT_SECS", 30)?),
            fetch_retries: parse_env_u32("FETCH_RETRIES", 2)?,
            fetch_concurrency: parse_env_usize("FETCH_CONCURRENCY", 4)?,
            max_pages: parse_env_u32("MAX_PAGES", 1000)?,

            // Database
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/posts.sqlite")),
            busy_timeout: Duration::from_millis(parse_env_u64("DATABASE_BUSY_TIMEOUT_MS", 10_000)?),

            // Persistence
            batch_size: parse_env_usize("BATCH_SIZE", 100)?,
            persist_retries: parse_env_u32("PERSIST_RETRIES", 3)?,
            conflict_policy: parse_conflict_policy(&env_or_default("CONFLICT_POLICY", "newer"))?,
            row_error_policy: parse_row_error_policy(&env_or_default("ON_ROW_ERROR", "skip"))?,
        })
    }

    /// A complete configuration pointing at placeholder endpoints, for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            api_url: "http://127.0.0.1:9/posts".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(5),
            fetch_retries: 0,
            fetch_concurrency: 2,
            max_pages: 50,
            database_path: PathBuf::from("./data/test.sqlite"),
            busy_timeout: Duration::from_secs(5),
            batch_size: 10,
            persist_retries: 1,
            conflict_policy: ConflictPolicy::NewerOnly,
            row_error_policy: RowErrorPolicy::Skip,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.is_empty() {
            return Err(ConfigError::MissingEnvVar("API_URL".to_string()));
        }
        match url::Url::parse(&self.api_url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => {
                return Err(ConfigError::InvalidValue {
                    name: "API_URL".to_string(),
                    message: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    name: "API_URL".to_string(),
                    message: e.to_string(),
                });
            }
        }
        if self.fetch_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "FETCH_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_pages == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_PAGES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "BATCH_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_conflict_policy(value: &str) -> Result<ConflictPolicy, ConfigError> {
    match value.to_lowercase().as_str() {
        "newer" | "newer-only" => Ok(ConflictPolicy::NewerOnly),
        "latest" | "last-write-wins" => Ok(ConflictPolicy::LastWriteWins),
        _ => Err(ConfigError::InvalidValue {
            name: "CONFLICT_POLICY".to_string(),
            message: format!("must be 'newer' or 'latest', got '{value}'"),
        }),
    }
}

fn parse_row_error_policy(value: &str) -> Result<RowErrorPolicy, ConfigError> {
    match value.to_lowercase().as_str() {
        "skip" => Ok(RowErrorPolicy::Skip),
        "abort" => Ok(RowErrorPolicy::Abort),
        _ => Err(ConfigError::InvalidValue {
            name: "ON_ROW_ERROR".to_string(),
            message: format!("must be 'skip' or 'abort', got '{value}'"),
        }),
    }
}
