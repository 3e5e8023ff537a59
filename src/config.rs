//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Database configuration for the registry/history store
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    /// Negotiate TLS when connecting
    pub require_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_pool_size: 10,
            require_tls: false,
        }
    }
}

/// Limits applied to generated queries
#[derive(Debug, Clone, Deserialize)]
pub struct QueryLimits {
    /// Row limit used when the caller does not request one
    pub default_row_limit: u32,
    /// Hard ceiling for relational row limits
    pub max_row_limit: u32,
    /// Hard ceiling for document-store result sizes
    pub max_document_limit: u32,
    /// Maximum number of aggregation stages
    pub max_pipeline_stages: usize,
    /// Lookback window for injected date filters
    pub date_lookback_days: i64,
    /// Per-statement timeout on store I/O
    pub statement_timeout_ms: u64,
    /// Documents sampled to infer the field allow-list
    pub field_sample_size: usize,
    /// Distinct values fetched per categorical column
    pub categorical_sample_limit: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_row_limit: 50,
            max_row_limit: 500,
            max_document_limit: 200,
            max_pipeline_stages: 10,
            date_lookback_days: 90,
            statement_timeout_ms: 8_000,
            field_sample_size: 400,
            categorical_sample_limit: 20,
        }
    }
}

impl QueryLimits {
    /// Clamp a caller-requested row limit into `[1, max_row_limit]`
    pub fn clamp_row_limit(&self, requested: Option<i64>) -> u32 {
        let requested = requested.unwrap_or(self.default_row_limit as i64);
        requested.clamp(1, self.max_row_limit as i64) as u32
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub limits: QueryLimits,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let database = match std::env::var("DATABASE_URL") {
            Ok(database_url) => Self::parse_database_url(&database_url)?,
            Err(_) => DatabaseConfig {
                host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_or("DB_PORT", 5432),
                user: std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: std::env::var("DB_PASSWORD").unwrap_or_default(),
                database: std::env::var("DB_NAME").unwrap_or_else(|_| "postgres".to_string()),
                max_pool_size: env_or("DB_MAX_CONNECTIONS", 10),
                require_tls: env_or("DB_REQUIRE_TLS", false),
            },
        };

        let defaults = QueryLimits::default();
        let limits = QueryLimits {
            default_row_limit: env_or("QUERY_DEFAULT_LIMIT", defaults.default_row_limit),
            max_row_limit: env_or("QUERY_MAX_LIMIT", defaults.max_row_limit),
            max_document_limit: env_or("DOCUMENT_MAX_LIMIT", defaults.max_document_limit),
            max_pipeline_stages: env_or("DOCUMENT_MAX_STAGES", defaults.max_pipeline_stages),
            date_lookback_days: env_or("DATE_LOOKBACK_DAYS", defaults.date_lookback_days),
            statement_timeout_ms: env_or("STATEMENT_TIMEOUT_MS", defaults.statement_timeout_ms),
            field_sample_size: env_or("FIELD_SAMPLE_SIZE", defaults.field_sample_size),
            categorical_sample_limit: env_or(
                "CATEGORICAL_SAMPLE_LIMIT",
                defaults.categorical_sample_limit,
            ),
        };

        if limits.max_row_limit == 0 || limits.max_document_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "Row limits must be greater than zero".to_string(),
            ));
        }
        if limits.default_row_limit > limits.max_row_limit {
            return Err(ConfigError::InvalidValue(format!(
                "QUERY_DEFAULT_LIMIT ({}) exceeds QUERY_MAX_LIMIT ({})",
                limits.default_row_limit, limits.max_row_limit
            )));
        }

        Ok(Self { database, limits })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    pub fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported DATABASE_URL scheme: {}",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        // Managed Postgres providers (Neon) only accept TLS connections
        let require_tls = host.contains("neon.tech")
            || parsed
                .query_pairs()
                .any(|(k, v)| k == "sslmode" && (v == "require" || v == "verify-full"));

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            max_pool_size: env_or("DB_MAX_CONNECTIONS", 10),
            require_tls,
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
