use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for Dossier Flow
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DossierFlowConfig {
    /// Review policy applied by field, document and step reviews
    pub review: ReviewConfig,
    /// Pull-based payment reconciliation settings
    pub reconciliation: ReconciliationConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Product catalog location
    pub catalog: CatalogConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReviewConfig {
    /// Minimum number of characters in a rejection reason
    pub min_rejection_reason_len: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconciliationConfig {
    /// Orders pending longer than this are re-verified with the processor
    pub pending_after_minutes: i64,
    /// Maximum orders examined per pass
    pub batch_size: usize,
    /// Retry a transient store failure once before giving up on an order
    pub retry_transient_once: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON structured logs
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// Path to the product catalog TOML file
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            min_rejection_reason_len: 10,
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            pending_after_minutes: 15,
            batch_size: 100,
            retry_transient_once: true,
        }
    }
}

impl Default for DossierFlowConfig {
    fn default() -> Self {
        Self {
            review: ReviewConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
            },
            catalog: CatalogConfig {
                path: "catalog.toml".to_string(),
            },
            database: Some(DatabaseConfig {
                url: "sqlite://.dossier-flow/dossier-flow.db".to_string(),
                max_connections: 10,
                auto_migrate: true,
            }),
        }
    }
}

impl DossierFlowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (dossier-flow.toml)
    /// 3. Environment variables (prefixed with DOSSIER_FLOW_)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("dossier-flow.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let defaults = Config::try_from(&DossierFlowConfig::default())
            .context("Failed to serialize default configuration")?;
        let mut builder = Config::builder().add_source(defaults);

        if path.exists() {
            builder = builder.add_source(File::from(path));
        }

        // Double underscore separates nested keys, e.g.
        // DOSSIER_FLOW_REVIEW__MIN_REJECTION_REASON_LEN=12
        builder = builder.add_source(
            Environment::with_prefix("DOSSIER_FLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let loaded: DossierFlowConfig = config.try_deserialize()?;
        Ok(loaded)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<DossierFlowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = DossierFlowConfig::load_env_file();
        DossierFlowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static DossierFlowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}
