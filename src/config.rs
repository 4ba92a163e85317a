use anyhow::{ensure, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for Shopfloor
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ShopfloorConfig {
    /// Orchestration engine settings
    pub engine: EngineConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker-pool size per bulk operation
    pub concurrency: usize,
    /// Per-call timeout for remote store calls
    pub gateway_timeout_ms: u64,
    /// Optional whole-batch ceiling; undispatched units fail with BatchTimedOut
    pub batch_timeout_ms: Option<u64>,
    /// Optional cap on remote store calls per second across the gateway
    pub rate_limit_per_second: Option<u32>,
    /// Gateway retry settings (retries are off by default)
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Additional attempts after a network failure
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level directive, e.g. "info" or "shopfloor=debug"
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            gateway_timeout_ms: 8_000,
            batch_timeout_ms: None,
            rate_limit_per_second: None,
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "engine.concurrency must be at least 1");
        ensure!(self.gateway_timeout_ms > 0, "engine.gateway_timeout_ms must be positive");
        if let Some(batch_timeout_ms) = self.batch_timeout_ms {
            ensure!(batch_timeout_ms > 0, "engine.batch_timeout_ms must be positive when set");
        }
        ensure!(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            "engine.retry.base_delay_ms must not exceed engine.retry.max_delay_ms"
        );
        Ok(())
    }
}

impl ShopfloorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (shopfloor.toml, or `path` when given)
    /// 3. Environment variables (prefixed with SHOPFLOOR__, `__` between levels)
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ShopfloorConfig::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new("shopfloor.toml").exists() {
                    builder = builder.add_source(File::with_name("shopfloor"));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SHOPFLOOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: ShopfloorConfig = builder.build()?.try_deserialize()?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(None)
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
static CONFIG: std::sync::LazyLock<Result<ShopfloorConfig, anyhow::Error>> = std::sync::LazyLock::new(|| {
    // Load .env file first
    let _ = ShopfloorConfig::load_env_file();
    ShopfloorConfig::load()
});

/// Get the global configuration
pub fn config() -> Result<&'static ShopfloorConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}
