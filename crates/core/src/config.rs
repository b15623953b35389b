use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

use crate::types::EnvironmentConfig;

/// Host-level configuration for the codebox binary.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub handler: HandlerConfig,
    pub logging: LoggingConfig,
    pub model: Option<ModelConfig>,
    /// Defaults applied to sessions created by the binary.
    pub session: EnvironmentConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HandlerConfig {
    /// Upper bound on concurrent model backend calls across all sessions.
    pub max_concurrent_queries: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 16,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,codebox=debug".to_string(),
            json: false,
        }
    }
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<Secret<String>>,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

fn default_model_timeout() -> u64 {
    120
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("CODEBOX_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map CODEBOX__HANDLER__MAX_CONCURRENT_QUERIES=8 to handler.max_concurrent_queries
            .add_source(Environment::with_prefix("CODEBOX").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
