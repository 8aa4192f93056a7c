//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::AppConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Overrides `shutdown.timeout_secs`.
pub const ENV_SHUTDOWN_TIMEOUT: &str = "SHUTDOWN_TIMEOUT_IN_SEC";

/// Overrides `shutdown.delay_secs`.
pub const ENV_SHUTDOWN_DELAY: &str = "SHUTDOWN_DELAY_IN_SEC";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {name}: '{value}' is not a whole number of seconds")]
    Env { name: &'static str, value: String },

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Load, override from the environment, and validate a TOML file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, |name| std::env::var(name).ok())
}

/// Parse and validate `content`, reading overrides through `env`.
pub fn parse_config<E>(content: &str, env: E) -> Result<AppConfig, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let mut config: AppConfig = toml::from_str(content)?;
    apply_env_overrides(&mut config, env)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Apply the shutdown overrides read through `env` on top of `config`.
pub fn apply_env_overrides<E>(config: &mut AppConfig, env: E) -> Result<(), ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    if let Some(secs) = seconds(&env, ENV_SHUTDOWN_TIMEOUT)? {
        config.shutdown.timeout_secs = secs;
    }
    if let Some(secs) = seconds(&env, ENV_SHUTDOWN_DELAY)? {
        config.shutdown.delay_secs = Some(secs);
    }
    Ok(())
}

fn seconds<E>(env: &E, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    match env(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { name, value }),
    }
}
