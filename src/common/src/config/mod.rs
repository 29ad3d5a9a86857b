use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use once_cell::sync::OnceCell;

pub static CONFIG: OnceCell<Configuration> = OnceCell::new();

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "treeprune.toml";

/// Prefix of environment variable overrides, e.g. `TREEPRUNE__PRUNER__PAGE_SIZE`
pub const ENV_PREFIX: &str = "TREEPRUNE__";

/// Retry and backoff settings for store calls.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first one
    ///
    /// Env: TREEPRUNE__PRUNER__RETRY__MAX_ATTEMPTS
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Settings of the subtree deletion engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PrunerConfig {
    /// Maximum number of listing/delete calls in flight at once
    ///
    /// Env: TREEPRUNE__PRUNER__MAX_CONCURRENCY
    pub max_concurrency: usize,
    /// Number of child keys requested per listing page
    ///
    /// Env: TREEPRUNE__PRUNER__PAGE_SIZE
    pub page_size: usize,
    /// Deadline for a single listing or delete call
    ///
    /// Env: TREEPRUNE__PRUNER__CALL_TIMEOUT
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            page_size: 100,
            call_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: String },

    #[error("retry.multiplier must be at least 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("retry.jitter must be between 0.0 and 1.0, got {0}")]
    InvalidJitter(f64),

    #[error("retry.max_delay ({max_delay:?}) is shorter than retry.base_delay ({base_delay:?})")]
    InvertedDelays {
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl PrunerConfig {
    /// Validate the pruner configuration.
    ///
    /// Checks:
    /// - Concurrency, page size, call timeout and attempts are positive
    /// - Backoff delays are positive and ordered
    /// - Multiplier and jitter are in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(
            field: &'static str,
            ok: bool,
            value: impl std::fmt::Debug,
        ) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::NotPositive {
                    field,
                    value: format!("{value:?}"),
                })
            }
        }

        let retry = &self.retry;
        positive("max_concurrency", self.max_concurrency > 0, self.max_concurrency)?;
        positive("page_size", self.page_size > 0, self.page_size)?;
        positive("call_timeout", !self.call_timeout.is_zero(), self.call_timeout)?;
        positive("retry.max_attempts", retry.max_attempts > 0, retry.max_attempts)?;
        positive("retry.base_delay", !retry.base_delay.is_zero(), retry.base_delay)?;
        positive("retry.max_delay", !retry.max_delay.is_zero(), retry.max_delay)?;

        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::InvertedDelays {
                base_delay: self.retry.base_delay,
                max_delay: self.retry.max_delay,
            });
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.retry.multiplier));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::InvalidJitter(self.retry.jitter));
        }

        Ok(())
    }
}

/// Log output settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG` when set
    ///
    /// Env: TREEPRUNE__LOGGING__LEVEL
    pub level: String,
    /// Emit one JSON object per line instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct Configuration {
    /// Deletion engine settings
    #[serde(default)]
    pub pruner: PrunerConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Configuration {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
    }

    /// Load defaults, then `treeprune.toml`, then `TREEPRUNE__` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        Self::extract(Self::figment().merge(Toml::file(DEFAULT_CONFIG_FILE)))
    }

    /// Load defaults, then the given TOML file, then environment variables.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        Self::extract(Self::figment().merge(Toml::file(path)))
    }

    fn extract(figment: Figment) -> anyhow::Result<Self> {
        use anyhow::Context;

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration")?;
        config
            .pruner
            .validate()
            .context("Invalid pruner configuration")?;

        tracing::debug!(
            max_concurrency = config.pruner.max_concurrency,
            page_size = config.pruner.page_size,
            call_timeout = ?config.pruner.call_timeout,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load once and keep the result in [`CONFIG`].
    pub fn global() -> anyhow::Result<&'static Configuration> {
        CONFIG.get_or_try_init(Self::load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = Configuration::default();

        assert_eq!(config.pruner.max_concurrency, 32);
        assert_eq!(config.pruner.page_size, 100);
        assert_eq!(config.pruner.call_timeout, Duration::from_secs(30));
        assert_eq!(config.pruner.retry.max_attempts, 3);
        assert_eq!(config.logging.level, "info");
        assert!(config.pruner.validate().is_ok());
    }

    #[test]
    fn test_configless_operation() {
        Jail::expect_with(|_jail| {
            let config = Configuration::load().map_err(|e| e.to_string())?;
            assert_eq!(config, Configuration::default());
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_with_humantime_durations() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "prune.toml",
                r#"
                [pruner]
                max_concurrency = 4
                page_size = 2
                call_timeout = "250ms"

                [pruner.retry]
                max_attempts = 5
                base_delay = "10ms"
                max_delay = "1s"
                multiplier = 1.5
                jitter = 0.0
                "#,
            )?;

            let config = Configuration::load_from_path(Path::new("prune.toml"))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.pruner.max_concurrency, 4);
            assert_eq!(config.pruner.page_size, 2);
            assert_eq!(config.pruner.call_timeout, Duration::from_millis(250));
            assert_eq!(config.pruner.retry.max_attempts, 5);
            assert_eq!(config.pruner.retry.base_delay, Duration::from_millis(10));
            assert_eq!(config.pruner.retry.multiplier, 1.5);
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, "[pruner]\npage_size = 50\n")?;
            jail.set_env("TREEPRUNE__PRUNER__PAGE_SIZE", "7");
            jail.set_env("TREEPRUNE__PRUNER__RETRY__MAX_ATTEMPTS", "9");
            jail.set_env("TREEPRUNE__LOGGING__LEVEL", "debug");

            let config = Configuration::load().map_err(|e| e.to_string())?;
            assert_eq!(config.pruner.page_size, 7);
            assert_eq!(config.pruner.retry.max_attempts, 9);
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        Jail::expect_with(|jail| {
            jail.set_env("TREEPRUNE__PRUNER__MAX_CONCURRENCY", "0");
            let err = Configuration::load().unwrap_err();
            assert!(format!("{err:#}").contains("max_concurrency must be positive"));
            Ok(())
        });
    }

    #[test]
    fn test_global_is_loaded_once() {
        Jail::expect_with(|jail| {
            jail.set_env("TREEPRUNE__PRUNER__PAGE_SIZE", "11");
            let first = Configuration::global().map_err(|e| e.to_string())?;
            assert_eq!(first.pruner.page_size, 11);

            jail.set_env("TREEPRUNE__PRUNER__PAGE_SIZE", "12");
            let second = Configuration::global().map_err(|e| e.to_string())?;
            assert!(std::ptr::eq(first, second));
            assert_eq!(second.pruner.page_size, 11);
            Ok(())
        });
    }

    #[test]
    fn test_validate() {
        let valid = PrunerConfig::default();

        let zero_timeout = PrunerConfig {
            call_timeout: Duration::ZERO,
            ..valid.clone()
        };
        assert!(matches!(
            zero_timeout.validate(),
            Err(ConfigError::NotPositive { field: "call_timeout", .. })
        ));

        let mut inverted = valid.clone();
        inverted.retry.max_delay = Duration::from_millis(1);
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvertedDelays { .. })
        ));

        let mut shrinking = valid.clone();
        shrinking.retry.multiplier = 0.5;
        assert_eq!(shrinking.validate(), Err(ConfigError::InvalidMultiplier(0.5)));

        let mut noisy = valid;
        noisy.retry.jitter = 1.5;
        assert_eq!(noisy.validate(), Err(ConfigError::InvalidJitter(1.5)));
    }
}
