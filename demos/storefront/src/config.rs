//! Storefront configuration.
//!
//! Values come from the environment with defaults matching the storefront's
//! production behavior:
//!
//! | Variable                            | Default                 |
//! |-------------------------------------|-------------------------|
//! | `STOREFRONT_LOGIN_PATH`             | `authentication/login`  |
//! | `STOREFRONT_API_LATENCY_MS`         | `200`                   |
//! | `STOREFRONT_MAX_RETRIES`            | `3`                     |
//! | `STOREFRONT_RETRY_INITIAL_DELAY_MS` | `500`                   |

use command_flow_runtime::retry::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default route of the login page (no leading slash).
pub const DEFAULT_LOGIN_PATH: &str = "authentication/login";

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },

    /// The parsed configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Storefront settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StorefrontConfig {
    /// Route of the login page, relative to the application base
    pub login_path: String,
    /// Simulated latency of the in-memory APIs
    pub api_latency: Duration,
    /// Retry policy for loading a single order
    pub order_retry: RetryPolicy,
}

impl Default for StorefrontConfig {
    fn default() -> Self {
        Self {
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            api_latency: Duration::from_millis(200),
            order_retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(500))
                .multiplier(2.0)
                .build(),
        }
    }
}

impl StorefrontConfig {
    /// Read the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable cannot be parsed or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read the configuration through `lookup` (variable name → value).
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("STOREFRONT_LOGIN_PATH") {
            config.login_path = path.trim().trim_start_matches('/').to_string();
        }
        if let Some(ms) = parse(&lookup, "STOREFRONT_API_LATENCY_MS")? {
            config.api_latency = Duration::from_millis(ms);
        }
        if let Some(retries) = parse(&lookup, "STOREFRONT_MAX_RETRIES")? {
            config.order_retry.max_retries = retries;
        }
        if let Some(ms) = parse(&lookup, "STOREFRONT_RETRY_INITIAL_DELAY_MS")? {
            config.order_retry.initial_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an empty login path, zero
    /// retries, or an initial delay above the retry cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.login_path.is_empty() {
            return Err(ConfigError::Validation("login path must not be empty".into()));
        }
        if self.order_retry.max_retries == 0 {
            return Err(ConfigError::Validation(
                "max retries must be at least 1".into(),
            ));
        }
        if self.order_retry.initial_delay > self.order_retry.max_delay {
            return Err(ConfigError::Validation(format!(
                "initial retry delay {:?} exceeds the cap {:?}",
                self.order_retry.initial_delay, self.order_retry.max_delay
            )));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
