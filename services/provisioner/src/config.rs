//! Configuration for the provisioner.

use std::time::Duration;

use anyhow::{Context, Result};
use cirrus_reconcile::{Backoff, DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL};

use crate::types::DEFAULT_REGION;

/// Provisioner configuration.
#[derive(Clone)]
pub struct Config {
    /// API credential id.
    pub secret_id: String,

    /// API credential secret.
    pub secret_key: String,

    /// Region all provider calls target.
    pub region: String,

    /// Single endpoint overriding the per-service hosts.
    pub endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval between convergence polls.
    pub poll_interval: Duration,

    /// Poll budget per wait.
    pub poll_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let secret_id = env_with_fallback("CIRRUS_SECRET_ID", "TENCENTCLOUD_SECRET_ID")
            .context("CIRRUS_SECRET_ID (or TENCENTCLOUD_SECRET_ID) must be set")?;
        let secret_key = env_with_fallback("CIRRUS_SECRET_KEY", "TENCENTCLOUD_SECRET_KEY")
            .context("CIRRUS_SECRET_KEY (or TENCENTCLOUD_SECRET_KEY) must be set")?;

        let region = std::env::var("CIRRUS_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string());

        let endpoint = std::env::var("CIRRUS_ENDPOINT")
            .ok()
            .filter(|s| !s.is_empty());

        let log_level = std::env::var("CIRRUS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let poll_interval = std::env::var("CIRRUS_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        let poll_attempts = std::env::var("CIRRUS_POLL_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Ok(Self {
            secret_id,
            secret_key,
            region,
            endpoint,
            log_level,
            poll_interval,
            poll_attempts,
        })
    }

    /// Backoff for convergence waits.
    pub fn backoff(&self) -> Backoff {
        Backoff::constant(self.poll_interval, self.poll_attempts)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("log_level", &self.log_level)
            .field("poll_interval", &self.poll_interval)
            .field("poll_attempts", &self.poll_attempts)
            .finish()
    }
}

fn env_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .or_else(|| std::env::var(fallback).ok())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            secret_id: "AKIDexample".to_string(),
            secret_key: "very-secret".to_string(),
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            log_level: "info".to_string(),
            poll_interval: Duration::from_secs(2),
            poll_attempts: 7,
        }
    }

    #[test]
    fn test_backoff_from_config() {
        let backoff = config().backoff();
        assert_eq!(backoff.initial, Duration::from_secs(2));
        assert_eq!(backoff.max_attempts, 7);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("AKIDexample"));
        assert!(!rendered.contains("very-secret"));
    }
}
