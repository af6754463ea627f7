//! Sync engine configuration.
//!
//! `SyncConfig` is read from a JSON file with every field defaulted, then
//! environment overrides are applied. The auth token is never printed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_base_url, normalize_text_option};

pub const REMOTE_URL_ENV: &str = "STRIDE_REMOTE_URL";
pub const AUTH_TOKEN_ENV: &str = "STRIDE_AUTH_TOKEN";

/// How a dirty local record that meets a newer remote row is settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Raise a conflict and wait for an explicit resolution
    #[default]
    Manual,
    /// Keep whichever side has the later `updated_at`; the remote wins ties
    LastWriteWins,
}

/// Backoff for records the remote rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Engine configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Base URL of the sync API; `None` keeps the engine offline-only
    pub remote_url: Option<String>,
    pub auth_token: Option<String>,
    pub pull_page_size: usize,
    pub push_batch_size: usize,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub conflict_strategy: ConflictStrategy,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            auth_token: None,
            pull_page_size: 200,
            push_batch_size: 100,
            request_timeout_secs: 30,
            poll_interval_secs: 30,
            conflict_strategy: ConflictStrategy::Manual,
            retry: RetryConfig::default(),
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SyncConfig")
            .field("remote_url", &self.remote_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("pull_page_size", &self.pull_page_size)
            .field("push_batch_size", &self.push_batch_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("conflict_strategy", &self.conflict_strategy)
            .field("retry", &self.retry)
            .finish()
    }
}

impl SyncConfig {
    /// Parse a JSON config and validate it
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid config JSON: {error}")))?;
        config.normalized()
    }

    /// Load a config file, falling back to defaults when it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let payload = std::fs::read_to_string(path)?;
        Self::from_json(&payload)
    }

    /// Apply `STRIDE_REMOTE_URL` and `STRIDE_AUTH_TOKEN` when set
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(
            std::env::var(REMOTE_URL_ENV).ok(),
            std::env::var(AUTH_TOKEN_ENV).ok(),
        )
    }

    /// Apply explicit overrides; empty values are ignored
    pub fn with_overrides(
        mut self,
        remote_url: Option<String>,
        auth_token: Option<String>,
    ) -> Result<Self> {
        if let Some(url) = normalize_text_option(remote_url) {
            self.remote_url = Some(url);
        }
        if let Some(token) = normalize_text_option(auth_token) {
            self.auth_token = Some(token);
        }
        self.normalized()
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn normalized(mut self) -> Result<Self> {
        self.remote_url = match normalize_text_option(self.remote_url) {
            Some(url) if is_http_url(&url) => Some(normalize_base_url(&url)),
            Some(_) => {
                return Err(Error::Config(
                    "remote_url must include http:// or https://".to_string(),
                ))
            }
            None => None,
        };
        self.auth_token = normalize_text_option(self.auth_token);

        if self.pull_page_size == 0 || self.push_batch_size == 0 {
            return Err(Error::Config(
                "pull_page_size and push_batch_size must be positive".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 || self.poll_interval_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs and poll_interval_secs must be positive".to_string(),
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_json_uses_defaults() {
        let config = SyncConfig::from_json("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.pull_page_size, 200);
        assert_eq!(config.push_batch_size, 100);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Manual);
    }

    #[test]
    fn remote_url_is_normalized() {
        let config =
            SyncConfig::from_json(r#"{ "remote_url": " https://sync.example.com/ " }"#).unwrap();
        assert_eq!(config.remote_url.as_deref(), Some("https://sync.example.com"));
    }

    #[test]
    fn rejects_url_without_scheme() {
        let error = SyncConfig::from_json(r#"{ "remote_url": "sync.example.com" }"#).unwrap_err();
        assert!(matches!(error, Error::Config(_)));
    }

    #[test]
    fn rejects_unknown_fields() {
        let error = SyncConfig::from_json(r#"{ "turso_url": "x" }"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn parses_last_write_wins() {
        let config =
            SyncConfig::from_json(r#"{ "conflict_strategy": "last_write_wins" }"#).unwrap();
        assert_eq!(config.conflict_strategy, ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn overrides_replace_file_values() {
        let config = SyncConfig::from_json(r#"{ "remote_url": "https://a.example.com" }"#)
            .unwrap()
            .with_overrides(
                Some("https://b.example.com/".to_string()),
                Some("  token  ".to_string()),
            )
            .unwrap();
        assert_eq!(config.remote_url.as_deref(), Some("https://b.example.com"));
        assert_eq!(config.auth_token.as_deref(), Some("token"));

        let unchanged = config
            .clone()
            .with_overrides(Some("   ".to_string()), None)
            .unwrap();
        assert_eq!(unchanged, config);
    }

    #[test]
    fn debug_redacts_auth_token() {
        let config = SyncConfig {
            auth_token: Some("secret".to_string()),
            ..SyncConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(retry.delay_for_attempt(20), Duration::from_secs(300));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(tmp.path().join("config.json")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }
}
