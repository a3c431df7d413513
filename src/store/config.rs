use crate::core::{Result, StoreError};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Store configuration
///
/// Retry counts are total attempts, the first one included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts for a single unit of work on lock contention
    pub query_retries: u32,

    /// Attempts for a whole transaction on lock contention
    pub transaction_retries: u32,

    /// First backoff delay, in milliseconds
    pub min_retry_delay_ms: u64,

    /// Backoff ceiling, in milliseconds
    pub max_retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            query_retries: 5,
            transaction_retries: 5,
            min_retry_delay_ms: 10,
            max_retry_delay_ms: 1000,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set attempts per unit of work
    pub fn query_retries(mut self, retries: u32) -> Self {
        self.query_retries = retries;
        self
    }

    /// Set attempts per transaction
    pub fn transaction_retries(mut self, retries: u32) -> Self {
        self.transaction_retries = retries;
        self
    }

    /// Set the first backoff delay
    pub fn min_retry_delay(mut self, delay: Duration) -> Self {
        self.min_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the backoff ceiling
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Parse from a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| StoreError::Config(format!("invalid store config: {err}")))?;
        config.validate().map_err(StoreError::Config)?;
        Ok(config)
    }

    /// Load from a JSON file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            StoreError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.query_retries == 0 {
            return Err("query_retries must be > 0".to_string());
        }

        if self.transaction_retries == 0 {
            return Err("transaction_retries must be > 0".to_string());
        }

        if self.min_retry_delay_ms == 0 {
            return Err("min_retry_delay_ms must be > 0".to_string());
        }

        if self.min_retry_delay_ms > self.max_retry_delay_ms {
            return Err("min_retry_delay_ms cannot exceed max_retry_delay_ms".to_string());
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy(self.query_retries)
    }

    pub fn transaction_retry_policy(&self) -> RetryPolicy {
        self.policy(self.transaction_retries)
    }

    fn policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(self.min_retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }
}
