//! Relay pipeline configuration.

use crate::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::error::RelayError;
use crate::registry::BackpressurePolicy;
use std::time::Duration;

/// Settings threaded into [`crate::PodController`] at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Namespace whose pods are watched
    pub namespace: String,
    /// Interval between full resyncs of the cache
    pub resync_period: Duration,
    /// How long `run` waits for the initial list before giving up
    pub sync_timeout: Duration,
    /// Number of concurrent queue workers
    pub workers: usize,
    /// Capacity of each subscriber channel
    pub channel_capacity: usize,
    /// What broadcast does when a subscriber channel is full
    pub backpressure: BackpressurePolicy,
    /// First retry delay for a failing key
    pub backoff_base: Duration,
    /// Ceiling on any retry delay
    pub backoff_max: Duration,
    /// Retries per key before the event is given up on. `None` retries
    /// until the key succeeds or the queue shuts down.
    pub max_retries: Option<u32>,
    /// How long in-flight work may take to finish on stop
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            resync_period: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(60),
            workers: 1,
            channel_capacity: 1,
            backpressure: BackpressurePolicy::Block,
            backoff_base: DEFAULT_BASE_DELAY,
            backoff_max: DEFAULT_MAX_DELAY,
            max_retries: None,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Default settings for `namespace`.
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Checks the values that would otherwise wedge the pipeline.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.namespace.is_empty() {
            return Err(RelayError::InvalidConfig("namespace must not be empty".to_string()));
        }
        if self.workers == 0 {
            return Err(RelayError::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        if self.resync_period.is_zero() {
            return Err(RelayError::InvalidConfig("resync period must be positive".to_string()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(RelayError::InvalidConfig(format!(
                "backoff base {:?} exceeds ceiling {:?}",
                self.backoff_base, self.backoff_max
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_capacity, 1);
        assert_eq!(config.resync_period, Duration::from_secs(30));
        assert_eq!(config.backpressure, BackpressurePolicy::Block);
        assert_eq!(config.max_retries, None);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = RelayConfig {
            workers: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(config.validate(), Err(RelayError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = RelayConfig {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(1),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
