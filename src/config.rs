//! Validated, immutable consumer configuration.
//!
//! Built once through [`ConsumerConfig::builder`] and never mutated after
//! registration; every invalid combination is rejected before the broker
//! starts, never at runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    model::ConsumerId,
    throttle::ThrottlingStrategy,
};

/// How many times a failing message is retried before it is marked failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Fail on the first handler error; no retries.
    Never,
    /// Retry up to the given number of times (so `Limited(n)` means at
    /// most `n + 1` attempts in total).
    Limited(u32),
    /// Retry until the handler eventually succeeds.
    Unlimited,
}

impl RetryPolicy {
    /// Returns `true` if another retry is allowed after `retries_so_far`
    /// failed retries.
    pub fn allows(&self, retries_so_far: u32) -> bool {
        match self {
            Self::Never => false,
            Self::Limited(max) => retries_so_far < *max,
            Self::Unlimited => true,
        }
    }
}

/// Immutable configuration of one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Globally unique consumer id.
    pub id: ConsumerId,
    /// Visibility timeout: how long a claim may go without a keep-alive
    /// before the row becomes reclaimable.
    pub timeout: Duration,
    /// Maximum concurrent claims for this consumer.
    pub parallelism: usize,
    /// Retry policy applied after handler failures.
    pub retry_policy: RetryPolicy,
    /// Backoff between retry attempts.
    pub throttling: ThrottlingStrategy,
}

impl ConsumerConfig {
    /// Starts building a consumer configuration with the given id.
    pub fn builder(id: impl Into<ConsumerId>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            id: id.into(),
            timeout: Duration::from_secs(30),
            parallelism: 1,
            retry_policy: RetryPolicy::Limited(10),
            throttling: ThrottlingStrategy::exponential(
                Duration::from_secs(1),
                Duration::from_secs(512),
            ),
        }
    }
}

/// Builder for [`ConsumerConfig`], validated on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ConsumerConfigBuilder {
    id: ConsumerId,
    timeout: Duration,
    parallelism: usize,
    retry_policy: RetryPolicy,
    throttling: ThrottlingStrategy,
}

impl ConsumerConfigBuilder {
    /// Sets the visibility timeout. Must be positive.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of concurrent claims. Must be at least 1.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the throttling strategy applied between retries.
    pub fn throttling(mut self, throttling: ThrottlingStrategy) -> Self {
        self.throttling = throttling;
        self
    }

    /// Validates the configuration and builds it.
    ///
    /// `RetryPolicy::Never` forces zero throttling since there is no
    /// retry to space out.
    pub fn build(self) -> Result<ConsumerConfig> {
        if self.id.is_empty() {
            return Err(Error::configuration("consumer id must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(Error::configuration(format!(
                "consumer {}: timeout must be positive",
                self.id
            )));
        }
        if self.parallelism == 0 {
            return Err(Error::configuration(format!(
                "consumer {}: parallelism must be at least 1",
                self.id
            )));
        }

        let throttling = match self.retry_policy {
            RetryPolicy::Never => ThrottlingStrategy::None,
            _ => self.throttling,
        };

        Ok(ConsumerConfig {
            id: self.id,
            timeout: self.timeout,
            parallelism: self.parallelism,
            retry_policy: self.retry_policy,
            throttling,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = ConsumerConfig::builder("ship").build().unwrap();
        assert_eq!(config.id.as_str(), "ship");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.retry_policy, RetryPolicy::Limited(10));
    }

    #[test]
    fn empty_id_rejected() {
        let err = ConsumerConfig::builder("").build().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = ConsumerConfig::builder("ship").timeout(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn zero_parallelism_rejected() {
        let err = ConsumerConfig::builder("ship").parallelism(0).build().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn never_retry_forces_zero_throttle() {
        let config = ConsumerConfig::builder("ship")
            .retry_policy(RetryPolicy::Never)
            .throttling(ThrottlingStrategy::exponential(
                Duration::from_secs(1),
                Duration::from_secs(60),
            ))
            .build()
            .unwrap();
        assert_eq!(config.throttling, ThrottlingStrategy::None);
    }

    #[test]
    fn retry_policy_allowance() {
        assert!(!RetryPolicy::Never.allows(0));
        assert!(RetryPolicy::Limited(3).allows(2));
        assert!(!RetryPolicy::Limited(3).allows(3));
        assert!(!RetryPolicy::Limited(0).allows(0));
        assert!(RetryPolicy::Unlimited.allows(u32::MAX));
    }
}
