//! Backoff throttling between retry attempts.
//!
//! The delay curve is a pure function of the retry count. Instead of one
//! long sleep, [`throttled_sleep`] sleeps in increments no larger than half
//! the consumer's timeout and issues a keep-alive after each increment, so
//! a live retrying worker's own row is never falsely reclassified as
//! timed out.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{handler::KeepAlive, time::Clock};

/// Retry counts past this exponent hit the maximum backoff directly.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrottlingStrategy {
    /// Retry immediately, always a zero delay.
    None,
    /// Exponential backoff: `min(max, base * 2^retry_count)`.
    ExponentialBackoff {
        /// Base delay multiplied per retry.
        base: Duration,
        /// Upper bound on the computed delay.
        max: Duration,
    },
}

impl ThrottlingStrategy {
    /// Creates an exponential backoff strategy.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::ExponentialBackoff { base, max }
    }

    /// Computes the delay before the next attempt after `retry_count`
    /// retries.
    ///
    /// Non-decreasing in `retry_count` and capped at the configured
    /// maximum; the exponent is capped before it can overflow, after
    /// which the maximum applies directly.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::ExponentialBackoff { base, max } => {
                let exponent = retry_count.min(MAX_BACKOFF_EXPONENT);
                let multiplier = 2_u32.saturating_pow(exponent);
                base.checked_mul(multiplier).map_or(*max, |delay| delay.min(*max))
            },
        }
    }
}

/// Sleeps for `total`, chunked into increments of at most `max_chunk`,
/// issuing a keep-alive between increments while delay remains.
///
/// Returns `false` if the sleep was interrupted: either cancellation was
/// requested (cooperative shutdown) or a keep-alive lost the row's claim.
/// In both cases the caller must stop without further retries; the message
/// stays recoverable through the timeout path.
pub(crate) async fn throttled_sleep(
    clock: &Arc<dyn Clock>,
    cancel: &CancellationToken,
    total: Duration,
    max_chunk: Duration,
    keep_alive: &KeepAlive,
) -> bool {
    let max_chunk = max_chunk.max(Duration::from_millis(1));
    let mut remaining = total;
    while remaining > Duration::ZERO {
        let chunk = remaining.min(max_chunk);
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = clock.sleep(chunk) => {},
        }
        remaining = remaining.saturating_sub(chunk);
        if remaining > Duration::ZERO && keep_alive.ping().await.is_err() {
            return false;
        }
    }
    true
}
