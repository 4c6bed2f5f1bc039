//! Observability hooks for broker activity.
//!
//! The broker reports everything it does through a closed set of
//! [`BrokerEvent`] values handed to a [`Monitor`]. Monitors are synchronous
//! and expected to be cheap; anything slow should hand the event off to its
//! own channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::model::{ConsumerId, MessageDetails, QueueId};

/// An observable moment in the life of the broker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum BrokerEvent {
    /// A queue finished registration.
    QueueCreated {
        /// Queue that was registered.
        queue: QueueId,
    },
    /// A message was written to the repository inside the publisher's
    /// transaction.
    MessagePublished {
        /// Identity of the published message.
        details: MessageDetails,
        /// Consumers that received a pending row.
        consumers: Vec<ConsumerId>,
    },
    /// An intake pass claimed messages from the repository.
    Polling {
        /// Number of messages claimed in this pass.
        claimed: usize,
    },
    /// A worker started on a message claimed from the pending state.
    ConsumingNew {
        /// Message being consumed.
        details: MessageDetails,
        /// Consumer doing the work.
        consumer: ConsumerId,
    },
    /// A worker started on a message reclaimed after a processing timeout.
    ConsumingTimedOut {
        /// Message being consumed.
        details: MessageDetails,
        /// Consumer doing the work.
        consumer: ConsumerId,
    },
    /// A failed attempt was recorded and the message will be retried.
    Retrying {
        /// Message that failed.
        details: MessageDetails,
        /// Consumer that failed.
        consumer: ConsumerId,
        /// Retry count after this failure.
        retries: u32,
        /// Error reported by the handler.
        error: String,
    },
    /// A worker is backing off before its next attempt.
    Throttling {
        /// Message being throttled.
        details: MessageDetails,
        /// Consumer backing off.
        consumer: ConsumerId,
        /// Time the worker will wait.
        delay: Duration,
        /// Retry count driving the delay.
        retries: u32,
    },
    /// A message was processed successfully and its row deleted.
    Consumed {
        /// Message that completed.
        details: MessageDetails,
        /// Consumer that completed it.
        consumer: ConsumerId,
        /// Retries it took to get there.
        retries: u32,
    },
    /// A message exhausted its retry budget and was parked as failed.
    Failed {
        /// Message that failed permanently.
        details: MessageDetails,
        /// Consumer that gave up.
        consumer: ConsumerId,
        /// Retry count at the time of failure.
        retries: u32,
        /// Last error reported by the handler.
        error: String,
    },
    /// A long-running handler refreshed its claim.
    KeptAlive {
        /// Message whose claim was refreshed.
        details: MessageDetails,
        /// Consumer holding the claim.
        consumer: ConsumerId,
    },
    /// A status update lost the optimistic concurrency race; another
    /// process owns the message now.
    UpdateConflict {
        /// Message whose update was rejected.
        details: MessageDetails,
        /// Consumer whose update was rejected.
        consumer: ConsumerId,
    },
    /// The observed backlog for a consumer changed since the last check.
    SizeChanged {
        /// Consumer whose backlog changed.
        consumer: ConsumerId,
        /// Messages currently pending or timed out.
        size: u64,
    },
    /// The broker started its background tasks.
    Started,
    /// The broker stopped.
    Stopped,
    /// A recovery tick could not inspect the repository.
    RecoveryTickFailed {
        /// Error reported by the repository.
        error: String,
    },
    /// A repository call outside the recovery tick failed.
    RepositoryFailure {
        /// Operation that failed.
        operation: &'static str,
        /// Error reported by the repository.
        error: String,
    },
}

/// Receives broker events.
pub trait Monitor: Send + Sync + 'static {
    /// Called for every event, on broker internal tasks. Must not block.
    fn on_event(&self, event: &BrokerEvent);
}

/// Monitor that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn on_event(&self, _event: &BrokerEvent) {}
}

/// Fans events out to several monitors in registration order.
#[derive(Default)]
pub struct MulticastMonitor {
    monitors: Vec<Arc<dyn Monitor>>,
}

impl MulticastMonitor {
    /// Creates an empty multicast monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a monitor to the fan-out set.
    pub fn add(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }
}

impl Monitor for MulticastMonitor {
    fn on_event(&self, event: &BrokerEvent) {
        for monitor in &self.monitors {
            monitor.on_event(event);
        }
    }
}

impl std::fmt::Debug for MulticastMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastMonitor")
            .field("monitors", &self.monitors.len())
            .finish()
    }
}

/// Internal wrapper that isolates the broker from monitor panics.
#[derive(Clone)]
pub(crate) struct MonitorHandle {
    inner: Arc<dyn Monitor>,
}

impl MonitorHandle {
    pub(crate) fn new(inner: Arc<dyn Monitor>) -> Self {
        Self { inner }
    }

    /// Delivers an event, swallowing panics so a broken monitor cannot
    /// take down delivery.
    pub(crate) fn emit(&self, event: BrokerEvent) {
        let result = catch_unwind(AssertUnwindSafe(|| self.inner.on_event(&event)));
        if result.is_err() {
            tracing::warn!(?event, "monitor panicked while handling event");
        }
    }
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle").finish_non_exhaustive()
    }
}
