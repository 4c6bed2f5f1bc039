//! Coalesced message intake.
//!
//! A single intake task owns all claiming. Anything that might have made
//! messages claimable (a commit, a finished worker, a recovery tick) sends
//! one unit into a capacity-1 channel; concurrent triggers collapse into
//! one pass. Each pass claims at most the free capacity of every consumer,
//! so a slow handler never starves its own parallelism budget, and a pass
//! that claimed anything re-triggers itself in case more work is waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::config::ConsumerConfig;
use crate::model::ConsumerId;
use crate::monitor::{BrokerEvent, MonitorHandle};
use crate::repository::{ClaimRequest, ClaimedMessage, Repository};
use crate::time::Clock;

/// Type-erased entry point of one consumer's worker, built at queue
/// registration. Deserializes the payload and runs the retry state machine.
pub(crate) type WorkerRunner =
    Arc<dyn Fn(ClaimedMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// A consumer as the poller sees it.
pub(crate) struct RegisteredConsumer {
    pub(crate) config: Arc<ConsumerConfig>,
    pub(crate) runner: WorkerRunner,
}

/// Shared state of the intake pump.
pub(crate) struct PollerInner {
    pub(crate) consumers: HashMap<ConsumerId, RegisteredConsumer>,
    /// Claims currently held per consumer, bounded by its parallelism.
    pub(crate) in_flight: HashMap<ConsumerId, AtomicUsize>,
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) monitor: MonitorHandle,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cancel: CancellationToken,
    pub(crate) poll_tx: mpsc::Sender<()>,
    pub(crate) workers: TaskTracker,
}

impl PollerInner {
    /// Requests an intake pass. Coalesces: a pass already queued absorbs
    /// this trigger.
    pub(crate) fn trigger_poll(&self) {
        let _ = self.poll_tx.try_send(());
    }

    fn claim_requests(&self) -> Vec<ClaimRequest> {
        self.consumers
            .iter()
            .filter_map(|(id, consumer)| {
                let held = self
                    .in_flight
                    .get(id)
                    .map_or(0, |counter| counter.load(Ordering::SeqCst));
                let free = consumer.config.parallelism.saturating_sub(held);
                (free > 0).then(|| ClaimRequest {
                    consumer: id.clone(),
                    max_count: free,
                    timeout: consumer.config.timeout,
                })
            })
            .collect()
    }

    fn dispatch(self: &Arc<Self>, claimed: ClaimedMessage) {
        let consumer = claimed.update.consumer.clone();
        let Some(registered) = self.consumers.get(&consumer) else {
            // take returned a consumer this broker never registered
            error!(consumer = %consumer, "claimed message for unknown consumer");
            return;
        };
        if let Some(counter) = self.in_flight.get(&consumer) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let guard = InFlightGuard { inner: self.clone(), consumer };
        let run = (registered.runner)(claimed);
        self.workers.spawn(async move {
            run.await;
            drop(guard);
        });
    }
}

/// Decrements the consumer's in-flight count when a worker finishes for
/// any reason, including a panic, and wakes the pump to refill the slot.
struct InFlightGuard {
    inner: Arc<PollerInner>,
    consumer: ConsumerId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(counter) = self.inner.in_flight.get(&self.consumer) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.trigger_poll();
    }
}

/// Intake loop: waits for a trigger, claims up to every consumer's free
/// capacity, and hands claims to workers. Runs until cancellation.
pub(crate) async fn run_intake(inner: Arc<PollerInner>, mut poll_rx: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            received = poll_rx.recv() => {
                if received.is_none() {
                    return;
                }
            },
        }

        let requests = inner.claim_requests();
        if requests.is_empty() {
            continue;
        }

        match inner.repository.take(&requests).await {
            Ok(claims) => {
                let claimed = claims.len();
                inner.monitor.emit(BrokerEvent::Polling { claimed });
                if claimed == 0 {
                    continue;
                }
                debug!(claimed, "intake pass claimed messages");
                for claim in claims {
                    inner.dispatch(claim);
                }
                // a full batch may have left more behind
                inner.trigger_poll();
            },
            Err(store_error) => {
                error!(error = %store_error, "intake pass could not claim messages");
                inner.monitor.emit(BrokerEvent::RepositoryFailure {
                    operation: "take",
                    error: store_error.to_string(),
                });
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::memory::InMemoryRepository;
    use crate::model::{MessageDetails, QueueId};
    use crate::monitor::NoopMonitor;
    use crate::time::TestClock;

    use super::*;

    fn poller_for(
        repo: InMemoryRepository,
        clock: Arc<TestClock>,
        config: ConsumerConfig,
        runner: WorkerRunner,
    ) -> (Arc<PollerInner>, mpsc::Receiver<()>) {
        let (poll_tx, poll_rx) = mpsc::channel(1);
        let id = config.id.clone();
        let inner = PollerInner {
            consumers: HashMap::from([(
                id.clone(),
                RegisteredConsumer { config: Arc::new(config), runner },
            )]),
            in_flight: HashMap::from([(id, AtomicUsize::new(0))]),
            repository: Arc::new(repo),
            monitor: MonitorHandle::new(Arc::new(NoopMonitor)),
            clock,
            cancel: CancellationToken::new(),
            poll_tx,
            workers: TaskTracker::new(),
        };
        (Arc::new(inner), poll_rx)
    }

    #[tokio::test]
    async fn intake_respects_parallelism() {
        let clock = Arc::new(TestClock::new());
        let repo = InMemoryRepository::with_clock(clock.clone());
        let ship = ConsumerId::from("ship");
        for _ in 0..5 {
            let details = MessageDetails::new(QueueId::from("orders"), clock.now_utc());
            repo.add(&details, std::slice::from_ref(&ship), Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }

        let started = Arc::new(AtomicU32::new(0));
        let release = Arc::new(tokio::sync::Notify::new());
        let config = ConsumerConfig::builder("ship").parallelism(2).build().unwrap();

        let counter = started.clone();
        let gate = release.clone();
        let runner: WorkerRunner = Arc::new(move |_claim| {
            let counter = counter.clone();
            let gate = gate.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
            })
        });

        let (inner, poll_rx) = poller_for(repo, clock, config, runner);
        let pump = tokio::spawn(run_intake(inner.clone(), poll_rx));
        inner.trigger_poll();

        tokio::time::timeout(Duration::from_secs(1), async {
            while started.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        // both slots are busy; further triggers claim nothing
        inner.trigger_poll();
        tokio::task::yield_now().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);

        // freeing the slots lets the pump refill them
        release.notify_waiters();
        tokio::time::timeout(Duration::from_secs(1), async {
            while started.load(Ordering::SeqCst) < 4 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        inner.cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn triggers_coalesce() {
        let clock = Arc::new(TestClock::new());
        let repo = InMemoryRepository::with_clock(clock.clone());
        let config = ConsumerConfig::builder("ship").build().unwrap();
        let runner: WorkerRunner = Arc::new(|_claim| Box::pin(async {}));
        let (inner, mut poll_rx) = poller_for(repo, clock, config, runner);

        for _ in 0..100 {
            inner.trigger_poll();
        }
        assert!(poll_rx.recv().await.is_some());
        assert!(poll_rx.try_recv().is_err(), "pending triggers collapse into one");
    }
}
