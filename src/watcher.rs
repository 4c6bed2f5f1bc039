//! Periodic recovery and backlog observation.
//!
//! The watcher is the safety net behind the event-driven intake path: every
//! tick it wakes the pump, so messages left behind by a crashed process or
//! published by a broker instance this one cannot see are eventually
//! claimed. The same tick counts each consumer's claimable backlog and
//! reports changes through the monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::model::{ConsumerId, ProcessingState};
use crate::monitor::BrokerEvent;
use crate::poller::PollerInner;
use crate::repository::ProcessingFilter;

/// Runs recovery ticks with a fixed delay between them until cancellation.
pub(crate) async fn run_watcher(inner: Arc<PollerInner>, interval: Duration) {
    let consumers: Vec<ConsumerId> = inner.consumers.keys().cloned().collect();
    let backlog_filter =
        ProcessingFilter::new().states([ProcessingState::Pending, ProcessingState::TimedOut]);
    // seeded out of range so the first tick always reports
    let mut last_sizes: HashMap<ConsumerId, i128> =
        consumers.iter().map(|c| (c.clone(), -1)).collect();

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            () = inner.clock.sleep(interval) => {},
        }

        trace!("recovery tick");
        inner.trigger_poll();

        match inner.repository.count_by_consumer(&consumers, &backlog_filter).await {
            Ok(counts) => {
                for (consumer, size) in counts {
                    let last = last_sizes.get(&consumer).copied().unwrap_or(-1);
                    if last != i128::from(size) {
                        inner.monitor.emit(BrokerEvent::SizeChanged {
                            consumer: consumer.clone(),
                            size,
                        });
                        last_sizes.insert(consumer, i128::from(size));
                    }
                }
            },
            Err(store_error) => {
                warn!(error = %store_error, "recovery tick could not inspect the backlog");
                inner.monitor.emit(BrokerEvent::RecoveryTickFailed {
                    error: store_error.to_string(),
                });
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    use crate::config::ConsumerConfig;
    use crate::memory::InMemoryRepository;
    use crate::model::{MessageDetails, QueueId};
    use crate::monitor::{Monitor, MonitorHandle};
    use crate::poller::{RegisteredConsumer, WorkerRunner};
    use crate::repository::Repository;
    use crate::time::{Clock, TestClock};

    use super::*;

    #[derive(Default)]
    struct SizeRecorder {
        sizes: Mutex<Vec<(ConsumerId, u64)>>,
    }

    impl Monitor for SizeRecorder {
        fn on_event(&self, event: &BrokerEvent) {
            if let BrokerEvent::SizeChanged { consumer, size } = event {
                self.sizes.lock().unwrap().push((consumer.clone(), *size));
            }
        }
    }

    #[tokio::test]
    async fn watcher_reports_backlog_changes_and_wakes_pump() {
        let clock = Arc::new(TestClock::new());
        let repo = InMemoryRepository::with_clock(clock.clone());
        let ship = ConsumerId::from("ship");
        let recorder = Arc::new(SizeRecorder::default());

        let (poll_tx, mut poll_rx) = mpsc::channel(1);
        let runner: WorkerRunner = Arc::new(|_claim| Box::pin(async {}));
        let config = ConsumerConfig::builder("ship").build().unwrap();
        let inner = Arc::new(PollerInner {
            consumers: HashMap::from([(
                ship.clone(),
                RegisteredConsumer { config: Arc::new(config), runner },
            )]),
            in_flight: HashMap::from([(ship.clone(), AtomicUsize::new(0))]),
            repository: Arc::new(repo.clone()),
            monitor: MonitorHandle::new(recorder.clone()),
            clock: clock.clone(),
            cancel: CancellationToken::new(),
            poll_tx,
            workers: TaskTracker::new(),
        });

        let watcher = tokio::spawn(run_watcher(inner.clone(), Duration::from_secs(1)));

        // first tick reports the empty backlog
        tokio::time::timeout(Duration::from_secs(1), poll_rx.recv()).await.unwrap().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(recorder.sizes.lock().unwrap().as_slice(), &[(ship.clone(), 0)]);

        let details = MessageDetails::new(QueueId::from("orders"), clock.now_utc());
        repo.add(&details, std::slice::from_ref(&ship), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while recorder.sizes.lock().unwrap().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(recorder.sizes.lock().unwrap().last(), Some(&(ship.clone(), 1)));

        inner.cancel.cancel();
        watcher.await.unwrap();
    }
}
