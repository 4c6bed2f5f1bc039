//! Timeout recovery, keep-alive, and optimistic-concurrency behaviour.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use tranq::{
    handler_fn, Broker, BrokerConfig, BrokerEvent, ClaimRequest, Clock, ConsumerConfig,
    ConsumerId, InMemoryRepository, MessageDetails, Monitor, ProcessingState, QueueConfig,
    QueueId, Repository, RetryPolicy, TestClock,
};

struct EventChannel {
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl EventChannel {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Monitor for EventChannel {
    fn on_event(&self, event: &BrokerEvent) {
        let _ = self.tx.send(event.clone());
    }
}

async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>, mut predicate: F) -> BrokerEvent
where
    F: FnMut(&BrokerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

fn claim_one(consumer: &str, timeout: Duration) -> Vec<ClaimRequest> {
    vec![ClaimRequest { consumer: ConsumerId::from(consumer), max_count: 1, timeout }]
}

#[tokio::test]
async fn expired_claim_is_reclaimed_as_timed_out() -> Result<()> {
    let clock = Arc::new(TestClock::new());
    let repo = InMemoryRepository::with_clock(clock.clone());
    let ship = ConsumerId::from("ship");
    let details = MessageDetails::new(QueueId::from("orders"), clock.now_utc());
    repo.add(&details, std::slice::from_ref(&ship), Bytes::from_static(b"{}")).await?;

    let original = repo.take(&claim_one("ship", Duration::from_secs(10))).await?.remove(0).update;
    assert_eq!(original.from_state, ProcessingState::Pending);

    // inside the timeout the claim is exclusive
    clock.advance(Duration::from_secs(9));
    assert!(repo.take(&claim_one("ship", Duration::from_secs(10))).await?.is_empty());

    clock.advance(Duration::from_secs(2));
    let reclaimed = repo.take(&claim_one("ship", Duration::from_secs(10))).await?.remove(0).update;
    assert_eq!(reclaimed.from_state, ProcessingState::TimedOut);
    assert_eq!(reclaimed.details.message_id, details.message_id);

    // the first claimer's chain is dead; the reclaimer's works
    assert!(!repo.update(&original.completed(clock.now_utc())).await?);
    assert!(repo.update(&reclaimed.completed(clock.now_utc())).await?);
    Ok(())
}

#[tokio::test]
async fn keep_alive_extends_the_claim_without_counting_retries() -> Result<()> {
    let clock = Arc::new(TestClock::new());
    let repo = InMemoryRepository::with_clock(clock.clone());
    let ship = ConsumerId::from("ship");
    let details = MessageDetails::new(QueueId::from("orders"), clock.now_utc());
    repo.add(&details, std::slice::from_ref(&ship), Bytes::from_static(b"{}")).await?;

    let mut head = repo.take(&claim_one("ship", Duration::from_secs(10))).await?.remove(0).update;
    for _ in 0..5 {
        clock.advance(Duration::from_secs(8));
        let refreshed = head.processing(clock.now_utc());
        assert!(repo.update(&refreshed).await?);
        head = refreshed;
    }

    // 40 simulated seconds later the row is still firmly processing
    let status = repo.status_of(details.message_id, &ship).await.unwrap();
    assert_eq!(status.state, ProcessingState::Processing);
    assert_eq!(status.retries, 0);
    assert_eq!(status.version, head.to_version);
    assert!(repo.take(&claim_one("ship", Duration::from_secs(10))).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn competing_updates_from_one_version_admit_exactly_one_winner() -> Result<()> {
    let clock = Arc::new(TestClock::new());
    let repo = InMemoryRepository::with_clock(clock.clone());
    let ship = ConsumerId::from("ship");
    let details = MessageDetails::new(QueueId::from("orders"), clock.now_utc());
    repo.add(&details, std::slice::from_ref(&ship), Bytes::from_static(b"{}")).await?;

    let claim = repo.take(&claim_one("ship", Duration::from_secs(10))).await?.remove(0).update;
    let complete = claim.completed(clock.now_utc());
    let retry = claim.retry("transient", clock.now_utc());

    let mut accepted = 0;
    for update in [&complete, &retry] {
        if repo.update(update).await? {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1, "only the first update from a shared base may win");
    Ok(())
}

#[tokio::test]
async fn broker_recovers_a_message_abandoned_mid_processing() -> Result<()> {
    // First attempt hangs past its claim timeout; the watcher hands the
    // message to the consumer's second slot as a timed-out reclaim.
    let repo = Arc::new(InMemoryRepository::new());
    let (monitor, mut events) = EventChannel::new();
    let hang_first = Arc::new(Notify::new());

    let mut broker = Broker::builder(repo.clone())
        .monitor(monitor)
        .config(BrokerConfig {
            watcher_interval: Duration::from_millis(25),
            shutdown_timeout: Duration::from_secs(5),
        })
        .build();

    let gate = hang_first.clone();
    let first_attempt = Arc::new(std::sync::atomic::AtomicBool::new(true));
    broker.register_queue(QueueConfig::new("orders").consumer(
        ConsumerConfig::builder("ship")
            .timeout(Duration::from_millis(300))
            .parallelism(2)
            .retry_policy(RetryPolicy::Never)
            .build()?,
        Arc::new(handler_fn(move |_order: serde_json::Value, _keep_alive| {
            let gate = gate.clone();
            let first = first_attempt.swap(false, std::sync::atomic::Ordering::SeqCst);
            async move {
                if first {
                    gate.notified().await;
                }
                Ok(())
            }
        })),
    ))?;
    broker.start()?;

    broker.publish(&"orders".into(), &serde_json::json!({"order_id": 7})).await?;

    wait_for(&mut events, |e| matches!(e, BrokerEvent::ConsumingNew { .. })).await;
    // the hung claim expires after 300ms and a watcher tick reclaims it
    wait_for(&mut events, |e| matches!(e, BrokerEvent::ConsumingTimedOut { .. })).await;
    wait_for(&mut events, |e| matches!(e, BrokerEvent::Consumed { .. })).await;

    // the hung first attempt finishes late and must lose its update race
    hang_first.notify_waiters();
    wait_for(&mut events, |e| matches!(e, BrokerEvent::UpdateConflict { .. })).await;
    assert_eq!(repo.row_count().await, 0);

    broker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn watcher_reports_backlog_sizes_from_the_first_tick() -> Result<()> {
    let repo = Arc::new(InMemoryRepository::new());
    let (monitor, mut events) = EventChannel::new();

    // a consumer that never frees its single slot keeps the backlog visible
    let parked = Arc::new(Notify::new());
    let gate = parked.clone();
    let mut broker = Broker::builder(repo.clone())
        .monitor(monitor)
        .config(BrokerConfig {
            watcher_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(5),
        })
        .build();
    broker.register_queue(QueueConfig::new("orders").consumer(
        ConsumerConfig::builder("ship").retry_policy(RetryPolicy::Never).build()?,
        Arc::new(handler_fn(move |_order: serde_json::Value, _keep_alive| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
        })),
    ))?;
    broker.start()?;

    let zero = wait_for(&mut events, |e| matches!(e, BrokerEvent::SizeChanged { .. })).await;
    if let BrokerEvent::SizeChanged { size, .. } = zero {
        assert_eq!(size, 0, "the first tick reports even an empty backlog");
    }

    // one message gets claimed, two stay pending behind parallelism 1
    for order_id in 0..3 {
        broker.publish(&"orders".into(), &serde_json::json!({ "order_id": order_id })).await?;
    }
    wait_for(
        &mut events,
        |e| matches!(e, BrokerEvent::SizeChanged { size, .. } if *size == 2),
    )
    .await;

    // release parked workers until every message has been consumed, so
    // shutdown has nothing left to wait on
    tokio::time::timeout(Duration::from_secs(5), async {
        while repo.row_count().await > 0 {
            parked.notify_waiters();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backlog never drained");

    broker.stop().await?;
    Ok(())
}
