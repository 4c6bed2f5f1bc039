//! The broker facade: wiring, lifecycle, and management operations.
//!
//! A broker is built, has queues registered, is started once, and is
//! stopped once. Starting freezes the routing table and spawns the two
//! background tasks (intake pump and recovery watcher); stopping cancels
//! them and waits for in-flight workers within a grace period.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{ConsumerId, MessageDetails, ProcessingRecord, QueueId};
use crate::monitor::{BrokerEvent, Monitor, MonitorHandle, NoopMonitor};
use crate::poller::PollerInner;
use crate::queue::{QueueConfig, QueueManager};
use crate::repository::{ProcessingFilter, Repository};
use crate::serialize::{JsonSerializer, Serializer};
use crate::time::{Clock, RealClock};
use crate::transaction::{AutoCommit, TransactionSynchronizer};
use crate::watcher::run_watcher;

const LIFECYCLE_CREATED: u8 = 0;
const LIFECYCLE_STARTED: u8 = 1;
const LIFECYCLE_STOPPED: u8 = 2;

/// Timing knobs of the broker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Fixed delay between recovery ticks.
    pub watcher_interval: Duration,
    /// How long `stop` waits for in-flight workers to drain.
    pub shutdown_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            watcher_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Embeddable durable message broker.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use serde::{Deserialize, Serialize};
/// use tranq::{
///     Broker, ConsumerConfig, InMemoryRepository, QueueConfig, handler_fn,
/// };
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlaced { order_id: u64 }
///
/// # async fn run() -> tranq::Result<()> {
/// let mut broker = Broker::builder(Arc::new(InMemoryRepository::new())).build();
/// broker.register_queue(QueueConfig::new("orders").consumer(
///     ConsumerConfig::builder("ship").build()?,
///     Arc::new(handler_fn(|order: OrderPlaced, _keep_alive| async move {
///         println!("shipping order {}", order.order_id);
///         Ok(())
///     })),
/// ))?;
/// broker.start()?;
///
/// broker.publish(&"orders".into(), &OrderPlaced { order_id: 42 }).await?;
///
/// broker.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Broker<S: Serializer = JsonSerializer> {
    manager: QueueManager<S>,
    repository: Arc<dyn Repository>,
    monitor: MonitorHandle,
    clock: Arc<dyn Clock>,
    config: BrokerConfig,
    cancel: CancellationToken,
    poll_tx: mpsc::Sender<()>,
    /// Consumed by the intake pump at start.
    poll_rx: Option<mpsc::Receiver<()>>,
    lifecycle: AtomicU8,
    tasks: Vec<JoinHandle<()>>,
    workers: TaskTracker,
    /// Routing table snapshot taken at start, when the manager hands its
    /// consumers to the intake pump.
    started_consumer_ids: Vec<ConsumerId>,
}

impl Broker<JsonSerializer> {
    /// Starts building a broker over the given repository, with JSON
    /// serialization, autocommit transactions, and no monitor.
    pub fn builder(repository: Arc<dyn Repository>) -> BrokerBuilder<JsonSerializer> {
        BrokerBuilder {
            repository,
            serializer: Arc::new(JsonSerializer),
            transactions: Arc::new(AutoCommit),
            monitor: Arc::new(NoopMonitor),
            clock: Arc::new(RealClock),
            config: BrokerConfig::default(),
        }
    }
}

impl<S: Serializer> Broker<S> {
    /// Registers a queue and its consumers. Only allowed before `start`.
    pub fn register_queue<M>(&mut self, queue: QueueConfig<M>) -> Result<()>
    where
        M: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        match self.lifecycle.load(Ordering::SeqCst) {
            LIFECYCLE_CREATED => self.manager.register_queue(queue),
            LIFECYCLE_STARTED => Err(Error::AlreadyStarted),
            _ => Err(Error::Stopped),
        }
    }

    /// Publishes a message to a queue inside the caller's transaction.
    ///
    /// The payload is serialized once; every consumer of the queue gets a
    /// pending row. Consumers see the message only after the transaction
    /// commits. Publishing works in any lifecycle state, so messages can
    /// be enqueued before `start` or while shutting down.
    pub async fn publish<M: Serialize>(
        &self,
        queue: &QueueId,
        message: &M,
    ) -> Result<MessageDetails> {
        self.manager.publish(queue, message).await
    }

    /// Starts the intake pump and the recovery watcher.
    ///
    /// A broker starts at most once; restarting after `stop` is not
    /// supported.
    pub fn start(&mut self) -> Result<()> {
        match self.lifecycle.compare_exchange(
            LIFECYCLE_CREATED,
            LIFECYCLE_STARTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {},
            Err(LIFECYCLE_STARTED) => return Err(Error::AlreadyStarted),
            Err(_) => return Err(Error::Stopped),
        }

        self.started_consumer_ids = self.manager.consumer_ids();
        let consumers = self.manager.take_consumers();
        let in_flight = consumers
            .keys()
            .map(|id| (id.clone(), std::sync::atomic::AtomicUsize::new(0)))
            .collect();
        let inner = Arc::new(PollerInner {
            consumers,
            in_flight,
            repository: self.repository.clone(),
            monitor: self.monitor.clone(),
            clock: self.clock.clone(),
            cancel: self.cancel.clone(),
            poll_tx: self.poll_tx.clone(),
            workers: self.workers.clone(),
        });

        let poll_rx = self
            .poll_rx
            .take()
            .ok_or_else(|| Error::configuration("broker intake channel already consumed"))?;
        self.tasks.push(tokio::spawn(crate::poller::run_intake(inner.clone(), poll_rx)));
        self.tasks.push(tokio::spawn(run_watcher(inner.clone(), self.config.watcher_interval)));

        // pick up whatever is already claimable
        inner.trigger_poll();
        info!("broker started");
        self.monitor.emit(BrokerEvent::Started);
        Ok(())
    }

    /// Stops the background tasks and waits for in-flight workers.
    ///
    /// Idempotent. Workers are asked to stop cooperatively; if they do
    /// not drain within the configured grace period the call returns
    /// [`Error::ShutdownTimeout`] with claims left to recover through the
    /// timeout path.
    pub async fn stop(&mut self) -> Result<()> {
        let previous = self.lifecycle.swap(LIFECYCLE_STOPPED, Ordering::SeqCst);
        if previous != LIFECYCLE_STARTED {
            return Ok(());
        }

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(join_error) = task.await {
                warn!(error = %join_error, "background task ended abnormally");
            }
        }

        self.workers.close();
        let drained =
            tokio::time::timeout(self.config.shutdown_timeout, self.workers.wait()).await;

        info!("broker stopped");
        self.monitor.emit(BrokerEvent::Stopped);
        match drained {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::ShutdownTimeout { timeout: self.config.shutdown_timeout }),
        }
    }

    /// Returns processing rows of all registered consumers matching
    /// `filter`.
    pub async fn processing_records(
        &self,
        filter: &ProcessingFilter,
    ) -> Result<Vec<ProcessingRecord>> {
        self.repository.find_processing(&self.consumer_ids(), filter).await
    }

    /// Counts matching processing rows per consumer; consumers with no
    /// matches are reported with a zero count.
    pub async fn processing_counts(
        &self,
        filter: &ProcessingFilter,
    ) -> Result<std::collections::HashMap<ConsumerId, u64>> {
        self.repository.count_by_consumer(&self.consumer_ids(), filter).await
    }

    /// Deletes matching processing rows, returning how many were removed.
    ///
    /// Meant for operational cleanup of failed rows; deleting rows that
    /// are actively being processed leaves their workers to lose their
    /// next version check.
    pub async fn delete_processing(&self, filter: &ProcessingFilter) -> Result<u64> {
        self.repository.delete_processing(&self.consumer_ids(), filter).await
    }

    fn consumer_ids(&self) -> Vec<ConsumerId> {
        let mut ids = self.manager.consumer_ids();
        ids.extend(self.started_consumer_ids.iter().cloned());
        ids
    }
}

impl<S: Serializer> std::fmt::Debug for Broker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("lifecycle", &self.lifecycle.load(Ordering::SeqCst))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Broker`], created by [`Broker::builder`].
pub struct BrokerBuilder<S: Serializer> {
    repository: Arc<dyn Repository>,
    serializer: Arc<S>,
    transactions: Arc<dyn TransactionSynchronizer>,
    monitor: Arc<dyn Monitor>,
    clock: Arc<dyn Clock>,
    config: BrokerConfig,
}

impl<S: Serializer> BrokerBuilder<S> {
    /// Replaces the payload codec.
    pub fn serializer<S2: Serializer>(self, serializer: S2) -> BrokerBuilder<S2> {
        BrokerBuilder {
            repository: self.repository,
            serializer: Arc::new(serializer),
            transactions: self.transactions,
            monitor: self.monitor,
            clock: self.clock,
            config: self.config,
        }
    }

    /// Bridges publishing to the host's transaction manager.
    pub fn transactions(mut self, transactions: Arc<dyn TransactionSynchronizer>) -> Self {
        self.transactions = transactions;
        self
    }

    /// Installs a monitor for broker events.
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Replaces the clock, mainly for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the broker timing configuration.
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the broker. Queues are registered on the built instance.
    pub fn build(self) -> Broker<S> {
        let cancel = CancellationToken::new();
        let (poll_tx, poll_rx) = mpsc::channel(1);
        let monitor = MonitorHandle::new(self.monitor);
        let manager = QueueManager::new(
            self.serializer,
            self.transactions,
            self.repository.clone(),
            monitor.clone(),
            self.clock.clone(),
            cancel.clone(),
            poll_tx.clone(),
        );
        Broker {
            manager,
            repository: self.repository,
            monitor,
            clock: self.clock,
            config: self.config,
            cancel,
            poll_tx,
            poll_rx: Some(poll_rx),
            lifecycle: AtomicU8::new(LIFECYCLE_CREATED),
            tasks: Vec::new(),
            workers: TaskTracker::new(),
            started_consumer_ids: Vec::new(),
        }
    }
}

impl<S: Serializer> std::fmt::Debug for BrokerBuilder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBuilder").field("config", &self.config).finish_non_exhaustive()
    }
}
