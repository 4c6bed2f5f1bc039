//! Queue registration and transactional publishing.
//!
//! Registration happens before the broker starts and freezes the routing
//! table: a queue maps to the consumers it fans out to, and each consumer
//! id is unique across the whole broker. Publishing writes the payload and
//! one pending row per consumer inside the caller's transaction, and arms
//! a commit hook that wakes the intake pump once the transaction is real.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::model::{ConsumerId, MessageDetails, QueueId};
use crate::monitor::{BrokerEvent, MonitorHandle};
use crate::poller::{RegisteredConsumer, WorkerRunner};
use crate::repository::{ClaimedMessage, Repository};
use crate::serialize::Serializer;
use crate::time::Clock;
use crate::transaction::TransactionSynchronizer;
use crate::worker::{fail_undeserializable, Worker, WorkerDeps};

/// Declares one queue and the consumers attached to it.
pub struct QueueConfig<M: Send + 'static> {
    id: QueueId,
    consumers: Vec<(ConsumerConfig, Arc<dyn Handler<M>>)>,
}

impl<M: Send + 'static> QueueConfig<M> {
    /// Starts declaring a queue with the given id.
    pub fn new(id: impl Into<QueueId>) -> Self {
        Self { id: id.into(), consumers: Vec::new() }
    }

    /// Attaches a consumer to the queue.
    pub fn consumer(mut self, config: ConsumerConfig, handler: Arc<dyn Handler<M>>) -> Self {
        self.consumers.push((config, handler));
        self
    }
}

impl<M: Send + 'static> std::fmt::Debug for QueueConfig<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("id", &self.id)
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

/// Routing table and publish path shared by the broker facade.
pub(crate) struct QueueManager<S> {
    serializer: Arc<S>,
    transactions: Arc<dyn TransactionSynchronizer>,
    repository: Arc<dyn Repository>,
    monitor: MonitorHandle,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    poll_tx: mpsc::Sender<()>,
    /// Queue id to the consumers a publish fans out to, in registration
    /// order.
    queues: HashMap<QueueId, Vec<ConsumerId>>,
    consumers: HashMap<ConsumerId, RegisteredConsumer>,
}

impl<S: Serializer> QueueManager<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        serializer: Arc<S>,
        transactions: Arc<dyn TransactionSynchronizer>,
        repository: Arc<dyn Repository>,
        monitor: MonitorHandle,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        poll_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            serializer,
            transactions,
            repository,
            monitor,
            clock,
            cancel,
            poll_tx,
            queues: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Registers a queue and its consumers, building the type-erased
    /// worker entry point for each consumer.
    pub(crate) fn register_queue<M>(&mut self, queue: QueueConfig<M>) -> Result<()>
    where
        M: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if queue.id.is_empty() {
            return Err(Error::configuration("queue id must not be empty"));
        }
        if self.queues.contains_key(&queue.id) {
            return Err(Error::configuration(format!(
                "queue {} is already registered",
                queue.id
            )));
        }
        if queue.consumers.is_empty() {
            return Err(Error::configuration(format!(
                "queue {} must have at least one consumer",
                queue.id
            )));
        }

        let mut ids = Vec::with_capacity(queue.consumers.len());
        let mut registered = Vec::with_capacity(queue.consumers.len());
        for (config, handler) in queue.consumers {
            let id = config.id.clone();
            if self.consumers.contains_key(&id) || ids.contains(&id) {
                return Err(Error::DuplicateConsumer { consumer: id });
            }
            let runner = self.build_runner(Arc::new(config.clone()), handler);
            ids.push(id);
            registered.push(RegisteredConsumer { config: Arc::new(config), runner });
        }

        info!(queue = %queue.id, consumers = ids.len(), "queue registered");
        for (id, consumer) in ids.iter().cloned().zip(registered) {
            self.consumers.insert(id, consumer);
        }
        self.queues.insert(queue.id.clone(), ids);
        self.monitor.emit(BrokerEvent::QueueCreated { queue: queue.id });
        Ok(())
    }

    /// Serializes and stores a message for every consumer of `queue`,
    /// inside the caller's active transaction.
    pub(crate) async fn publish<M: Serialize>(
        &self,
        queue: &QueueId,
        message: &M,
    ) -> Result<MessageDetails> {
        if !self.transactions.is_in_transaction() {
            return Err(Error::NotInTransaction);
        }
        let Some(consumers) = self.queues.get(queue) else {
            return Err(Error::UnknownQueue { queue: queue.clone() });
        };

        let details = MessageDetails::new(queue.clone(), self.clock.now_utc());
        let payload = self.serializer.serialize(message)?;
        self.repository.add(&details, consumers, payload).await?;

        debug!(
            queue = %queue,
            message_id = %details.message_id,
            consumers = consumers.len(),
            "message published"
        );
        self.monitor.emit(BrokerEvent::MessagePublished {
            details: details.clone(),
            consumers: consumers.clone(),
        });

        // wake the pump only once the transaction is committed; a rollback
        // drops the hook together with the rows
        let poll_tx = self.poll_tx.clone();
        self.transactions.on_commit(Box::new(move || {
            let _ = poll_tx.try_send(());
        }));
        Ok(details)
    }

    /// Consumer ids across all queues, in no particular order.
    pub(crate) fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.consumers.keys().cloned().collect()
    }

    /// Moves the routing table out for the intake pump at start.
    pub(crate) fn take_consumers(&mut self) -> HashMap<ConsumerId, RegisteredConsumer> {
        std::mem::take(&mut self.consumers)
    }

    fn build_runner<M>(
        &self,
        config: Arc<ConsumerConfig>,
        handler: Arc<dyn Handler<M>>,
    ) -> WorkerRunner
    where
        M: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let deps = WorkerDeps {
            repository: self.repository.clone(),
            monitor: self.monitor.clone(),
            clock: self.clock.clone(),
            cancel: self.cancel.clone(),
            config,
        };
        let serializer = self.serializer.clone();
        Arc::new(move |claimed: ClaimedMessage| {
            let deps = deps.clone();
            let handler = handler.clone();
            let serializer = serializer.clone();
            Box::pin(async move {
                match serializer.deserialize::<M>(&claimed.payload) {
                    Ok(message) => {
                        Worker::new(deps, claimed.update, message, handler).run().await;
                    },
                    Err(codec_error) => {
                        fail_undeserializable(&deps, claimed.update, &codec_error).await;
                    },
                }
            })
        })
    }
}
