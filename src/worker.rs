//! Per-message retry state machine.
//!
//! One [`Worker`] owns one claimed message from claim to terminal outcome.
//! It drives the handler, persists retry and terminal transitions through
//! the optimistic version chain, and sleeps through backoff. Losing a
//! single compare-and-swap means another process took the row over, and the
//! worker abandons the message without side effects.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::handler::{Handler, KeepAlive, KeepAliveSink};
use crate::model::{ProcessingState, ProcessingUpdate};
use crate::monitor::{BrokerEvent, MonitorHandle};
use crate::repository::Repository;
use crate::time::Clock;

/// Shared collaborators of every worker spawned for one consumer.
#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) monitor: MonitorHandle,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cancel: CancellationToken,
    pub(crate) config: Arc<ConsumerConfig>,
}

/// Outcome of persisting one transition of the worker's version chain.
enum Persist {
    Applied(ProcessingUpdate),
    /// Version moved on; the claim belongs to someone else now.
    Lost,
    /// The repository failed; the claim recovers via timeout.
    StoreFailed,
}

/// Processes one claimed message to completion, failure, or abandonment.
pub(crate) struct Worker<M> {
    deps: WorkerDeps,
    /// Head of the row's version chain, shared with the keep-alive sink.
    state: Arc<Mutex<ProcessingUpdate>>,
    message: M,
    handler: Arc<dyn Handler<M>>,
}

impl<M: Clone + Send + 'static> Worker<M> {
    pub(crate) fn new(
        deps: WorkerDeps,
        claim: ProcessingUpdate,
        message: M,
        handler: Arc<dyn Handler<M>>,
    ) -> Self {
        Self { deps, state: Arc::new(Mutex::new(claim)), message, handler }
    }

    /// Runs attempts until the message reaches a terminal state, the retry
    /// budget runs out, or the claim is lost.
    pub(crate) async fn run(self) {
        let (details, consumer, from_state) = {
            let state = self.state.lock().await;
            (state.details.clone(), state.consumer.clone(), state.from_state)
        };
        match from_state {
            ProcessingState::TimedOut => self.deps.monitor.emit(BrokerEvent::ConsumingTimedOut {
                details: details.clone(),
                consumer: consumer.clone(),
            }),
            _ => self.deps.monitor.emit(BrokerEvent::ConsumingNew {
                details: details.clone(),
                consumer: consumer.clone(),
            }),
        }

        let keep_alive = KeepAlive::new(Arc::new(WorkerKeepAlive {
            state: self.state.clone(),
            deps: self.deps.clone(),
        }));

        loop {
            let outcome = self.handler.handle(self.message.clone(), keep_alive.clone()).await;

            match outcome {
                Ok(()) => {
                    let done = { self.state.lock().await.completed(self.deps.clock.now_utc()) };
                    match self.persist(done).await {
                        Persist::Applied(update) => {
                            debug!(
                                message_id = %details.message_id,
                                consumer = %consumer,
                                retries = update.retries,
                                "message consumed"
                            );
                            self.deps.monitor.emit(BrokerEvent::Consumed {
                                details,
                                consumer,
                                retries: update.retries,
                            });
                        },
                        Persist::Lost | Persist::StoreFailed => {},
                    }
                    return;
                },
                Err(handler_error) => {
                    let error_text = handler_error.to_string();
                    let retries_so_far = { self.state.lock().await.retries };

                    if !self.deps.config.retry_policy.allows(retries_so_far) {
                        let failed = {
                            self.state.lock().await.failed(&error_text, self.deps.clock.now_utc())
                        };
                        if let Persist::Applied(update) = self.persist(failed).await {
                            warn!(
                                message_id = %details.message_id,
                                consumer = %consumer,
                                retries = update.retries,
                                error = %error_text,
                                "message failed permanently"
                            );
                            self.deps.monitor.emit(BrokerEvent::Failed {
                                details,
                                consumer,
                                retries: update.retries,
                                error: error_text,
                            });
                        }
                        return;
                    }

                    let retried =
                        { self.state.lock().await.retry(&error_text, self.deps.clock.now_utc()) };
                    let retries = retried.retries;
                    match self.persist(retried).await {
                        Persist::Applied(update) => {
                            *self.state.lock().await = update;
                        },
                        Persist::Lost | Persist::StoreFailed => return,
                    }
                    self.deps.monitor.emit(BrokerEvent::Retrying {
                        details: details.clone(),
                        consumer: consumer.clone(),
                        retries,
                        error: error_text,
                    });

                    let delay = self.deps.config.throttling.delay(retries);
                    if !delay.is_zero() {
                        self.deps.monitor.emit(BrokerEvent::Throttling {
                            details: details.clone(),
                            consumer: consumer.clone(),
                            delay,
                            retries,
                        });
                        let finished = crate::throttle::throttled_sleep(
                            &self.deps.clock,
                            &self.deps.cancel,
                            delay,
                            self.deps.config.timeout / 2,
                            &keep_alive,
                        )
                        .await;
                        if !finished {
                            // shutdown or lost claim; the row recovers via
                            // the timeout path
                            return;
                        }
                    }
                },
            }
        }
    }

    /// Applies one transition, reporting conflicts and store failures
    /// through the monitor.
    async fn persist(&self, update: ProcessingUpdate) -> Persist {
        match self.deps.repository.update(&update).await {
            Ok(true) => Persist::Applied(update),
            Ok(false) => {
                debug!(
                    message_id = %update.details.message_id,
                    consumer = %update.consumer,
                    "claim lost to a newer version"
                );
                self.deps.monitor.emit(BrokerEvent::UpdateConflict {
                    details: update.details,
                    consumer: update.consumer,
                });
                Persist::Lost
            },
            Err(store_error) => {
                error!(
                    message_id = %update.details.message_id,
                    consumer = %update.consumer,
                    error = %store_error,
                    "repository update failed"
                );
                self.deps.monitor.emit(BrokerEvent::RepositoryFailure {
                    operation: "update",
                    error: store_error.to_string(),
                });
                Persist::StoreFailed
            },
        }
    }
}

/// Marks a claim as failed when its payload cannot be deserialized.
///
/// There is no point retrying a payload the codec rejects, so the row goes
/// straight to the terminal failed state.
pub(crate) async fn fail_undeserializable(
    deps: &WorkerDeps,
    claim: ProcessingUpdate,
    error: &Error,
) {
    let error_text = format!("payload could not be deserialized: {error}");
    error!(
        message_id = %claim.details.message_id,
        consumer = %claim.consumer,
        "{error_text}"
    );
    let failed = claim.failed(&error_text, deps.clock.now_utc());
    match deps.repository.update(&failed).await {
        Ok(true) => deps.monitor.emit(BrokerEvent::Failed {
            details: failed.details,
            consumer: failed.consumer,
            retries: failed.retries,
            error: error_text,
        }),
        Ok(false) => deps.monitor.emit(BrokerEvent::UpdateConflict {
            details: failed.details,
            consumer: failed.consumer,
        }),
        Err(store_error) => deps.monitor.emit(BrokerEvent::RepositoryFailure {
            operation: "update",
            error: store_error.to_string(),
        }),
    }
}

/// Keep-alive sink backed by the worker's live version chain.
struct WorkerKeepAlive {
    state: Arc<Mutex<ProcessingUpdate>>,
    deps: WorkerDeps,
}

#[async_trait]
impl KeepAliveSink for WorkerKeepAlive {
    async fn keep_alive(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let refreshed = state.processing(self.deps.clock.now_utc());
        match self.deps.repository.update(&refreshed).await {
            Ok(true) => {
                self.deps.monitor.emit(BrokerEvent::KeptAlive {
                    details: refreshed.details.clone(),
                    consumer: refreshed.consumer.clone(),
                });
                *state = refreshed;
                Ok(())
            },
            Ok(false) => {
                self.deps.monitor.emit(BrokerEvent::UpdateConflict {
                    details: refreshed.details.clone(),
                    consumer: refreshed.consumer.clone(),
                });
                Err(Error::Conflict {
                    message_id: refreshed.details.message_id,
                    consumer: refreshed.consumer,
                })
            },
            Err(store_error) => Err(store_error),
        }
    }
}
