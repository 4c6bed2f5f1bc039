//! Embeddable durable message broker over pluggable storage.
//!
//! `tranq` delivers messages published inside an application transaction to
//! registered consumers, at least once, with per-consumer parallelism,
//! bounded or unbounded retries, exponential backoff, and automatic
//! recovery of claims abandoned by crashed processes.
//!
//! # Architecture
//!
//! - A [`Broker`] owns the routing table and two background tasks: a
//!   coalesced intake pump that claims messages, and a recovery watcher
//!   that periodically re-polls and observes backlog sizes.
//! - Publishing writes the payload and one pending row per consumer of the
//!   queue through a [`Repository`], inside the transaction tracked by the
//!   [`TransactionSynchronizer`]. The pump wakes only on commit.
//! - Each claimed message is driven by a worker through the retry state
//!   machine configured per consumer ([`RetryPolicy`],
//!   [`ThrottlingStrategy`]).
//! - Competing broker instances coordinate purely through optimistic
//!   version tokens in the store; a lost compare-and-swap means another
//!   process took the message over.
//!
//! Everything observable is reported as [`BrokerEvent`]s to a [`Monitor`].
//! An [`InMemoryRepository`] is included for tests and single-process use.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod config;
mod error;
mod handler;
mod memory;
mod model;
mod monitor;
mod poller;
mod queue;
mod repository;
mod serialize;
mod throttle;
mod time;
mod transaction;
mod watcher;
mod worker;

pub use broker::{Broker, BrokerBuilder, BrokerConfig};
pub use config::{ConsumerConfig, ConsumerConfigBuilder, RetryPolicy};
pub use error::{Error, Result};
pub use handler::{handler_fn, Handler, HandlerError, HandlerFn, KeepAlive};
pub use memory::InMemoryRepository;
pub use model::{
    ConsumerId, MessageDetails, MessageId, ProcessingRecord, ProcessingState, ProcessingStatus,
    ProcessingUpdate, QueueId, VersionToken,
};
pub use monitor::{BrokerEvent, Monitor, MulticastMonitor, NoopMonitor};
pub use queue::QueueConfig;
pub use repository::{ClaimRequest, ClaimedMessage, ProcessingFilter, Repository};
pub use serialize::{JsonSerializer, Serializer};
pub use throttle::ThrottlingStrategy;
pub use time::{Clock, RealClock, TestClock};
pub use transaction::{AutoCommit, CommitListener, ManualTransaction, TransactionSynchronizer};
