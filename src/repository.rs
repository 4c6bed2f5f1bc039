//! Storage contract for messages and their per-consumer processing rows.
//!
//! A [`Repository`] persists one payload per message plus one processing row
//! per (message, consumer) pair. Concurrency between competing broker
//! instances is handled entirely through optimistic version tokens: every
//! state change is a compare-and-swap on the row's current version.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    ConsumerId, MessageDetails, MessageId, ProcessingRecord, ProcessingState, ProcessingUpdate,
};

/// A claim request for one consumer, batched into a single `take` call.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Consumer claiming messages.
    pub consumer: ConsumerId,
    /// Maximum number of messages to claim for this consumer.
    pub max_count: usize,
    /// Processing timeout to stamp on claimed rows. A claim older than
    /// this (counted from its last update) may be reclaimed by others.
    pub timeout: Duration,
}

/// A message claimed by `take`, ready to hand to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    /// The transition that claimed the row. `from_state` records whether
    /// the row was pending or timed out before the claim.
    pub update: ProcessingUpdate,
    /// Serialized message payload.
    pub payload: Bytes,
}

/// Filter for management queries over processing rows.
///
/// Empty fields do not constrain the query; an empty filter matches every
/// row for the requested consumers.
#[derive(Debug, Clone, Default)]
pub struct ProcessingFilter {
    /// Match rows whose effective state is one of these.
    pub states: Vec<ProcessingState>,
    /// Match messages published at or after this instant.
    pub published_after: Option<DateTime<Utc>>,
    /// Match messages published before this instant.
    pub published_before: Option<DateTime<Utc>>,
    /// Match rows last updated at or after this instant.
    pub updated_after: Option<DateTime<Utc>>,
    /// Match rows last updated before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// Match specific messages.
    pub message_ids: Vec<MessageId>,
}

impl ProcessingFilter {
    /// Creates an unconstrained filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the filter to rows in the given effective states.
    pub fn states(mut self, states: impl IntoIterator<Item = ProcessingState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    /// Restricts the filter to messages published at or after `instant`.
    pub fn published_after(mut self, instant: DateTime<Utc>) -> Self {
        self.published_after = Some(instant);
        self
    }

    /// Restricts the filter to messages published before `instant`.
    pub fn published_before(mut self, instant: DateTime<Utc>) -> Self {
        self.published_before = Some(instant);
        self
    }

    /// Restricts the filter to rows updated at or after `instant`.
    pub fn updated_after(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_after = Some(instant);
        self
    }

    /// Restricts the filter to rows updated before `instant`.
    pub fn updated_before(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_before = Some(instant);
        self
    }

    /// Restricts the filter to the given messages.
    pub fn message_ids(mut self, ids: impl IntoIterator<Item = MessageId>) -> Self {
        self.message_ids = ids.into_iter().collect();
        self
    }
}

/// Durable store for messages and processing rows.
///
/// Implementations must be safe to share between broker instances pointed
/// at the same store. Timed-out detection is a read-time notion: a row is
/// stored as processing and reported or reclaimed as timed out once its
/// deadline passes, without any background transition.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Stores a message payload and one pending row per consumer, inside
    /// the caller's current transaction if the store participates in it.
    async fn add(
        &self,
        details: &MessageDetails,
        consumers: &[ConsumerId],
        payload: Bytes,
    ) -> Result<()>;

    /// Atomically claims up to `max_count` messages per request, oldest
    /// first per consumer. Claimable rows are pending rows and processing
    /// rows whose timeout has expired; claiming flips them to processing
    /// under a fresh version token.
    async fn take(&self, requests: &[ClaimRequest]) -> Result<Vec<ClaimedMessage>>;

    /// Applies a state transition if the row's stored version still equals
    /// `update.from_version`. Returns `false` when the version has moved
    /// on. A transition to completed deletes the row, and the payload too
    /// once no rows reference it.
    async fn update(&self, update: &ProcessingUpdate) -> Result<bool>;

    /// Returns processing rows for the given consumers matching `filter`.
    async fn find_processing(
        &self,
        consumers: &[ConsumerId],
        filter: &ProcessingFilter,
    ) -> Result<Vec<ProcessingRecord>>;

    /// Counts matching rows per consumer. Every requested consumer appears
    /// in the result, with a zero count when nothing matches.
    async fn count_by_consumer(
        &self,
        consumers: &[ConsumerId],
        filter: &ProcessingFilter,
    ) -> Result<HashMap<ConsumerId, u64>>;

    /// Deletes matching rows and returns how many were removed. Payloads
    /// no longer referenced by any row are removed too.
    async fn delete_processing(
        &self,
        consumers: &[ConsumerId],
        filter: &ProcessingFilter,
    ) -> Result<u64>;
}
