//! Core domain model: typed identifiers, processing states, and the
//! versioned transition record that drives the optimistic-concurrency
//! protocol.
//!
//! Every mutation of a processing row is expressed as a [`ProcessingUpdate`]
//! minted by one of the pure transition operations ([`ProcessingUpdate::
//! processing`], [`completed`](ProcessingUpdate::completed),
//! [`retry`](ProcessingUpdate::retry), [`failed`](ProcessingUpdate::failed)).
//! Each transition chains from the previous update's version token, so a
//! store can accept or reject it with a single compare-and-swap.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strongly-typed queue identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(String);

impl QueueId {
    /// Returns the queue id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the id is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for QueueId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for QueueId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly-typed consumer identifier.
///
/// The string id is the sole canonical key for a consumer: registries,
/// in-flight counters, and backlog sizes are all keyed by it, and the
/// broker enforces process-wide uniqueness at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Returns the consumer id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the id is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ConsumerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ConsumerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly-typed message identifier, assigned once at publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Creates a new random message id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque optimistic-concurrency stamp, renewed on every transition.
///
/// Never interpreted, only compared for equality by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(Uuid);

impl VersionToken {
    /// Mints a fresh version token.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable identity of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDetails {
    /// Queue the message was published to.
    pub queue: QueueId,
    /// Message id, assigned at publish.
    pub message_id: MessageId,
    /// Publication timestamp.
    pub published_at: DateTime<Utc>,
}

impl MessageDetails {
    /// Creates message details for a new publication.
    pub fn new(queue: QueueId, published_at: DateTime<Utc>) -> Self {
        Self { queue, message_id: MessageId::new(), published_at }
    }
}

/// Delivery state of one (message, consumer) processing row.
///
/// ```text
/// Pending ──▶ Processing ──▶ Completed (terminal, row deleted)
///                │    ▲  └──▶ Failed    (terminal)
///                │    └────── Processing (retry, version bump)
///                ▼
///            TimedOut (read-time reclassification, never stored)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker and being handled.
    Processing,
    /// A `Processing` row whose deadline elapsed without a keep-alive.
    ///
    /// Never written to the store; stores reclassify overdue `Processing`
    /// rows at read and claim time.
    TimedOut,
    /// Successfully handled. Terminal; the row is deleted on transition.
    Completed,
    /// Retries exhausted or retry disabled. Terminal.
    Failed,
}

impl ProcessingState {
    /// Returns `true` for terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A versioned state transition for one (message, consumer) row.
///
/// Produced only by the pure transition operations; never constructed
/// field-by-field by broker code. A store applies the transition iff
/// [`from_version`](Self::from_version) still matches the row's current
/// version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingUpdate {
    /// Identity of the message being processed.
    pub details: MessageDetails,
    /// Consumer this row belongs to.
    pub consumer: ConsumerId,
    /// State the row was in when this transition was minted.
    pub from_state: ProcessingState,
    /// State the row moves to.
    pub to_state: ProcessingState,
    /// Version the caller believes the row currently has.
    pub from_version: VersionToken,
    /// Fresh version the row takes if the transition is accepted.
    pub to_version: VersionToken,
    /// Retry count after this transition.
    pub retries: u32,
    /// Most recent handler error message, if any.
    pub error_message: Option<String>,
    /// Timestamp of this transition.
    pub updated_at: DateTime<Utc>,
}

impl ProcessingUpdate {
    /// Builds the transition a store hands out when it claims a row.
    ///
    /// `from_state` is `Pending` or `TimedOut` depending on how the store
    /// classified the row at claim time; the row flips to `Processing`
    /// with a fresh version.
    pub fn claim(
        details: MessageDetails,
        consumer: ConsumerId,
        from_state: ProcessingState,
        from_version: VersionToken,
        retries: u32,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            details,
            consumer,
            from_state,
            to_state: ProcessingState::Processing,
            from_version,
            to_version: VersionToken::mint(),
            retries,
            error_message,
            updated_at: now,
        }
    }

    /// Keep-alive transition: stays `Processing`, bumps the version and
    /// timestamp, leaves the retry count untouched.
    pub fn processing(&self, now: DateTime<Utc>) -> Self {
        self.chain(ProcessingState::Processing, self.retries, self.error_message.clone(), now)
    }

    /// Success transition to the terminal `Completed` state.
    pub fn completed(&self, now: DateTime<Utc>) -> Self {
        self.chain(ProcessingState::Completed, self.retries, None, now)
    }

    /// Retry transition: stays `Processing`, increments the retry count
    /// and records the handler error.
    pub fn retry(&self, error_message: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.chain(
            ProcessingState::Processing,
            self.retries.saturating_add(1),
            Some(error_message.into()),
            now,
        )
    }

    /// Exhaustion transition to the terminal `Failed` state.
    pub fn failed(&self, error_message: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.chain(ProcessingState::Failed, self.retries, Some(error_message.into()), now)
    }

    fn chain(
        &self,
        to_state: ProcessingState,
        retries: u32,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            details: self.details.clone(),
            consumer: self.consumer.clone(),
            from_state: self.to_state,
            to_state,
            from_version: self.to_version,
            to_version: VersionToken::mint(),
            retries,
            error_message,
            updated_at: now,
        }
    }
}

/// Point-in-time status of a processing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    /// Current (possibly reclassified) state.
    pub state: ProcessingState,
    /// Retries performed so far.
    pub retries: u32,
    /// Most recent handler error message, if any.
    pub error_message: Option<String>,
    /// Current version token.
    pub version: VersionToken,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
}

/// Read projection of a processing row, returned by query APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// Identity of the message.
    pub details: MessageDetails,
    /// Consumer the row belongs to.
    pub consumer: ConsumerId,
    /// Current status.
    pub status: ProcessingStatus,
}
