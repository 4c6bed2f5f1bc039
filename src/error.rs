//! Error types for broker operations.
//!
//! Configuration and publish-time errors are returned synchronously to the
//! caller; everything that happens on background tasks (handler failures,
//! claim conflicts, store hiccups) is recovered locally and surfaced through
//! the [`Monitor`](crate::monitor::Monitor) instead.

use std::time::Duration;

use thiserror::Error;

use crate::model::{ConsumerId, MessageId, QueueId};

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the broker API.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid queue or consumer configuration, raised at registration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A consumer id was registered more than once, on any queue.
    #[error("consumer id {consumer} is already registered")]
    DuplicateConsumer {
        /// The offending consumer id.
        consumer: ConsumerId,
    },

    /// Publish targeted a queue that was never registered.
    #[error("queue {queue} is not registered")]
    UnknownQueue {
        /// The unregistered queue id.
        queue: QueueId,
    },

    /// Publish was called outside an active transaction.
    #[error("publish requires an active transaction")]
    NotInTransaction,

    /// Message payload could not be serialized or deserialized.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Description from the codec.
        message: String,
    },

    /// The repository reported an operational failure.
    #[error("repository error: {message}")]
    Repository {
        /// Description from the storage collaborator.
        message: String,
    },

    /// A versioned update lost the compare-and-swap race; processing
    /// ownership of the row now belongs to someone else.
    #[error("processing ownership lost for message {message_id} (consumer {consumer})")]
    Conflict {
        /// Message whose claim was lost.
        message_id: MessageId,
        /// Consumer the claim belonged to.
        consumer: ConsumerId,
    },

    /// `start()` was called on a broker that is already running.
    #[error("broker is already started")]
    AlreadyStarted,

    /// `start()` was called after `stop()`; a stopped broker cannot restart.
    #[error("broker has been stopped and cannot be restarted")]
    Stopped,

    /// In-flight work did not drain within the shutdown grace period.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The grace period that elapsed.
        timeout: Duration,
    },
}

impl Error {
    /// Creates a configuration error from a message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a serialization error from a message.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a repository error from a message.
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository { message: message.into() }
    }

    /// Returns `true` if this error is a version conflict rather than a
    /// genuine failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
