//! Message handler contract and the keep-alive handle.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;

use crate::error::Result;

/// Error type returned by message handlers.
///
/// Its `Display` output becomes the stored error message on retry and
/// failure transitions.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Processes one message on behalf of a consumer.
///
/// Delivery is at-least-once: the same message may be handed to the
/// handler again after a crash or timeout, so handlers must be idempotent.
/// Messages are passed by value per attempt, which is why `M: Clone` is
/// required at queue registration.
#[async_trait]
pub trait Handler<M: Send + 'static>: Send + Sync + 'static {
    /// Handles one message.
    ///
    /// Long-running handlers should call [`KeepAlive::ping`] periodically
    /// so their claim is not reclassified as timed out. Returning an error
    /// triggers the consumer's retry policy.
    async fn handle(&self, message: M, keep_alive: KeepAlive) -> std::result::Result<(), HandlerError>;
}

/// Adapts an async closure into a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

/// Closure-backed handler created by [`handler_fn`].
#[derive(Debug, Clone)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<M, F, Fut> Handler<M> for HandlerFn<F>
where
    M: Send + 'static,
    F: Fn(M, KeepAlive) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        message: M,
        keep_alive: KeepAlive,
    ) -> std::result::Result<(), HandlerError> {
        (self.f)(message, keep_alive).await
    }
}

/// Receiver of keep-alive signals; implemented by the worker owning the
/// claim.
#[async_trait]
pub(crate) trait KeepAliveSink: Send + Sync {
    /// Persists a keep-alive transition for the current claim.
    async fn keep_alive(&self) -> Result<()>;
}

/// Handle a handler uses to signal it is still working on a message.
///
/// Each ping persists its own versioned `processing` transition, resetting
/// the row's deadline without touching the retry count. May be called any
/// number of times, including reentrantly from tasks the handler spawned.
#[derive(Clone)]
pub struct KeepAlive {
    sink: Arc<dyn KeepAliveSink>,
}

impl KeepAlive {
    pub(crate) fn new(sink: Arc<dyn KeepAliveSink>) -> Self {
        Self { sink }
    }

    /// Keep-alive handle that does nothing; useful when invoking handlers
    /// directly in tests.
    pub fn disabled() -> Self {
        Self { sink: Arc::new(NoopSink) }
    }

    /// Signals that the message is still being worked on.
    ///
    /// Fails with [`Error::Conflict`](crate::Error::Conflict) if the claim
    /// was lost to another worker, in which case the handler should stop.
    pub async fn ping(&self) -> Result<()> {
        self.sink.keep_alive().await
    }
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct NoopSink;

#[async_trait]
impl KeepAliveSink for NoopSink {
    async fn keep_alive(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handler_fn_invokes_closure() {
        let handler = handler_fn(|message: u32, _keep_alive| async move {
            if message == 42 {
                Ok(())
            } else {
                Err("wrong answer".into())
            }
        });

        assert!(handler.handle(42, KeepAlive::disabled()).await.is_ok());
        let err = handler.handle(7, KeepAlive::disabled()).await.unwrap_err();
        assert_eq!(err.to_string(), "wrong answer");
    }

    #[tokio::test]
    async fn disabled_keep_alive_is_inert() {
        let keep_alive = KeepAlive::disabled();
        assert!(keep_alive.ping().await.is_ok());
        assert!(keep_alive.clone().ping().await.is_ok());
    }
}
