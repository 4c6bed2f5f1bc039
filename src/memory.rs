//! In-memory [`Repository`] backed by tokio locks.
//!
//! Useful for tests and single-process embedding. Rows live in publish
//! order, which makes oldest-first claiming a straight scan. Timed-out
//! classification happens on read: rows are stored as processing and
//! reinterpreted once their deadline passes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{
    ConsumerId, MessageDetails, MessageId, ProcessingRecord, ProcessingState, ProcessingStatus,
    ProcessingUpdate, VersionToken,
};
use crate::repository::{ClaimRequest, ClaimedMessage, ProcessingFilter, Repository};
use crate::time::{Clock, RealClock};

/// In-memory repository for tests and single-process use.
#[derive(Debug, Clone)]
pub struct InMemoryRepository {
    inner: Arc<RwLock<Inner>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Inner {
    messages: HashMap<MessageId, StoredMessage>,
    /// Processing rows in publish order.
    rows: Vec<Row>,
}

#[derive(Debug)]
struct StoredMessage {
    details: MessageDetails,
    payload: Bytes,
}

#[derive(Debug)]
struct Row {
    message_id: MessageId,
    consumer: ConsumerId,
    state: ProcessingState,
    retries: u32,
    error_message: Option<String>,
    version: VersionToken,
    updated_at: DateTime<Utc>,
    /// Processing deadline relative to `updated_at`, set when claimed.
    claim_timeout: Option<Duration>,
}

impl Row {
    /// State as seen by readers at `now`. A processing row past its
    /// deadline counts as timed out; nothing is written back.
    fn effective_state(&self, now: DateTime<Utc>) -> ProcessingState {
        if self.state == ProcessingState::Processing {
            if let Some(timeout) = self.claim_timeout {
                let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
                if let Some(deadline) = self.updated_at.checked_add_signed(timeout) {
                    if deadline <= now {
                        return ProcessingState::TimedOut;
                    }
                } // unreachable deadline: never times out
            }
        }
        self.state
    }

    fn status(&self, now: DateTime<Utc>) -> ProcessingStatus {
        ProcessingStatus {
            state: self.effective_state(now),
            retries: self.retries,
            error_message: self.error_message.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

impl Inner {
    fn remove_payload_if_orphaned(&mut self, message_id: MessageId) {
        if !self.rows.iter().any(|r| r.message_id == message_id) {
            self.messages.remove(&message_id);
        }
    }

    fn matches(
        &self,
        row: &Row,
        consumers: &[ConsumerId],
        filter: &ProcessingFilter,
        now: DateTime<Utc>,
    ) -> bool {
        if !consumers.contains(&row.consumer) {
            return false;
        }
        if !filter.states.is_empty() && !filter.states.contains(&row.effective_state(now)) {
            return false;
        }
        if !filter.message_ids.is_empty() && !filter.message_ids.contains(&row.message_id) {
            return false;
        }
        if let Some(after) = filter.updated_after {
            if row.updated_at < after {
                return false;
            }
        }
        if let Some(before) = filter.updated_before {
            if row.updated_at >= before {
                return false;
            }
        }
        if filter.published_after.is_some() || filter.published_before.is_some() {
            let Some(stored) = self.messages.get(&row.message_id) else {
                return false;
            };
            if let Some(after) = filter.published_after {
                if stored.details.published_at < after {
                    return false;
                }
            }
            if let Some(before) = filter.published_before {
                if stored.details.published_at >= before {
                    return false;
                }
            }
        }
        true
    }
}

impl InMemoryRepository {
    /// Creates an empty repository on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock))
    }

    /// Creates an empty repository that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { inner: Arc::new(RwLock::new(Inner::default())), clock }
    }

    /// Number of stored payloads.
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    /// Number of processing rows.
    pub async fn row_count(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    /// Current status of one row, if it still exists.
    pub async fn status_of(
        &self,
        message_id: MessageId,
        consumer: &ConsumerId,
    ) -> Option<ProcessingStatus> {
        let now = self.clock.now_utc();
        let inner = self.inner.read().await;
        inner
            .rows
            .iter()
            .find(|r| r.message_id == message_id && r.consumer == *consumer)
            .map(|r| r.status(now))
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn add(
        &self,
        details: &MessageDetails,
        consumers: &[ConsumerId],
        payload: Bytes,
    ) -> Result<()> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.write().await;
        inner.messages.insert(
            details.message_id,
            StoredMessage { details: details.clone(), payload },
        );
        for consumer in consumers {
            inner.rows.push(Row {
                message_id: details.message_id,
                consumer: consumer.clone(),
                state: ProcessingState::Pending,
                retries: 0,
                error_message: None,
                version: VersionToken::mint(),
                updated_at: now,
                claim_timeout: None,
            });
        }
        Ok(())
    }

    async fn take(&self, requests: &[ClaimRequest]) -> Result<Vec<ClaimedMessage>> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.write().await;
        let mut claimed = Vec::new();

        for request in requests {
            let mut remaining = request.max_count;
            for index in 0..inner.rows.len() {
                if remaining == 0 {
                    break;
                }
                let row = &inner.rows[index];
                if row.consumer != request.consumer {
                    continue;
                }
                let from_state = row.effective_state(now);
                if !matches!(from_state, ProcessingState::Pending | ProcessingState::TimedOut) {
                    continue;
                }
                let Some(stored) = inner.messages.get(&row.message_id) else {
                    continue;
                };
                let details = stored.details.clone();
                let payload = stored.payload.clone();
                let row = &mut inner.rows[index];
                let update = ProcessingUpdate::claim(
                    details,
                    row.consumer.clone(),
                    from_state,
                    row.version,
                    row.retries,
                    row.error_message.clone(),
                    now,
                );
                row.state = ProcessingState::Processing;
                row.version = update.to_version;
                row.updated_at = now;
                row.claim_timeout = Some(request.timeout);
                claimed.push(ClaimedMessage { update, payload });
                remaining -= 1;
            }
        }
        Ok(claimed)
    }

    async fn update(&self, update: &ProcessingUpdate) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(index) = inner.rows.iter().position(|r| {
            r.message_id == update.details.message_id && r.consumer == update.consumer
        }) else {
            return Ok(false);
        };
        if inner.rows[index].version != update.from_version {
            return Ok(false);
        }

        match update.to_state {
            ProcessingState::Completed => {
                let row = inner.rows.remove(index);
                inner.remove_payload_if_orphaned(row.message_id);
            }
            to_state => {
                let row = &mut inner.rows[index];
                row.state = to_state;
                row.retries = update.retries;
                row.error_message = update.error_message.clone();
                row.version = update.to_version;
                row.updated_at = update.updated_at;
            }
        }
        Ok(true)
    }

    async fn find_processing(
        &self,
        consumers: &[ConsumerId],
        filter: &ProcessingFilter,
    ) -> Result<Vec<ProcessingRecord>> {
        let now = self.clock.now_utc();
        let inner = self.inner.read().await;
        let records = inner
            .rows
            .iter()
            .filter(|row| inner.matches(row, consumers, filter, now))
            .filter_map(|row| {
                let stored = inner.messages.get(&row.message_id)?;
                Some(ProcessingRecord {
                    details: stored.details.clone(),
                    consumer: row.consumer.clone(),
                    status: row.status(now),
                })
            })
            .collect();
        Ok(records)
    }

    async fn count_by_consumer(
        &self,
        consumers: &[ConsumerId],
        filter: &ProcessingFilter,
    ) -> Result<HashMap<ConsumerId, u64>> {
        let now = self.clock.now_utc();
        let inner = self.inner.read().await;
        let mut counts: HashMap<ConsumerId, u64> =
            consumers.iter().map(|c| (c.clone(), 0)).collect();
        for row in &inner.rows {
            if inner.matches(row, consumers, filter, now) {
                *counts.entry(row.consumer.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn delete_processing(
        &self,
        consumers: &[ConsumerId],
        filter: &ProcessingFilter,
    ) -> Result<u64> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.write().await;

        let doomed: Vec<usize> = inner
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| inner.matches(row, consumers, filter, now))
            .map(|(i, _)| i)
            .collect();

        let mut orphan_candidates = Vec::new();
        for index in doomed.iter().rev() {
            let row = inner.rows.remove(*index);
            orphan_candidates.push(row.message_id);
        }
        for message_id in orphan_candidates {
            inner.remove_payload_if_orphaned(message_id);
        }
        Ok(doomed.len() as u64)
    }
}
