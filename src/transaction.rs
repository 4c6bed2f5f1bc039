//! Transaction synchronization contract.
//!
//! Publishing is transactional: pending rows are written inside the host's
//! transaction and the poller is only woken once that transaction commits.
//! Hosts with a real transaction manager implement
//! [`TransactionSynchronizer`] against it; non-transactional hosts use the
//! pass-through [`AutoCommit`].

use std::sync::Mutex;

/// Commit callback registered by the broker.
pub type CommitListener = Box<dyn FnOnce() + Send + 'static>;

/// Bridge to the host application's transaction manager.
pub trait TransactionSynchronizer: Send + Sync + 'static {
    /// Returns `true` if the calling context has an active transaction.
    fn is_in_transaction(&self) -> bool;

    /// Registers a callback to run after the enclosing transaction commits.
    ///
    /// With nested transactions the callback must be deferred to the
    /// outermost commit. Implementations may drop the callback if the
    /// transaction rolls back.
    fn on_commit(&self, listener: CommitListener);
}

/// Pass-through synchronizer for hosts without transactions.
///
/// Every context counts as transactional and commit listeners run
/// immediately, so `publish` behaves like an autocommitted write.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoCommit;

impl AutoCommit {
    /// Creates a new pass-through synchronizer.
    pub fn new() -> Self {
        Self
    }
}

impl TransactionSynchronizer for AutoCommit {
    fn is_in_transaction(&self) -> bool {
        true
    }

    fn on_commit(&self, listener: CommitListener) {
        listener();
    }
}

/// Manually driven synchronizer for tests and simple hosts.
///
/// `begin`/`commit` calls nest; commit listeners collected anywhere inside
/// the nest run once when the outermost level commits. `rollback` unwinds
/// one level and discards pending listeners when the outermost level ends.
#[derive(Debug, Default)]
pub struct ManualTransaction {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    depth: u32,
    listeners: Vec<CommitListener>,
}

impl std::fmt::Debug for ManualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualState")
            .field("depth", &self.depth)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ManualTransaction {
    /// Creates a new synchronizer with no open transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a (possibly nested) transaction.
    pub fn begin(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.depth += 1;
    }

    /// Commits one transaction level; the outermost commit runs all
    /// registered listeners.
    pub fn commit(&self) {
        let listeners = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.depth = state.depth.saturating_sub(1);
            if state.depth == 0 {
                std::mem::take(&mut state.listeners)
            } else {
                Vec::new()
            }
        };
        for listener in listeners {
            listener();
        }
    }

    /// Rolls back one transaction level; the outermost rollback discards
    /// all pending listeners.
    pub fn rollback(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.listeners.clear();
        }
    }
}

impl TransactionSynchronizer for ManualTransaction {
    fn is_in_transaction(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).depth > 0
    }

    fn on_commit(&self, listener: CommitListener) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.depth > 0 {
            state.listeners.push(listener);
        } else {
            drop(state);
            listener();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn auto_commit_runs_listener_immediately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let sync = AutoCommit::new();
        assert!(sync.is_in_transaction());

        let counter = fired.clone();
        sync.on_commit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manual_listeners_fire_on_outer_commit_only() {
        let fired = Arc::new(AtomicUsize::new(0));
        let txn = ManualTransaction::new();

        txn.begin();
        txn.begin(); // nested

        let counter = fired.clone();
        txn.on_commit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        txn.commit(); // inner commit: deferred
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        txn.commit(); // outer commit: fires
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!txn.is_in_transaction());
    }

    #[test]
    fn manual_rollback_discards_listeners() {
        let fired = Arc::new(AtomicUsize::new(0));
        let txn = ManualTransaction::new();

        txn.begin();
        let counter = fired.clone();
        txn.on_commit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        txn.rollback();

        txn.begin();
        txn.commit();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
