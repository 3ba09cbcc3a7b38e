//! Delayed deletion of remote table files
//!
//! A deleted table file is removed only after a grace period. Recreating the
//! same name in the meantime cancels the pending removal so that the new
//! bytes are never destroyed by a deletion issued for the previous file.
//! A removal that has already started stays registered until it finishes;
//! cancelling it waits for it instead of racing it.

use crate::error::Result;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Work performed when a pending deletion falls due
pub type DeletionAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct PendingDeletion {
    token: u64,
    scheduled_at: Instant,
    in_flight: bool,
    finished: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl PendingDeletion {
    fn abort(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

/// Outcome of cancelling a deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// Nothing was scheduled under the name
    NotPending,
    /// The deletion was still waiting out its grace period and will not run
    Cancelled,
    /// The deletion had already started; it has now finished
    Completed,
}

/// Pending deletions keyed by name, at most one per name
pub struct DeletionLedger {
    grace: Duration,
    pending: Arc<DashMap<String, PendingDeletion>>,
    next_token: AtomicU64,
}

impl DeletionLedger {
    /// Create a ledger with the given grace period
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Grace period between request and removal
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Schedule `action` to run for `name` once the grace period elapses
    ///
    /// An earlier deletion of the same name that is still waiting is
    /// superseded. One that is already running is left to finish.
    pub fn schedule(&self, name: &str, action: DeletionAction) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (finished_tx, finished_rx) = watch::channel(false);
        let entry = PendingDeletion {
            token,
            scheduled_at: Instant::now(),
            in_flight: false,
            finished: finished_rx,
            task: None,
        };
        if let Some(previous) = self.pending.insert(name.to_string(), entry) {
            if previous.in_flight {
                debug!(file = %name, "Deletion rescheduled while the previous one runs");
            } else {
                debug!(file = %name, "Pending deletion superseded");
                previous.abort();
            }
        }

        let pending = self.pending.clone();
        let key = name.to_string();
        let grace = self.grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match pending.get_mut(&key) {
                Some(mut entry) if entry.token == token => entry.in_flight = true,
                _ => return,
            }
            match action().await {
                Ok(()) => debug!(file = %key, "Delayed deletion completed"),
                Err(e) if e.is_not_found() => debug!(file = %key, "Delayed deletion target already gone"),
                Err(e) => warn!(file = %key, error = %e, "Delayed deletion failed"),
            }
            pending.remove_if(&key, |_, p| p.token == token);
            let _ = finished_tx.send(true);
        });

        if let Some(mut entry) = self.pending.get_mut(name) {
            if entry.token == token {
                entry.task = Some(task);
            }
        }
    }

    /// Cancel the deletion of `name`
    ///
    /// A deletion still inside its grace period is dropped. One that has
    /// already started cannot be undone, so this waits for it to finish
    /// before returning; afterwards the name is free to be written again.
    pub async fn cancel(&self, name: &str) -> Cancellation {
        if let Some((_, pending)) = self.pending.remove_if(name, |_, p| !p.in_flight) {
            debug!(
                file = %name,
                after = ?pending.scheduled_at.elapsed(),
                "Pending deletion cancelled by recreate"
            );
            pending.abort();
            return Cancellation::Cancelled;
        }

        let mut finished = match self.pending.get(name) {
            Some(pending) => pending.finished.clone(),
            None => return Cancellation::NotPending,
        };
        debug!(file = %name, "Waiting for in-flight deletion");
        // An aborted task drops its sender, which also ends the wait.
        let _ = finished.wait_for(|done| *done).await;
        Cancellation::Completed
    }

    /// Whether a deletion of `name` is pending or running
    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    /// Number of pending deletions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending deletion without running it; returns how many
    pub fn abandon_all(&self) -> usize {
        let names: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut abandoned = 0;
        for name in names {
            if let Some((_, pending)) = self.pending.remove(&name) {
                pending.abort();
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(count = abandoned, "Abandoned pending deletions");
        }
        abandoned
    }
}

impl Drop for DeletionLedger {
    fn drop(&mut self) {
        for entry in self.pending.iter_mut() {
            if let Some(task) = entry.task.as_ref() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> DeletionAction {
        let counter = counter.clone();
        Box::new(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_deletion_runs_after_grace() {
        let ledger = DeletionLedger::new(Duration::from_millis(30));
        let runs = Arc::new(AtomicUsize::new(0));
        ledger.schedule("000010.sst", counting(&runs));

        assert!(ledger.is_pending("000010.sst"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_prevents_deletion() {
        let ledger = DeletionLedger::new(Duration::from_millis(30));
        let runs = Arc::new(AtomicUsize::new(0));
        ledger.schedule("000010.sst", counting(&runs));

        assert_eq!(ledger.cancel("000010.sst").await, Cancellation::Cancelled);
        assert_eq!(ledger.cancel("000010.sst").await, Cancellation::NotPending);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_running_deletion() {
        let ledger = DeletionLedger::new(Duration::from_millis(10));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        ledger.schedule(
            "000012.sst",
            Box::new(move || {
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(ledger.is_pending("000012.sst"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        assert_eq!(ledger.cancel("000012.sst").await, Cancellation::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!ledger.is_pending("000012.sst"));
    }

    #[tokio::test]
    async fn test_reschedule_supersedes_previous() {
        let ledger = DeletionLedger::new(Duration::from_millis(30));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        ledger.schedule("000011.sst", counting(&first));
        ledger.schedule("000011.sst", counting(&second));
        assert_eq!(ledger.len(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandon_all() {
        let ledger = DeletionLedger::new(Duration::from_millis(30));
        let runs = Arc::new(AtomicUsize::new(0));
        ledger.schedule("a.sst", counting(&runs));
        ledger.schedule("b.sst", counting(&runs));
        assert_eq!(ledger.abandon_all(), 2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
