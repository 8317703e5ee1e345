//! Optimistic mutation ledger.
//!
//! Every client-originated mutation that is applied locally before the
//! relay confirms it gets an entry here, together with a rollback closure
//! that restores the prior state.  One arena instead of ad hoc flags
//! scattered across screens: the UI can always enumerate what is still
//! unconfirmed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

/// Restores local state if the mutation is rejected.  Runs at most once.
pub type Rollback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Confirmed,
    Failed,
}

struct TrackedEntry {
    kind: String,
    status: EntryStatus,
    resolved_at: Option<Instant>,
    rollback: Option<Rollback>,
}

/// Observable projection of one ledger entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub id: Uuid,
    pub kind: String,
    pub status: EntryStatus,
}

pub struct OptimisticLedger {
    grace: Duration,
    entries: Mutex<HashMap<Uuid, TrackedEntry>>,
}

impl OptimisticLedger {
    /// `grace` is how long confirmed/failed entries stay visible before
    /// being purged.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Track a new pending mutation.  The rollback closure is stored and
    /// invoked only by [`OptimisticLedger::fail`].
    pub fn add(&self, kind: &str, rollback: Rollback) -> Uuid {
        let id = Uuid::new_v4();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut entries, self.grace);
        entries.insert(
            id,
            TrackedEntry {
                kind: kind.to_string(),
                status: EntryStatus::Pending,
                resolved_at: None,
                rollback: Some(rollback),
            },
        );
        id
    }

    /// Mark an entry confirmed; its rollback is dropped unused.
    pub fn confirm(&self, id: Uuid) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(&id) {
            entry.status = EntryStatus::Confirmed;
            entry.resolved_at = Some(Instant::now());
            entry.rollback = None;
        }
    }

    /// Mark an entry failed and run its rollback.
    pub fn fail(&self, id: Uuid) {
        let rollback = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(&id) {
                Some(entry) => {
                    entry.status = EntryStatus::Failed;
                    entry.resolved_at = Some(Instant::now());
                    debug!(id = %id, kind = %entry.kind, "Optimistic mutation failed, rolling back");
                    entry.rollback.take()
                }
                None => None,
            }
        };
        // Run outside the lock: the closure may re-enter the ledger.
        if let Some(rollback) = rollback {
            rollback();
        }
    }

    /// Wrap one mutation: track, run, confirm on success, fail-and-rollback
    /// on error.
    pub async fn with_update<T, E, Fut>(
        &self,
        kind: &str,
        rollback: Rollback,
        op: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let id = self.add(kind, rollback);
        match op.await {
            Ok(value) => {
                self.confirm(id);
                Ok(value)
            }
            Err(e) => {
                self.fail(id);
                Err(e)
            }
        }
    }

    /// Batch variant: each item is tracked and resolved independently, so
    /// one failure rolls back only its own entry.
    pub async fn with_update_batch<T, E, Fut>(
        &self,
        ops: Vec<(String, Rollback, Fut)>,
    ) -> Vec<Result<T, E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let mut results = Vec::with_capacity(ops.len());
        for (kind, rollback, op) in ops {
            results.push(self.with_update(&kind, rollback, op).await);
        }
        results
    }

    pub fn pending_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .count()
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut entries, self.grace);
        entries
            .iter()
            .map(|(id, e)| EntrySnapshot {
                id: *id,
                kind: e.kind.clone(),
                status: e.status,
            })
            .collect()
    }

    fn sweep(entries: &mut HashMap<Uuid, TrackedEntry>, grace: Duration) {
        entries.retain(|_, e| match e.resolved_at {
            Some(at) => at.elapsed() < grace,
            None => true,
        });
    }
}
