//! Multi-granularity lock manager with no-wait conflict resolution.
//!
//! Locks are taken on tables and on individual records, with the usual
//! IS/IX/S/SIX/X mode hierarchy. A request that cannot be granted
//! immediately is refused outright (`DeadlockPrevention`), so no wait
//! cycles can ever form.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::transaction::{Transaction, TxnId, TxnState};
use crate::{FileId, Rid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// A lockable entity: a whole table file, or one record within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table(FileId),
    Record(FileId, Rid),
}

#[derive(Debug)]
pub enum LockError {
    /// The transaction already released a lock and may not acquire new ones.
    LockOnShrinking(TxnId),
    /// The request conflicts with a granted lock; no-wait aborts the requester.
    DeadlockPrevention(TxnId),
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

/// All requests on one `LockDataId`. Under no-wait every queued request is
/// granted, so `group_mode` is simply the lattice join of every mode here.
/// An empty queue (`group_mode == None`) is left in the table.
#[derive(Debug, Default)]
struct LockQueue {
    requests: Vec<LockRequest>,
    group_mode: Option<LockMode>,
}

impl LockQueue {
    fn recompute_group_mode(&mut self) {
        self.group_mode = self.requests.iter().map(|r| r.mode).reduce(join);
    }
}

/// True iff locks of mode `a` and `b` may be held by different transactions
/// at the same time.
fn compatible(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    match (a, b) {
        (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
        (IntentionShared, _) | (_, IntentionShared) => true,
        (IntentionExclusive, IntentionExclusive) => true,
        (Shared, Shared) => true,
        _ => false,
    }
}

/// True iff holding `a` already satisfies a request for `b`.
fn covers(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    match (a, b) {
        (x, y) if x == y => true,
        (Exclusive, _) => true,
        (SharedIntentionExclusive, Shared)
        | (SharedIntentionExclusive, IntentionExclusive)
        | (SharedIntentionExclusive, IntentionShared) => true,
        (Shared, IntentionShared) => true,
        (IntentionExclusive, IntentionShared) => true,
        _ => false,
    }
}

/// Least upper bound in the mode lattice; the only incomparable pair is
/// `{S, IX}`, whose join is SIX.
fn join(a: LockMode, b: LockMode) -> LockMode {
    if covers(a, b) {
        a
    } else if covers(b, a) {
        b
    } else {
        LockMode::SharedIntentionExclusive
    }
}

/// The lock table. One mutex guards the map and every queue in it; all
/// critical sections are short and never block on I/O.
#[derive(Debug, Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockQueue>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_table(
        &self,
        txn: &Transaction,
        file: FileId,
        mode: LockMode,
    ) -> Result<(), LockError> {
        self.acquire(txn, LockDataId::Table(file), mode)
    }

    pub fn lock_record(
        &self,
        txn: &Transaction,
        file: FileId,
        rid: Rid,
        mode: LockMode,
    ) -> Result<(), LockError> {
        self.acquire(txn, LockDataId::Record(file, rid), mode)
    }

    fn acquire(
        &self,
        txn: &Transaction,
        id: LockDataId,
        mode: LockMode,
    ) -> Result<(), LockError> {
        if txn.state() == TxnState::Shrinking {
            return Err(LockError::LockOnShrinking(txn.id()));
        }

        let mut lock_table = lock_recover(&self.lock_table);
        let queue = lock_table.entry(id).or_default();

        if let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
        {
            let held = queue.requests[pos].mode;
            if covers(held, mode) {
                return Ok(());
            }
            // Upgrade in place: the joined mode must still be compatible
            // with every other granted request.
            let target = join(held, mode);
            let conflicting = queue
                .requests
                .iter()
                .enumerate()
                .any(|(i, r)| i != pos && !compatible(target, r.mode));
            if conflicting {
                return Err(LockError::DeadlockPrevention(txn.id()));
            }
            queue.requests[pos].mode = target;
            queue.recompute_group_mode();
            return Ok(());
        }

        if let Some(group) = queue.group_mode {
            if !compatible(group, mode) {
                return Err(LockError::DeadlockPrevention(txn.id()));
            }
        }

        queue.requests.push(LockRequest {
            txn_id: txn.id(),
            mode,
        });
        queue.group_mode = Some(match queue.group_mode {
            Some(g) => join(g, mode),
            None => mode,
        });
        txn.add_lock(id);
        Ok(())
    }

    /// Removes `txn`'s request on `id` and moves the transaction into its
    /// shrinking phase. Returns false if no such request was held.
    pub fn unlock(&self, txn: &Transaction, id: LockDataId) -> bool {
        let mut lock_table = lock_recover(&self.lock_table);
        let Some(queue) = lock_table.get_mut(&id) else {
            return false;
        };
        let before = queue.requests.len();
        queue.requests.retain(|r| r.txn_id != txn.id());
        if queue.requests.len() == before {
            return false;
        }
        queue.recompute_group_mode();
        txn.set_state(TxnState::Shrinking);
        true
    }

    #[cfg(test)]
    fn group_mode(&self, id: LockDataId) -> Option<LockMode> {
        lock_recover(&self.lock_table)
            .get(&id)
            .and_then(|q| q.group_mode)
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
