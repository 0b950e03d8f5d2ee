//! Transactions: per-transaction state, the in-memory undo log, and the
//! global transaction table.
//!
//! Rollback works from the LIFO `write_set` alone; there is no durable log.
//! The replay itself lives one layer up, where heap and index handles are
//! reachable — this module only manages the records and the lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock_manager::{LockDataId, LockManager};
use crate::Rid;

pub type TxnId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// One undo entry. `Delete` and `Update` carry the before image; reversing
/// an `Insert` only needs the rid.
#[derive(Debug, Clone)]
pub enum WriteRecord {
    Insert {
        table: String,
        rid: Rid,
    },
    Delete {
        table: String,
        rid: Rid,
        record: Vec<u8>,
    },
    Update {
        table: String,
        rid: Rid,
        before: Vec<u8>,
    },
}

#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    start_ts: u64,
    state: Mutex<TxnState>,
    lock_set: Mutex<HashSet<LockDataId>>,
    write_set: Mutex<Vec<WriteRecord>>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn state(&self) -> TxnState {
        *lock_recover(&self.state)
    }

    pub fn set_state(&self, state: TxnState) {
        *lock_recover(&self.state) = state;
    }

    pub fn add_lock(&self, id: LockDataId) {
        lock_recover(&self.lock_set).insert(id);
    }

    pub fn lock_set(&self) -> HashSet<LockDataId> {
        lock_recover(&self.lock_set).clone()
    }

    fn take_locks(&self) -> HashSet<LockDataId> {
        std::mem::take(&mut *lock_recover(&self.lock_set))
    }

    pub fn append_write(&self, record: WriteRecord) {
        lock_recover(&self.write_set).push(record);
    }

    /// Drains the undo list. Callers replay the returned records in reverse
    /// (LIFO) order; after this the list is empty, as the terminal states
    /// require.
    pub fn take_writes(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut *lock_recover(&self.write_set))
    }

    pub fn write_count(&self) -> usize {
        lock_recover(&self.write_set).len()
    }
}

/// Borrowed locking context threaded into heap operations. Absence of a
/// context (undo replay, index builds) skips lock acquisition.
pub struct TxnContext<'a> {
    pub lock_mgr: &'a LockManager,
    pub txn: &'a Transaction,
}

#[derive(Debug, Default)]
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    next_ts: AtomicU64,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let start_ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction {
            id,
            start_ts,
            state: Mutex::new(TxnState::Growing),
            lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
        });
        lock_recover(&self.active).insert(id, txn.clone());
        crate::strata_debug_log!("[TxnManager::begin] started txn {id}");
        txn
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        lock_recover(&self.active).contains_key(&id)
    }

    /// Commit: the undo list is dropped unreplayed, every lock is released,
    /// and the transaction reaches its terminal state.
    pub fn commit(&self, txn: &Transaction, lock_mgr: &LockManager) {
        txn.take_writes();
        self.release_locks(txn, lock_mgr);
        txn.set_state(TxnState::Committed);
        lock_recover(&self.active).remove(&txn.id());
        crate::strata_debug_log!("[TxnManager::commit] committed txn {}", txn.id());
    }

    /// Final half of abort. The caller has already replayed the undo list;
    /// this releases the locks and retires the transaction.
    pub fn conclude_abort(&self, txn: &Transaction, lock_mgr: &LockManager) {
        self.release_locks(txn, lock_mgr);
        txn.set_state(TxnState::Aborted);
        lock_recover(&self.active).remove(&txn.id());
        crate::strata_debug_log!("[TxnManager::abort] aborted txn {}", txn.id());
    }

    fn release_locks(&self, txn: &Transaction, lock_mgr: &LockManager) {
        for id in txn.take_locks() {
            lock_mgr.unlock(txn, id);
        }
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
