//! # Rhea
//! The execution layer of the Rhea database: catalog, typed values, and
//! the volcano executors, wired over the `strata` storage engine.
//!
//! Everything shared hangs off one `Db` value passed explicitly to
//! executors via `Context`; there are no ambient singletons.

pub mod catalog;
pub mod errors;
pub mod executor;
pub mod types;

pub use strata;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::path::Path;
use std::sync::Arc;

use strata::buffer_pool::BufferPoolManager;
use strata::lock_manager::LockManager;
use strata::transaction::{Transaction, TransactionManager, TxnContext, WriteRecord};

use crate::catalog::SysMgr;
use crate::errors::{Error, Result};

pub fn debug_logs_enabled() -> bool {
    std::env::var_os("RHEA_DEBUG_LOG").is_some()
}

#[macro_export]
macro_rules! rhea_debug_log {
    ($($arg:tt)*) => {
        if $crate::debug_logs_enabled() {
            println!($($arg)*);
        }
    };
}

/// Everything an executor needs for one statement: the catalog (read
/// guard held by the caller), the lock manager and the running
/// transaction.
pub struct Context<'a> {
    pub catalog: &'a SysMgr,
    pub lock_mgr: &'a LockManager,
    pub txn: &'a Transaction,
}

impl<'a> Context<'a> {
    pub fn txn_ctx(&self) -> TxnContext<'_> {
        TxnContext {
            lock_mgr: self.lock_mgr,
            txn: self.txn,
        }
    }
}

/// The database context: buffer pool, lock manager, transaction table and
/// catalog. The catalog lock is write-held only by DDL; DML holds it
/// shared for the duration of a statement.
pub struct Db {
    pub lock_mgr: LockManager,
    pub txn_mgr: TransactionManager,
    catalog: RwLock<SysMgr>,
}

impl Db {
    /// Creates a database directory at `home` (named after the database).
    pub fn create(home: &Path) -> Result<Self> {
        let name = home
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Internal("invalid database path".to_string()))?;
        let bpm = Arc::new(BufferPoolManager::new());
        let catalog = SysMgr::create(bpm, home, name)?;
        Ok(Self {
            lock_mgr: LockManager::new(),
            txn_mgr: TransactionManager::new(),
            catalog: RwLock::new(catalog),
        })
    }

    /// Opens an existing database directory, reloading metadata and every
    /// heap/index handle.
    pub fn open(home: &Path) -> Result<Self> {
        let bpm = Arc::new(BufferPoolManager::new());
        let catalog = SysMgr::open(bpm, home)?;
        Ok(Self {
            lock_mgr: LockManager::new(),
            txn_mgr: TransactionManager::new(),
            catalog: RwLock::new(catalog),
        })
    }

    /// Flushes everything and closes the database.
    pub fn close(self) -> Result<()> {
        self.catalog.into_inner().close()
    }

    pub fn catalog(&self) -> RwLockReadGuard<'_, SysMgr> {
        self.catalog.read()
    }

    pub fn catalog_mut(&self) -> RwLockWriteGuard<'_, SysMgr> {
        self.catalog.write()
    }

    pub fn begin(&self) -> Arc<Transaction> {
        self.txn_mgr.begin()
    }

    /// Strict 2PL commit: locks are held until here, the undo list is
    /// discarded.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        self.txn_mgr.commit(txn, &self.lock_mgr);
        Ok(())
    }

    /// Aborts `txn`: replays its undo list in LIFO order against the heap
    /// and symmetrically maintains every index of each touched table, then
    /// releases the locks.
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        let writes = txn.take_writes();
        let replay_result = (|| -> Result<()> {
            let catalog = self.catalog.read();
            for record in writes.into_iter().rev() {
                match record {
                    WriteRecord::Insert { table, rid } => {
                        let tab = catalog.table(&table)?;
                        let heap = catalog.heap(&table)?;
                        let rec = heap.get_record(rid, None)?;
                        for index in &tab.indexes {
                            catalog
                                .index(index)?
                                .delete_entry(&index.key_from_record(&rec))?;
                        }
                        heap.delete_record(rid, None)?;
                    }
                    WriteRecord::Delete { table, rid, record } => {
                        let tab = catalog.table(&table)?;
                        let heap = catalog.heap(&table)?;
                        heap.insert_record_at(rid, &record)?;
                        for index in &tab.indexes {
                            catalog
                                .index(index)?
                                .insert_entry(&index.key_from_record(&record), rid)?;
                        }
                    }
                    WriteRecord::Update { table, rid, before } => {
                        let tab = catalog.table(&table)?;
                        let heap = catalog.heap(&table)?;
                        let current = heap.get_record(rid, None)?;
                        for index in &tab.indexes {
                            let tree = catalog.index(index)?;
                            tree.delete_entry(&index.key_from_record(&current))?;
                            tree.insert_entry(&index.key_from_record(&before), rid)?;
                        }
                        heap.update_record(rid, &before, None)?;
                    }
                }
            }
            Ok(())
        })();

        // Locks are released and the transaction retired even if the
        // replay surfaced an error; the error still reaches the caller.
        self.txn_mgr.conclude_abort(txn, &self.lock_mgr);
        replay_result
    }
}
