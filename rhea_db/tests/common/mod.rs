#![allow(dead_code)]

use tempfile::TempDir;

use rhea_db::catalog::ColumnDef;
use rhea_db::executor::{
    collect, collect_rids, DeleteExecutor, Executor, InsertExecutor, Record, SeqScanExecutor,
    UpdateExecutor,
};
use rhea_db::strata::transaction::Transaction;
use rhea_db::strata::Rid;
use rhea_db::types::{ColType, Condition, SetClause, Value};
use rhea_db::{Context, Db};

pub fn setup_db(name: &str) -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::create(&dir.path().join(name)).unwrap();
    (dir, db)
}

/// The workhorse schema of most scenarios: `t(a INT, b STRING(4))`.
pub fn create_table_t(db: &Db) {
    db.catalog_mut()
        .create_table(
            "t",
            &[
                ColumnDef::new("a", ColType::Int, 4),
                ColumnDef::new("b", ColType::Str, 4),
            ],
        )
        .unwrap();
}

pub fn insert_row(
    db: &Db,
    txn: &Transaction,
    table: &str,
    values: Vec<Value>,
) -> rhea_db::errors::Result<Rid> {
    let catalog = db.catalog();
    let ctx = Context {
        catalog: &catalog,
        lock_mgr: &db.lock_mgr,
        txn,
    };
    let mut exec = InsertExecutor::new(&ctx, table, values)?;
    exec.next()?;
    Ok(exec.rid())
}

pub fn select_where(
    db: &Db,
    txn: &Transaction,
    table: &str,
    conds: Vec<Condition>,
) -> rhea_db::errors::Result<Vec<Record>> {
    let catalog = db.catalog();
    let ctx = Context {
        catalog: &catalog,
        lock_mgr: &db.lock_mgr,
        txn,
    };
    let mut exec = SeqScanExecutor::new(&ctx, table, conds)?;
    collect(&mut exec)
}

pub fn delete_where(
    db: &Db,
    txn: &Transaction,
    table: &str,
    conds: Vec<Condition>,
) -> rhea_db::errors::Result<usize> {
    let catalog = db.catalog();
    let ctx = Context {
        catalog: &catalog,
        lock_mgr: &db.lock_mgr,
        txn,
    };
    let rids = {
        let mut scan = SeqScanExecutor::new(&ctx, table, conds)?;
        collect_rids(&mut scan)?
    };
    let count = rids.len();
    let mut exec = DeleteExecutor::new(&ctx, table, rids)?;
    exec.next()?;
    Ok(count)
}

pub fn update_where(
    db: &Db,
    txn: &Transaction,
    table: &str,
    set_clauses: Vec<SetClause>,
    conds: Vec<Condition>,
) -> rhea_db::errors::Result<usize> {
    let catalog = db.catalog();
    let ctx = Context {
        catalog: &catalog,
        lock_mgr: &db.lock_mgr,
        txn,
    };
    let rids = {
        let mut scan = SeqScanExecutor::new(&ctx, table, conds)?;
        collect_rids(&mut scan)?
    };
    let count = rids.len();
    let mut exec = UpdateExecutor::new(&ctx, table, set_clauses, rids)?;
    exec.next()?;
    Ok(count)
}

pub fn row_int(rec: &Record, offset: usize) -> i32 {
    i32::from_ne_bytes(rec.data[offset..offset + 4].try_into().unwrap())
}

pub fn row_str(rec: &Record, offset: usize, len: usize) -> Vec<u8> {
    rec.data[offset..offset + len].to_vec()
}

/// All `(rid, bytes)` pairs of a table, read without any locking; used to
/// compare database states around rollbacks.
pub fn snapshot_table(db: &Db, table: &str) -> Vec<(Rid, Vec<u8>)> {
    let catalog = db.catalog();
    let heap = catalog.heap(table).unwrap();
    let mut scan = heap.scan().unwrap();
    let mut out = Vec::new();
    while !scan.is_end() {
        let rid = scan.rid();
        out.push((rid, heap.get_record(rid, None).unwrap()));
        scan.next().unwrap();
    }
    out
}

/// Every key currently in the table's first index, decoded as i32.
pub fn index_int_keys(db: &Db, table: &str) -> Vec<i32> {
    let catalog = db.catalog();
    let tab = catalog.table(table).unwrap();
    let tree = catalog.index(&tab.indexes[0]).unwrap();
    let mut scan = tree.scan_range(None, None).unwrap();
    let mut keys = Vec::new();
    while !scan.is_end() {
        let raw = scan.key().unwrap();
        keys.push(i32::from_ne_bytes(raw[..4].try_into().unwrap()));
        scan.next().unwrap();
    }
    keys
}
