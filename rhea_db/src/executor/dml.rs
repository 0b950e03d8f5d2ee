//! The mutating operators. Each takes the table IX lock up front, then for
//! every touched record keeps the ordering contract: heap write, undo
//! entry, index maintenance — so that abort can reverse index changes from
//! the record images alone.

use strata::heap::HeapFile;
use strata::lock_manager::LockMode;
use strata::transaction::WriteRecord;
use strata::Rid;

use super::{Executor, Record};
use crate::catalog::{ColumnMeta, TableMeta};
use crate::errors::{Error, Result};
use crate::types::{SetClause, Value};
use crate::Context;

pub struct InsertExecutor<'a> {
    ctx: &'a Context<'a>,
    heap: &'a HeapFile,
    tab: TableMeta,
    values: Vec<Value>,
    rid: Rid,
    done: bool,
}

impl<'a> std::fmt::Debug for InsertExecutor<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertExecutor")
            .field("tab", &self.tab)
            .field("values", &self.values)
            .field("rid", &self.rid)
            .field("done", &self.done)
            .finish()
    }
}

impl<'a> InsertExecutor<'a> {
    pub fn new(ctx: &'a Context<'a>, table: &str, values: Vec<Value>) -> Result<Self> {
        let tab = ctx.catalog.table(table)?.clone();
        if values.len() != tab.cols.len() {
            return Err(Error::InvalidValueCount {
                expected: tab.cols.len(),
                given: values.len(),
            });
        }
        let heap = ctx.catalog.heap(table)?;
        Ok(Self {
            ctx,
            heap,
            tab,
            values,
            rid: Rid::INVALID,
            done: false,
        })
    }
}

impl<'a> Executor for InsertExecutor<'a> {
    fn begin_tuple(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_tuple(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.done
    }

    /// Serializes the values, inserts the record, logs the undo entry, then
    /// inserts one entry into every index of the table.
    fn next(&mut self) -> Result<Record> {
        self.ctx.lock_mgr.lock_table(
            self.ctx.txn,
            self.heap.file_id(),
            LockMode::IntentionExclusive,
        )?;

        let mut rec = vec![0u8; self.tab.record_size() as usize];
        for (col, value) in self.tab.cols.iter().zip(&self.values) {
            if value.col_type() != col.col_type {
                return Err(Error::IncompatibleType {
                    expected: col.col_type,
                    given: value.col_type(),
                });
            }
            let off = col.offset as usize;
            value.write_to(&mut rec[off..off + col.len as usize]);
        }

        self.rid = self.heap.insert_record(&rec, Some(&self.ctx.txn_ctx()))?;
        self.ctx.txn.append_write(WriteRecord::Insert {
            table: self.tab.name.clone(),
            rid: self.rid,
        });

        for index in &self.tab.indexes {
            let tree = self.ctx.catalog.index(index)?;
            tree.insert_entry(&index.key_from_record(&rec), self.rid)?;
        }

        self.done = true;
        Ok(Record::new(rec))
    }

    fn cols(&self) -> &[ColumnMeta] {
        &self.tab.cols
    }

    fn tuple_len(&self) -> usize {
        self.tab.record_size() as usize
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}

pub struct DeleteExecutor<'a> {
    ctx: &'a Context<'a>,
    heap: &'a HeapFile,
    tab: TableMeta,
    rids: Vec<Rid>,
    done: bool,
}

impl<'a> DeleteExecutor<'a> {
    pub fn new(ctx: &'a Context<'a>, table: &str, rids: Vec<Rid>) -> Result<Self> {
        let tab = ctx.catalog.table(table)?.clone();
        let heap = ctx.catalog.heap(table)?;
        Ok(Self {
            ctx,
            heap,
            tab,
            rids,
            done: false,
        })
    }
}

impl<'a> Executor for DeleteExecutor<'a> {
    fn begin_tuple(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_tuple(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.done
    }

    /// For each target rid: read the record (its key material dies with
    /// it), log the before image, drop every index entry, then delete from
    /// the heap.
    fn next(&mut self) -> Result<Record> {
        self.ctx.lock_mgr.lock_table(
            self.ctx.txn,
            self.heap.file_id(),
            LockMode::IntentionExclusive,
        )?;

        for &rid in &self.rids {
            let rec = self.heap.get_record(rid, Some(&self.ctx.txn_ctx()))?;
            self.ctx.txn.append_write(WriteRecord::Delete {
                table: self.tab.name.clone(),
                rid,
                record: rec.clone(),
            });
            for index in &self.tab.indexes {
                let tree = self.ctx.catalog.index(index)?;
                tree.delete_entry(&index.key_from_record(&rec))?;
            }
            self.heap.delete_record(rid, Some(&self.ctx.txn_ctx()))?;
        }

        self.done = true;
        Ok(Record::new(Vec::new()))
    }

    fn cols(&self) -> &[ColumnMeta] {
        &self.tab.cols
    }

    fn tuple_len(&self) -> usize {
        self.tab.record_size() as usize
    }
}

pub struct UpdateExecutor<'a> {
    ctx: &'a Context<'a>,
    heap: &'a HeapFile,
    tab: TableMeta,
    set_clauses: Vec<SetClause>,
    rids: Vec<Rid>,
    done: bool,
}

impl<'a> UpdateExecutor<'a> {
    pub fn new(
        ctx: &'a Context<'a>,
        table: &str,
        set_clauses: Vec<SetClause>,
        rids: Vec<Rid>,
    ) -> Result<Self> {
        let tab = ctx.catalog.table(table)?.clone();
        let heap = ctx.catalog.heap(table)?;
        Ok(Self {
            ctx,
            heap,
            tab,
            set_clauses,
            rids,
            done: false,
        })
    }
}

impl<'a> Executor for UpdateExecutor<'a> {
    fn begin_tuple(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_tuple(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.done
    }

    /// For each target rid: log the before image, build the new record by
    /// overwriting the SET columns in a copy, refresh every index whose
    /// columns intersect the SET list, then overwrite the heap record.
    fn next(&mut self) -> Result<Record> {
        self.ctx.lock_mgr.lock_table(
            self.ctx.txn,
            self.heap.file_id(),
            LockMode::IntentionExclusive,
        )?;

        let set_names: Vec<&str> = self.set_clauses.iter().map(|s| s.col.as_str()).collect();
        for &rid in &self.rids {
            let old_rec = self.heap.get_record(rid, Some(&self.ctx.txn_ctx()))?;
            self.ctx.txn.append_write(WriteRecord::Update {
                table: self.tab.name.clone(),
                rid,
                before: old_rec.clone(),
            });

            let mut new_rec = old_rec.clone();
            for clause in &self.set_clauses {
                let col = self.tab.get_col(&clause.col)?;
                if clause.value.col_type() != col.col_type {
                    return Err(Error::IncompatibleType {
                        expected: col.col_type,
                        given: clause.value.col_type(),
                    });
                }
                let off = col.offset as usize;
                clause.value.write_to(&mut new_rec[off..off + col.len as usize]);
            }

            for index in &self.tab.indexes {
                if !index.touches_any(&set_names) {
                    continue;
                }
                let tree = self.ctx.catalog.index(index)?;
                tree.delete_entry(&index.key_from_record(&old_rec))?;
                tree.insert_entry(&index.key_from_record(&new_rec), rid)?;
            }

            self.heap
                .update_record(rid, &new_rec, Some(&self.ctx.txn_ctx()))?;
        }

        self.done = true;
        Ok(Record::new(Vec::new()))
    }

    fn cols(&self) -> &[ColumnMeta] {
        &self.tab.cols
    }

    fn tuple_len(&self) -> usize {
        self.tab.record_size() as usize
    }
}
