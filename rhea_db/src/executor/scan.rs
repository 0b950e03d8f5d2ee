//! Scan operators: full-table sequential scan and the B+tree range scan.
//! Both take the table IS lock once at `begin_tuple`; the shared row locks
//! come from `get_record` as each row is touched.

use strata::btree::{BTree, BTreeScan};
use strata::heap::{HeapFile, HeapScan};
use strata::lock_manager::LockMode;
use strata::Rid;

use super::eval;
use super::{Executor, Record};
use crate::catalog::{ColumnMeta, IndexMeta};
use crate::errors::{Error, Result};
use crate::types::{value_raw, ColType, CompOp, Condition, Rhs};
use crate::Context;

pub struct SeqScanExecutor<'a> {
    ctx: &'a Context<'a>,
    heap: &'a HeapFile,
    cols: Vec<ColumnMeta>,
    len: usize,
    conds: Vec<Condition>,
    scan: Option<HeapScan<'a>>,
    rid: Rid,
}

impl<'a> SeqScanExecutor<'a> {
    pub fn new(ctx: &'a Context<'a>, table: &str, conds: Vec<Condition>) -> Result<Self> {
        let tab = ctx.catalog.table(table)?;
        let heap = ctx.catalog.heap(table)?;
        Ok(Self {
            ctx,
            heap,
            cols: tab.cols.clone(),
            len: tab.record_size() as usize,
            conds,
            scan: None,
            rid: Rid::INVALID,
        })
    }

    /// Walks forward until the current rid satisfies every condition.
    fn advance_to_match(&mut self) -> Result<()> {
        let Self {
            ctx,
            heap,
            cols,
            conds,
            scan,
            rid,
            ..
        } = self;
        let Some(scan) = scan.as_mut() else {
            return Ok(());
        };
        while !scan.is_end() {
            let candidate = scan.rid();
            let rec = heap.get_record(candidate, Some(&ctx.txn_ctx()))?;
            if eval::check_conditions(cols, &rec, conds)? {
                *rid = candidate;
                return Ok(());
            }
            scan.next()?;
        }
        Ok(())
    }
}

impl<'a> Executor for SeqScanExecutor<'a> {
    fn begin_tuple(&mut self) -> Result<()> {
        self.ctx.lock_mgr.lock_table(
            self.ctx.txn,
            self.heap.file_id(),
            LockMode::IntentionShared,
        )?;
        self.scan = Some(self.heap.scan()?);
        self.advance_to_match()
    }

    fn next_tuple(&mut self) -> Result<()> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
        }
        self.advance_to_match()
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn next(&mut self) -> Result<Record> {
        let rec = self.heap.get_record(self.rid, Some(&self.ctx.txn_ctx()))?;
        Ok(Record::new(rec))
    }

    fn cols(&self) -> &[ColumnMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}

/// Range scan over one index. The key range is derived from the equality
/// conditions covering a prefix of the index columns; columns past the
/// bound prefix span their whole domain. All conditions are re-checked
/// against the fetched rows, so non-prefix conjuncts still filter.
pub struct IndexScanExecutor<'a> {
    ctx: &'a Context<'a>,
    heap: &'a HeapFile,
    tree: &'a BTree,
    index: IndexMeta,
    cols: Vec<ColumnMeta>,
    len: usize,
    conds: Vec<Condition>,
    scan: Option<BTreeScan<'a>>,
    rid: Rid,
}

impl<'a> IndexScanExecutor<'a> {
    pub fn new(
        ctx: &'a Context<'a>,
        table: &str,
        index_cols: &[&str],
        conds: Vec<Condition>,
    ) -> Result<Self> {
        let tab = ctx.catalog.table(table)?;
        let index = tab
            .get_index(index_cols)
            .ok_or_else(|| Error::IndexNotFound(index_cols.join("_")))?
            .clone();
        let tree = ctx.catalog.index(&index)?;
        let heap = ctx.catalog.heap(table)?;
        Ok(Self {
            ctx,
            heap,
            tree,
            index,
            cols: tab.cols.clone(),
            len: tab.record_size() as usize,
            conds,
            scan: None,
            rid: Rid::INVALID,
        })
    }

    fn key_bounds(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut lower = Vec::with_capacity(self.index.col_tot_len as usize);
        let mut upper = Vec::with_capacity(self.index.col_tot_len as usize);
        let mut prefix_bound = true;
        for col in &self.index.cols {
            let eq_value = if prefix_bound {
                self.conds.iter().find_map(|c| match &c.rhs {
                    Rhs::Value(v) if c.op == CompOp::Eq && c.lhs_col == col.name => Some(v),
                    _ => None,
                })
            } else {
                None
            };
            match eq_value {
                Some(value) => {
                    let raw = value_raw(value, col.col_type, col.len as usize)?;
                    lower.extend_from_slice(&raw);
                    upper.extend_from_slice(&raw);
                }
                None => {
                    prefix_bound = false;
                    lower.extend_from_slice(&type_min(col.col_type, col.len as usize));
                    upper.extend_from_slice(&type_max(col.col_type, col.len as usize));
                }
            }
        }
        Ok((lower, upper))
    }

    fn advance_to_match(&mut self) -> Result<()> {
        let Self {
            ctx,
            heap,
            cols,
            conds,
            scan,
            rid,
            ..
        } = self;
        let Some(scan) = scan.as_mut() else {
            return Ok(());
        };
        while !scan.is_end() {
            let candidate = scan.rid()?;
            let rec = heap.get_record(candidate, Some(&ctx.txn_ctx()))?;
            if eval::check_conditions(cols, &rec, conds)? {
                *rid = candidate;
                return Ok(());
            }
            scan.next()?;
        }
        Ok(())
    }
}

fn type_min(ty: ColType, len: usize) -> Vec<u8> {
    match ty {
        ColType::Int => i32::MIN.to_ne_bytes().to_vec(),
        ColType::Float => f32::NEG_INFINITY.to_ne_bytes().to_vec(),
        ColType::Str => vec![0x00; len],
    }
}

fn type_max(ty: ColType, len: usize) -> Vec<u8> {
    match ty {
        ColType::Int => i32::MAX.to_ne_bytes().to_vec(),
        ColType::Float => f32::INFINITY.to_ne_bytes().to_vec(),
        ColType::Str => vec![0xff; len],
    }
}

impl<'a> Executor for IndexScanExecutor<'a> {
    fn begin_tuple(&mut self) -> Result<()> {
        self.ctx.lock_mgr.lock_table(
            self.ctx.txn,
            self.heap.file_id(),
            LockMode::IntentionShared,
        )?;
        let (lower, upper) = self.key_bounds()?;
        self.scan = Some(self.tree.scan_range(Some(&lower), Some(&upper))?);
        self.advance_to_match()
    }

    fn next_tuple(&mut self) -> Result<()> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
        }
        self.advance_to_match()
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn next(&mut self) -> Result<Record> {
        let rec = self.heap.get_record(self.rid, Some(&self.ctx.txn_ctx()))?;
        Ok(Record::new(rec))
    }

    fn cols(&self) -> &[ColumnMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}
