//! Volcano-model executors. Every operator exposes the same pull
//! interface; the planner (external to this crate) composes them into a
//! tree whose leaves scan the heap.
//!
//! The mutating operators implement the same trait: their `next()` call
//! performs the whole statement (the rid list was collected up front by a
//! scan) and then reports end-of-stream.

pub mod dml;
pub mod eval;
pub mod join;
pub mod projection;
pub mod scan;

pub use dml::{DeleteExecutor, InsertExecutor, UpdateExecutor};
pub use join::NestedLoopJoinExecutor;
pub use projection::ProjectionExecutor;
pub use scan::{IndexScanExecutor, SeqScanExecutor};

use strata::Rid;

use crate::catalog::ColumnMeta;
use crate::errors::Result;

/// One materialized tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

pub trait Executor {
    /// Positions the operator on the first qualifying tuple (or the end).
    fn begin_tuple(&mut self) -> Result<()>;

    /// Advances to the next qualifying tuple.
    fn next_tuple(&mut self) -> Result<()>;

    /// True iff the position is past the last tuple.
    fn is_end(&self) -> bool;

    /// Materializes the current tuple.
    fn next(&mut self) -> Result<Record>;

    /// Output schema of this operator.
    fn cols(&self) -> &[ColumnMeta];

    /// Width in bytes of one output tuple.
    fn tuple_len(&self) -> usize;

    /// Heap address of the current tuple, when the operator has one.
    fn rid(&self) -> Rid {
        Rid::INVALID
    }
}

/// Runs a full pass over `exec`, materializing every qualifying tuple.
pub fn collect(exec: &mut dyn Executor) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    exec.begin_tuple()?;
    while !exec.is_end() {
        out.push(exec.next()?);
        exec.next_tuple()?;
    }
    Ok(out)
}

/// Runs a full pass over `exec`, collecting the rid of every qualifying
/// tuple. This is how DML statements gather their target rows before the
/// mutating executor runs.
pub fn collect_rids(exec: &mut dyn Executor) -> Result<Vec<Rid>> {
    let mut out = Vec::new();
    exec.begin_tuple()?;
    while !exec.is_end() {
        out.push(exec.rid());
        exec.next_tuple()?;
    }
    Ok(out)
}
