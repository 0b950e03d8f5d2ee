//! Column projection. Selected columns are repacked contiguously, with
//! offsets reassigned from zero.

use strata::Rid;

use super::{Executor, Record};
use crate::catalog::ColumnMeta;
use crate::errors::Result;

pub struct ProjectionExecutor<'a> {
    child: Box<dyn Executor + 'a>,
    // index into the child's schema, per output column
    sel: Vec<usize>,
    cols: Vec<ColumnMeta>,
    len: usize,
}

impl<'a> ProjectionExecutor<'a> {
    pub fn new(child: Box<dyn Executor + 'a>, sel_cols: &[&str]) -> Result<Self> {
        let mut sel = Vec::with_capacity(sel_cols.len());
        let mut cols = Vec::with_capacity(sel_cols.len());
        let mut offset = 0;
        for name in sel_cols {
            let idx = child
                .cols()
                .iter()
                .position(|c| c.name == *name)
                .ok_or_else(|| crate::errors::Error::ColumnNotFound(name.to_string()))?;
            let mut col = child.cols()[idx].clone();
            col.offset = offset;
            offset += col.len;
            sel.push(idx);
            cols.push(col);
        }
        Ok(Self {
            child,
            sel,
            cols,
            len: offset as usize,
        })
    }
}

impl<'a> Executor for ProjectionExecutor<'a> {
    fn begin_tuple(&mut self) -> Result<()> {
        self.child.begin_tuple()
    }

    fn next_tuple(&mut self) -> Result<()> {
        self.child.next_tuple()
    }

    fn is_end(&self) -> bool {
        self.child.is_end()
    }

    fn next(&mut self) -> Result<Record> {
        let rec = self.child.next()?;
        let mut out = vec![0u8; self.len];
        for (out_col, &child_idx) in self.cols.iter().zip(&self.sel) {
            let src = &self.child.cols()[child_idx];
            let from = src.offset as usize;
            let to = out_col.offset as usize;
            out[to..to + out_col.len as usize]
                .copy_from_slice(&rec.data[from..from + src.len as usize]);
        }
        Ok(Record::new(out))
    }

    fn cols(&self) -> &[ColumnMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn rid(&self) -> Rid {
        self.child.rid()
    }
}
