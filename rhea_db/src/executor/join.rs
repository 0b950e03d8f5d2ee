//! Nested-loop equi/theta join. The left child is the outer loop; the
//! right child restarts once per outer tuple.

use super::{eval, Executor, Record};
use crate::catalog::ColumnMeta;
use crate::errors::Result;
use crate::types::Condition;

pub struct NestedLoopJoinExecutor<'a> {
    left: Box<dyn Executor + 'a>,
    right: Box<dyn Executor + 'a>,
    conds: Vec<Condition>,
    cols: Vec<ColumnMeta>,
    len: usize,
}

impl<'a> NestedLoopJoinExecutor<'a> {
    /// Output schema is left then right; right columns keep their names
    /// but their offsets shift past the left tuple.
    pub fn new(
        left: Box<dyn Executor + 'a>,
        right: Box<dyn Executor + 'a>,
        conds: Vec<Condition>,
    ) -> Self {
        let left_len = left.tuple_len();
        let mut cols = left.cols().to_vec();
        for col in right.cols() {
            let mut col = col.clone();
            col.offset += left_len as u32;
            cols.push(col);
        }
        let len = left_len + right.tuple_len();
        Self {
            left,
            right,
            conds,
            cols,
            len,
        }
    }

    fn current_pair(&mut self) -> Result<Vec<u8>> {
        let mut data = self.left.next()?.data;
        data.extend(self.right.next()?.data);
        Ok(data)
    }

    /// Advances the inner child, rewinding it and stepping the outer child
    /// at inner end.
    fn step(&mut self) -> Result<()> {
        self.right.next_tuple()?;
        if self.right.is_end() {
            self.left.next_tuple()?;
            if !self.left.is_end() {
                self.right.begin_tuple()?;
            }
        }
        Ok(())
    }

    fn find_match(&mut self) -> Result<()> {
        while !self.is_end() {
            let pair = self.current_pair()?;
            if eval::check_conditions(&self.cols, &pair, &self.conds)? {
                return Ok(());
            }
            self.step()?;
        }
        Ok(())
    }
}

impl<'a> Executor for NestedLoopJoinExecutor<'a> {
    fn begin_tuple(&mut self) -> Result<()> {
        self.left.begin_tuple()?;
        if self.left.is_end() {
            return Ok(());
        }
        self.right.begin_tuple()?;
        self.find_match()
    }

    fn next_tuple(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.step()?;
        self.find_match()
    }

    fn is_end(&self) -> bool {
        self.left.is_end() || self.right.is_end()
    }

    fn next(&mut self) -> Result<Record> {
        self.current_pair().map(Record::new)
    }

    fn cols(&self) -> &[ColumnMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }
}
