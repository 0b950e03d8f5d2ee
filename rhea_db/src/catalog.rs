//! The system catalog: table/column/index metadata, the open handle
//! registries, and DDL. Metadata lives in memory and is flushed to
//! `db.meta` (JSON) inside the database directory after every DDL; each
//! table owns a heap file named after it and one index file per index.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata::btree::{BTree, IndexSchema};
use strata::buffer_pool::BufferPoolManager;
use strata::heap::HeapFile;
use strata::lock_manager::LockMode;
use strata::transaction::TxnContext;

use crate::errors::{Error, Result};
use crate::types::ColType;

pub const DB_META_NAME: &str = "db.meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub table: String,
    pub name: String,
    pub col_type: ColType,
    pub len: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub table: String,
    pub cols: Vec<ColumnMeta>,
    pub col_tot_len: u32,
}

impl IndexMeta {
    pub fn col_names(&self) -> Vec<&str> {
        self.cols.iter().map(|c| c.name.as_str()).collect()
    }

    /// Concatenates the index columns of a row image into a key.
    pub fn key_from_record(&self, rec: &[u8]) -> Vec<u8> {
        let mut key = BytesMut::with_capacity(self.col_tot_len as usize);
        for col in &self.cols {
            let off = col.offset as usize;
            key.put_slice(&rec[off..off + col.len as usize]);
        }
        key.to_vec()
    }

    pub fn schema(&self) -> IndexSchema {
        IndexSchema::new(
            self.cols
                .iter()
                .map(|c| (c.col_type.key_col_type(), c.len))
                .collect(),
        )
    }

    /// True when any index column appears in `col_names`.
    pub fn touches_any(&self, col_names: &[&str]) -> bool {
        self.cols.iter().any(|c| col_names.contains(&c.name.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub cols: Vec<ColumnMeta>,
    pub indexes: Vec<IndexMeta>,
}

impl TableMeta {
    pub fn get_col(&self, name: &str) -> Result<&ColumnMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    pub fn record_size(&self) -> u32 {
        self.cols.iter().map(|c| c.len).sum()
    }

    pub fn get_index(&self, col_names: &[&str]) -> Option<&IndexMeta> {
        self.indexes
            .iter()
            .find(|ix| ix.col_names() == col_names)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DbMeta {
    pub name: String,
    pub tabs: HashMap<String, TableMeta>,
}

/// One column of a CREATE TABLE statement. `len` is the declared width for
/// strings; ints and floats are always four bytes.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColType,
    pub len: u32,
}

impl ColumnDef {
    pub fn new(name: &str, col_type: ColType, len: u32) -> Self {
        let len = match col_type {
            ColType::Int | ColType::Float => 4,
            ColType::Str => len,
        };
        Self {
            name: name.to_string(),
            col_type,
            len,
        }
    }
}

/// Index file name: `<table>_<col1>_<col2>_..._.idx`.
pub fn index_file_name(table: &str, col_names: &[&str]) -> String {
    let mut name = table.to_string();
    for col in col_names {
        name.push('_');
        name.push_str(col);
    }
    name.push_str("_.idx");
    name
}

/// The system manager: owns every open heap and index handle. Executors
/// borrow handles for the duration of a statement; only DDL mutates the
/// registries, under the database context's catalog lock.
pub struct SysMgr {
    home: PathBuf,
    bpm: Arc<BufferPoolManager>,
    db: DbMeta,
    fhs: HashMap<String, HeapFile>,
    ihs: HashMap<String, BTree>,
}

impl SysMgr {
    /// Creates the database directory and an empty `db.meta` inside it.
    pub fn create(bpm: Arc<BufferPoolManager>, home: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(home)?;
        let mgr = Self {
            home: home.to_path_buf(),
            bpm,
            db: DbMeta {
                name: name.to_string(),
                tabs: HashMap::new(),
            },
            fhs: HashMap::new(),
            ihs: HashMap::new(),
        };
        mgr.flush_meta()?;
        Ok(mgr)
    }

    /// Loads `db.meta` and reopens every table's heap file and every
    /// index file.
    pub fn open(bpm: Arc<BufferPoolManager>, home: &Path) -> Result<Self> {
        let raw = fs::read_to_string(home.join(DB_META_NAME))?;
        let db: DbMeta =
            serde_json::from_str(&raw).map_err(|e| Error::Internal(e.to_string()))?;

        let mut fhs = HashMap::new();
        let mut ihs = HashMap::new();
        for (tab_name, tab) in &db.tabs {
            let heap = HeapFile::open(bpm.clone(), home.join(tab_name))?;
            fhs.insert(tab_name.clone(), heap);
            for index in &tab.indexes {
                let ix_name = index_file_name(tab_name, &index.col_names());
                let tree = BTree::open(bpm.clone(), home.join(&ix_name))?;
                ihs.insert(ix_name, tree);
            }
        }
        Ok(Self {
            home: home.to_path_buf(),
            bpm,
            db,
            fhs,
            ihs,
        })
    }

    pub fn flush_meta(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.db)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let mut file = fs::File::create(self.home.join(DB_META_NAME))?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Flushes metadata and closes every handle.
    pub fn close(&mut self) -> Result<()> {
        self.flush_meta()?;
        for (_, heap) in self.fhs.drain() {
            heap.close()?;
        }
        for (_, tree) in self.ihs.drain() {
            tree.close()?;
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Result<&TableMeta> {
        self.db
            .tabs
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.db.tabs.values()
    }

    pub fn heap(&self, table: &str) -> Result<&HeapFile> {
        self.fhs
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    pub fn index(&self, index: &IndexMeta) -> Result<&BTree> {
        let ix_name = index_file_name(&index.table, &index.col_names());
        self.ihs
            .get(&ix_name)
            .ok_or(Error::IndexNotFound(ix_name))
    }

    pub fn create_table(&mut self, name: &str, col_defs: &[ColumnDef]) -> Result<()> {
        if self.db.tabs.contains_key(name) {
            return Err(Error::TableExists(name.to_string()));
        }
        let mut cols = Vec::with_capacity(col_defs.len());
        let mut offset = 0;
        for def in col_defs {
            cols.push(ColumnMeta {
                table: name.to_string(),
                name: def.name.clone(),
                col_type: def.col_type,
                len: def.len,
                offset,
            });
            offset += def.len;
        }
        let heap = HeapFile::create(self.bpm.clone(), self.home.join(name), offset)?;
        self.fhs.insert(name.to_string(), heap);
        self.db.tabs.insert(
            name.to_string(),
            TableMeta {
                name: name.to_string(),
                cols,
                indexes: Vec::new(),
            },
        );
        self.flush_meta()
    }

    /// Drops a table, its heap file and all its index files. Takes the
    /// table X lock when a transaction context is present.
    pub fn drop_table(&mut self, name: &str, ctx: Option<&TxnContext>) -> Result<()> {
        let tab = self
            .db
            .tabs
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?
            .clone();

        if let (Some(ctx), Some(heap)) = (ctx, self.fhs.get(name)) {
            ctx.lock_mgr
                .lock_table(ctx.txn, heap.file_id(), LockMode::Exclusive)?;
        }

        for index in &tab.indexes {
            let ix_name = index_file_name(name, &index.col_names());
            if let Some(tree) = self.ihs.remove(&ix_name) {
                tree.close()?;
            }
            fs::remove_file(self.home.join(&ix_name))?;
        }
        if let Some(heap) = self.fhs.remove(name) {
            heap.close()?;
        }
        fs::remove_file(self.home.join(name))?;
        self.db.tabs.remove(name);
        self.flush_meta()
    }

    /// Creates an index over `col_names` and back-fills it with one entry
    /// per live record of the table.
    pub fn create_index(
        &mut self,
        table: &str,
        col_names: &[&str],
        ctx: Option<&TxnContext>,
    ) -> Result<()> {
        let tab = self.table(table)?;
        if tab.get_index(col_names).is_some() {
            return Err(Error::IndexExists(index_file_name(table, col_names)));
        }
        let mut cols = Vec::with_capacity(col_names.len());
        let mut col_tot_len = 0;
        for name in col_names {
            let col = tab.get_col(name)?.clone();
            col_tot_len += col.len;
            cols.push(col);
        }
        let index = IndexMeta {
            table: table.to_string(),
            cols,
            col_tot_len,
        };

        let heap = self.heap(table)?;
        if let Some(ctx) = ctx {
            ctx.lock_mgr
                .lock_table(ctx.txn, heap.file_id(), LockMode::IntentionExclusive)?;
        }

        let ix_name = index_file_name(table, col_names);
        let tree = BTree::create(self.bpm.clone(), self.home.join(&ix_name), index.schema())?;

        // Back-fill from the existing heap contents.
        let mut scan = heap.scan()?;
        while !scan.is_end() {
            let rid = scan.rid();
            let rec = heap.get_record(rid, None)?;
            tree.insert_entry(&index.key_from_record(&rec), rid)?;
            scan.next()?;
        }

        self.ihs.insert(ix_name, tree);
        self.db
            .tabs
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?
            .indexes
            .push(index);
        self.flush_meta()
    }

    pub fn drop_index(
        &mut self,
        table: &str,
        col_names: &[&str],
        ctx: Option<&TxnContext>,
    ) -> Result<()> {
        let tab = self.table(table)?;
        if tab.get_index(col_names).is_none() {
            return Err(Error::IndexNotFound(index_file_name(table, col_names)));
        }

        if let Some(ctx) = ctx {
            let heap = self.heap(table)?;
            ctx.lock_mgr
                .lock_table(ctx.txn, heap.file_id(), LockMode::IntentionExclusive)?;
        }

        let ix_name = index_file_name(table, col_names);
        if let Some(tree) = self.ihs.remove(&ix_name) {
            tree.close()?;
        }
        fs::remove_file(self.home.join(&ix_name))?;

        let tab = self
            .db
            .tabs
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        tab.indexes.retain(|ix| ix.col_names() != col_names);
        self.flush_meta()
    }
}
