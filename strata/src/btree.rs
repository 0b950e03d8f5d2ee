//! Clustered multi-column B+tree index.
//!
//! File layout: page 0 holds the serialized `IndexFileHdr`; page 1 is the
//! leaf-chain sentinel whose `prev_leaf`/`next_leaf` close the doubly linked
//! list of leaves; pages from 2 on are tree nodes. Every node stores a small
//! header followed by two parallel arrays: `order` fixed-width keys and
//! `order` rids. For an internal node `rid[i].page_no` is the page number of
//! child `i` and `key[0]` duplicates the first key of the subtree, so child
//! lookups run `upper_bound` over `[1, num_keys)`.
//!
//! Concurrency is coarse: one mutex per index serializes every public
//! operation, readers included.

use bytes::{Buf, BufMut};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer_pool::{BufferPoolManager, PageGuard, PageKey};
use crate::{FileId, PageNo, Rid, StorageError, NO_PAGE, PAGE_SIZE};

pub const IX_FILE_HDR_PAGE: PageNo = 0;
pub const IX_LEAF_SENTINEL_PAGE: PageNo = 1;

const NODE_HDR_SIZE: usize = 20;
const RID_SIZE: usize = 8;

const KIND_LEAF: u32 = 1;
const KIND_INTERNAL: u32 = 2;

/// Position of one entry inside a leaf; the unit range scans advance over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot_no: u32,
}

/// Typed interpretation of one key column, used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyColType {
    Int,
    Float,
    Bytes,
}

impl KeyColType {
    fn to_tag(self) -> u32 {
        match self {
            KeyColType::Int => 0,
            KeyColType::Float => 1,
            KeyColType::Bytes => 2,
        }
    }

    fn from_tag(tag: u32) -> Result<Self, StorageError> {
        match tag {
            0 => Ok(KeyColType::Int),
            1 => Ok(KeyColType::Float),
            2 => Ok(KeyColType::Bytes),
            _ => Err(StorageError::Corrupted("unknown key column tag")),
        }
    }
}

/// Key layout of one index: the column types/widths and the node fan-out.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub cols: Vec<(KeyColType, u32)>,
    pub order: u32,
}

impl IndexSchema {
    pub fn new(cols: Vec<(KeyColType, u32)>) -> Self {
        let key_len: u32 = cols.iter().map(|(_, len)| len).sum();
        let order = Self::max_order(key_len);
        Self { cols, order }
    }

    pub fn with_order(cols: Vec<(KeyColType, u32)>, order: u32) -> Self {
        Self { cols, order }
    }

    pub fn key_len(&self) -> usize {
        self.cols.iter().map(|(_, len)| *len as usize).sum()
    }

    pub fn max_order(key_len: u32) -> u32 {
        ((PAGE_SIZE - NODE_HDR_SIZE) / (key_len as usize + RID_SIZE)) as u32
    }
}

/// Index metadata, persisted in page 0.
#[derive(Debug, Clone)]
pub struct IndexFileHdr {
    pub root_page: PageNo,
    pub first_leaf: PageNo,
    pub last_leaf: PageNo,
    pub num_pages: u32,
    pub schema: IndexSchema,
}

impl IndexFileHdr {
    fn encode(&self, mut dest: &mut [u8]) {
        dest.put_u32_le(self.root_page);
        dest.put_u32_le(self.first_leaf);
        dest.put_u32_le(self.last_leaf);
        dest.put_u32_le(self.num_pages);
        dest.put_u32_le(self.schema.order);
        dest.put_u32_le(self.schema.cols.len() as u32);
        for (ty, len) in &self.schema.cols {
            dest.put_u32_le(ty.to_tag());
            dest.put_u32_le(*len);
        }
    }

    fn decode(mut src: &[u8]) -> Result<Self, StorageError> {
        let root_page = src.get_u32_le();
        let first_leaf = src.get_u32_le();
        let last_leaf = src.get_u32_le();
        let num_pages = src.get_u32_le();
        let order = src.get_u32_le();
        let col_count = src.get_u32_le();
        let mut cols = Vec::with_capacity(col_count as usize);
        for _ in 0..col_count {
            let ty = KeyColType::from_tag(src.get_u32_le())?;
            let len = src.get_u32_le();
            cols.push((ty, len));
        }
        Ok(Self {
            root_page,
            first_leaf,
            last_leaf,
            num_pages,
            schema: IndexSchema { cols, order },
        })
    }
}

/// Column-wise comparison of two serialized keys.
fn ix_compare(a: &[u8], b: &[u8], cols: &[(KeyColType, u32)]) -> Ordering {
    let mut offset = 0;
    for (ty, len) in cols {
        let len = *len as usize;
        let (ca, cb) = (&a[offset..offset + len], &b[offset..offset + len]);
        let ord = match ty {
            KeyColType::Int => {
                let va = i32::from_ne_bytes(ca[..4].try_into().unwrap_or([0; 4]));
                let vb = i32::from_ne_bytes(cb[..4].try_into().unwrap_or([0; 4]));
                va.cmp(&vb)
            }
            KeyColType::Float => {
                let va = f32::from_ne_bytes(ca[..4].try_into().unwrap_or([0; 4]));
                let vb = f32::from_ne_bytes(cb[..4].try_into().unwrap_or([0; 4]));
                va.partial_cmp(&vb).unwrap_or(Ordering::Equal)
            }
            KeyColType::Bytes => ca.cmp(cb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
        offset += len;
    }
    Ordering::Equal
}

/// Pinned handle on one tree node. Accessors take the frame lock for the
/// duration of a single call only, so any number of handles can be alive at
/// once; the index-wide mutex serializes the structural logic above them.
struct Node<'a> {
    guard: PageGuard<'a>,
    page_no: PageNo,
    key_len: usize,
    order: usize,
}

impl<'a> Node<'a> {
    fn key_off(&self, i: usize) -> usize {
        NODE_HDR_SIZE + i * self.key_len
    }

    fn rid_off(&self, i: usize) -> usize {
        NODE_HDR_SIZE + self.order * self.key_len + i * RID_SIZE
    }

    fn init(&self, kind: u32, parent: PageNo) {
        let mut page = self.guard.write();
        let mut dest = &mut page.data[..NODE_HDR_SIZE];
        dest.put_u32_le(kind);
        dest.put_u32_le(parent);
        dest.put_u32_le(0);
        dest.put_u32_le(NO_PAGE);
        dest.put_u32_le(NO_PAGE);
    }

    fn hdr_field(&self, offset: usize) -> u32 {
        let page = self.guard.read();
        u32::from_le_bytes(page.data[offset..offset + 4].try_into().unwrap_or([0; 4]))
    }

    fn set_hdr_field(&self, offset: usize, value: u32) {
        let mut page = self.guard.write();
        page.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn is_leaf(&self) -> bool {
        self.hdr_field(0) == KIND_LEAF
    }

    fn parent(&self) -> PageNo {
        self.hdr_field(4)
    }

    fn set_parent(&self, parent: PageNo) {
        self.set_hdr_field(4, parent);
    }

    fn num_keys(&self) -> usize {
        self.hdr_field(8) as usize
    }

    fn set_num_keys(&self, n: usize) {
        self.set_hdr_field(8, n as u32);
    }

    fn prev_leaf(&self) -> PageNo {
        self.hdr_field(12)
    }

    fn set_prev_leaf(&self, page_no: PageNo) {
        self.set_hdr_field(12, page_no);
    }

    fn next_leaf(&self) -> PageNo {
        self.hdr_field(16)
    }

    fn set_next_leaf(&self, page_no: PageNo) {
        self.set_hdr_field(16, page_no);
    }

    fn key(&self, i: usize) -> Vec<u8> {
        let off = self.key_off(i);
        let page = self.guard.read();
        page.data[off..off + self.key_len].to_vec()
    }

    fn set_key(&self, i: usize, key: &[u8]) {
        let off = self.key_off(i);
        let mut page = self.guard.write();
        page.data[off..off + self.key_len].copy_from_slice(key);
    }

    fn rid(&self, i: usize) -> Rid {
        let off = self.rid_off(i);
        let page = self.guard.read();
        let mut src = &page.data[off..off + RID_SIZE];
        Rid::new(src.get_u32_le(), src.get_u32_le())
    }

    /// Contiguous copy of keys `[from, from + n)`.
    fn keys_blob(&self, from: usize, n: usize) -> Vec<u8> {
        let off = self.key_off(from);
        let page = self.guard.read();
        page.data[off..off + n * self.key_len].to_vec()
    }

    fn rids(&self, from: usize, n: usize) -> Vec<Rid> {
        (from..from + n).map(|i| self.rid(i)).collect()
    }

    /// Inserts `rids.len()` consecutive pairs at `pos`, shifting the tail.
    fn insert_pairs(&self, pos: usize, keys: &[u8], rids: &[Rid]) {
        let n = self.num_keys();
        let count = rids.len();
        debug_assert!(pos <= n && n + count <= self.order);
        debug_assert_eq!(keys.len(), count * self.key_len);

        let mut page = self.guard.write();
        let move_cnt = n - pos;
        if move_cnt > 0 {
            let src = self.key_off(pos);
            page.data
                .copy_within(src..src + move_cnt * self.key_len, self.key_off(pos + count));
            let src = self.rid_off(pos);
            page.data
                .copy_within(src..src + move_cnt * RID_SIZE, self.rid_off(pos + count));
        }
        let off = self.key_off(pos);
        page.data[off..off + keys.len()].copy_from_slice(keys);
        for (i, rid) in rids.iter().enumerate() {
            let off = self.rid_off(pos + i);
            let mut dest = &mut page.data[off..off + RID_SIZE];
            dest.put_u32_le(rid.page_no);
            dest.put_u32_le(rid.slot_no);
        }
        drop(page);
        self.set_num_keys(n + count);
    }

    fn erase_pair(&self, pos: usize) {
        let n = self.num_keys();
        debug_assert!(pos < n);
        let move_cnt = n - pos - 1;
        if move_cnt > 0 {
            let mut page = self.guard.write();
            let src = self.key_off(pos + 1);
            page.data
                .copy_within(src..src + move_cnt * self.key_len, self.key_off(pos));
            let src = self.rid_off(pos + 1);
            page.data
                .copy_within(src..src + move_cnt * RID_SIZE, self.rid_off(pos));
        }
        self.set_num_keys(n - 1);
    }

    /// First position whose key is `>= target`, in `[0, num_keys]`.
    fn lower_bound(&self, target: &[u8], cols: &[(KeyColType, u32)]) -> usize {
        let (mut left, mut right) = (0, self.num_keys());
        while left < right {
            let mid = left + (right - left) / 2;
            if ix_compare(&self.key(mid), target, cols) == Ordering::Less {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left
    }

    /// First position whose key is `> target`, searched over `[1, num_keys]`
    /// because `key[0]` of an internal node is the subtree minimum, not a
    /// separator.
    fn upper_bound_from_1(&self, target: &[u8], cols: &[(KeyColType, u32)]) -> usize {
        let (mut left, mut right) = (1, self.num_keys());
        while left < right {
            let mid = left + (right - left) / 2;
            if ix_compare(&self.key(mid), target, cols) != Ordering::Greater {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left
    }

    /// Inserts one pair, refusing duplicates. Returns the resulting size
    /// (unchanged size means the key was already present).
    fn insert(&self, key: &[u8], rid: Rid, cols: &[(KeyColType, u32)]) -> usize {
        let n = self.num_keys();
        let pos = self.lower_bound(key, cols);
        if pos < n && ix_compare(&self.key(pos), key, cols) == Ordering::Equal {
            return n;
        }
        self.insert_pairs(pos, key, &[rid]);
        n + 1
    }

    /// Removes the pair with `key` if present. Returns the resulting size.
    fn remove(&self, key: &[u8], cols: &[(KeyColType, u32)]) -> usize {
        let n = self.num_keys();
        let pos = self.lower_bound(key, cols);
        if pos < n && ix_compare(&self.key(pos), key, cols) == Ordering::Equal {
            self.erase_pair(pos);
            return n - 1;
        }
        n
    }

    /// Position of `child_page_no` among this internal node's children.
    fn find_child(&self, child_page_no: PageNo) -> Result<usize, StorageError> {
        (0..self.num_keys())
            .find(|&i| self.rid(i).page_no == child_page_no)
            .ok_or(StorageError::Corrupted("child not referenced by parent"))
    }
}

/// Handle to one open index file.
pub struct BTree {
    bpm: Arc<BufferPoolManager>,
    file: FileId,
    state: Mutex<IndexFileHdr>,
}

impl BTree {
    pub fn create<P: AsRef<Path>>(
        bpm: Arc<BufferPoolManager>,
        path: P,
        schema: IndexSchema,
    ) -> Result<Self, StorageError> {
        let file = bpm.open_file(path)?;
        let tree = Self {
            bpm,
            file,
            state: Mutex::new(IndexFileHdr {
                root_page: NO_PAGE,
                first_leaf: NO_PAGE,
                last_leaf: NO_PAGE,
                num_pages: 0,
                schema,
            }),
        };
        {
            let mut hdr = tree.state_lock();
            // header page, then the sentinel, then the initial root leaf
            tree.bpm.new_page(file)?;
            hdr.num_pages = 1;
            let sentinel = tree.create_node(&mut hdr, KIND_LEAF, NO_PAGE)?;
            let root = tree.create_node(&mut hdr, KIND_LEAF, NO_PAGE)?;
            sentinel.set_prev_leaf(root.page_no);
            sentinel.set_next_leaf(root.page_no);
            root.set_prev_leaf(sentinel.page_no);
            root.set_next_leaf(sentinel.page_no);
            hdr.root_page = root.page_no;
            hdr.first_leaf = root.page_no;
            hdr.last_leaf = root.page_no;
        }
        tree.flush()?;
        Ok(tree)
    }

    pub fn open<P: AsRef<Path>>(
        bpm: Arc<BufferPoolManager>,
        path: P,
    ) -> Result<Self, StorageError> {
        let file = bpm.open_file(path)?;
        let hdr = {
            let guard = bpm.acquire_page(PageKey {
                file,
                page_no: IX_FILE_HDR_PAGE,
            })?;
            let page = guard.read();
            IndexFileHdr::decode(&page.data[..])?
        };
        Ok(Self {
            bpm,
            file,
            state: Mutex::new(hdr),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        {
            let hdr = self.state_lock();
            let guard = self.bpm.acquire_page(PageKey {
                file: self.file,
                page_no: IX_FILE_HDR_PAGE,
            })?;
            let mut page = guard.write();
            hdr.encode(&mut page.data[..]);
        }
        self.bpm.flush_file(self.file)?;
        Ok(())
    }

    pub fn close(&self) -> Result<(), StorageError> {
        self.flush()?;
        self.bpm.close_file(self.file)?;
        Ok(())
    }

    fn state_lock(&self) -> MutexGuard<'_, IndexFileHdr> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn node(&self, hdr: &IndexFileHdr, page_no: PageNo) -> Result<Node<'_>, StorageError> {
        let guard = self.bpm.acquire_page(PageKey {
            file: self.file,
            page_no,
        })?;
        Ok(Node {
            guard,
            page_no,
            key_len: hdr.schema.key_len(),
            order: hdr.schema.order as usize,
        })
    }

    fn create_node(
        &self,
        hdr: &mut IndexFileHdr,
        kind: u32,
        parent: PageNo,
    ) -> Result<Node<'_>, StorageError> {
        let guard = self.bpm.new_page(self.file)?;
        let page_no = guard.page_no();
        hdr.num_pages += 1;
        let node = Node {
            guard,
            page_no,
            key_len: hdr.schema.key_len(),
            order: hdr.schema.order as usize,
        };
        node.init(kind, parent);
        Ok(node)
    }

    fn find_leaf(&self, hdr: &IndexFileHdr, key: &[u8]) -> Result<Node<'_>, StorageError> {
        let mut node = self.node(hdr, hdr.root_page)?;
        while !node.is_leaf() {
            let pos = node.upper_bound_from_1(key, &hdr.schema.cols);
            let child = node.rid(pos - 1).page_no;
            node = self.node(hdr, child)?;
        }
        Ok(node)
    }

    /// Point lookup. `Ok(None)` when no entry carries `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Rid>, StorageError> {
        let hdr = self.state_lock();
        let leaf = self.find_leaf(&hdr, key)?;
        let pos = leaf.lower_bound(key, &hdr.schema.cols);
        if pos < leaf.num_keys()
            && ix_compare(&leaf.key(pos), key, &hdr.schema.cols) == Ordering::Equal
        {
            return Ok(Some(leaf.rid(pos)));
        }
        Ok(None)
    }

    /// Inserts `(key, rid)`. Returns `Ok(false)` when the key already
    /// exists; the tree is left untouched in that case.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> Result<bool, StorageError> {
        let mut hdr = self.state_lock();
        let leaf = self.find_leaf(&hdr, key)?;
        let old_size = leaf.num_keys();
        if leaf.insert(key, rid, &hdr.schema.cols) == old_size {
            return Ok(false);
        }
        // A new minimum must be propagated into the left spine.
        self.maintain_parent(&hdr, &leaf)?;
        if leaf.num_keys() == hdr.schema.order as usize {
            let new_leaf = self.split(&mut hdr, &leaf)?;
            let sep = new_leaf.key(0);
            self.insert_into_parent(&mut hdr, &leaf, &sep, &new_leaf)?;
        }
        Ok(true)
    }

    /// Removes the entry with `key`. Returns `Ok(false)` when absent.
    pub fn delete_entry(&self, key: &[u8]) -> Result<bool, StorageError> {
        let mut hdr = self.state_lock();
        let leaf = self.find_leaf(&hdr, key)?;
        let old_size = leaf.num_keys();
        if leaf.remove(key, &hdr.schema.cols) == old_size {
            return Ok(false);
        }
        if leaf.num_keys() > 0 {
            self.maintain_parent(&hdr, &leaf)?;
        }
        self.coalesce_or_redistribute(&mut hdr, leaf)?;
        Ok(true)
    }

    /// Splits `node`, moving its upper half into a fresh right sibling, and
    /// returns that sibling. The separator to push up is the new node's
    /// first key.
    fn split<'t>(
        &'t self,
        hdr: &mut IndexFileHdr,
        node: &Node<'t>,
    ) -> Result<Node<'t>, StorageError> {
        let size = node.num_keys();
        let split_pos = size / 2;
        let move_cnt = size - split_pos;

        let kind = if node.is_leaf() { KIND_LEAF } else { KIND_INTERNAL };
        let new_node = self.create_node(hdr, kind, node.parent())?;
        let keys = node.keys_blob(split_pos, move_cnt);
        let rids = node.rids(split_pos, move_cnt);
        new_node.insert_pairs(0, &keys, &rids);
        node.set_num_keys(split_pos);

        if node.is_leaf() {
            let old_next = node.next_leaf();
            new_node.set_prev_leaf(node.page_no);
            new_node.set_next_leaf(old_next);
            node.set_next_leaf(new_node.page_no);
            let next = self.node(hdr, old_next)?;
            next.set_prev_leaf(new_node.page_no);
            if hdr.last_leaf == node.page_no {
                hdr.last_leaf = new_node.page_no;
            }
        } else {
            for i in 0..move_cnt {
                self.maintain_child(hdr, &new_node, i)?;
            }
        }
        Ok(new_node)
    }

    /// Inserts the separator for a freshly split pair into their parent,
    /// splitting upward as needed; grows a new root when `old_node` was it.
    fn insert_into_parent(
        &self,
        hdr: &mut IndexFileHdr,
        old_node: &Node<'_>,
        sep: &[u8],
        new_node: &Node<'_>,
    ) -> Result<(), StorageError> {
        if old_node.parent() == NO_PAGE {
            let root = self.create_node(hdr, KIND_INTERNAL, NO_PAGE)?;
            let mut keys = old_node.key(0);
            keys.extend_from_slice(sep);
            root.insert_pairs(
                0,
                &keys,
                &[Rid::new(old_node.page_no, 0), Rid::new(new_node.page_no, 0)],
            );
            old_node.set_parent(root.page_no);
            new_node.set_parent(root.page_no);
            hdr.root_page = root.page_no;
            return Ok(());
        }

        let parent = self.node(hdr, old_node.parent())?;
        let idx = parent.find_child(old_node.page_no)?;
        parent.insert_pairs(idx + 1, sep, &[Rid::new(new_node.page_no, 0)]);
        new_node.set_parent(parent.page_no);

        if parent.num_keys() == hdr.schema.order as usize {
            let new_parent = self.split(hdr, &parent)?;
            let sep = new_parent.key(0);
            self.insert_into_parent(hdr, &parent, &sep, &new_parent)?;
        }
        Ok(())
    }

    /// Post-delete repair: leave the node alone while it satisfies the
    /// minimum, otherwise borrow one pair from a sibling or merge with it.
    fn coalesce_or_redistribute(
        &self,
        hdr: &mut IndexFileHdr,
        node: Node<'_>,
    ) -> Result<(), StorageError> {
        if node.page_no == hdr.root_page {
            return self.adjust_root(hdr, node);
        }
        let min_size = (hdr.schema.order / 2) as usize;
        if node.num_keys() >= min_size {
            return Ok(());
        }

        let parent = self.node(hdr, node.parent())?;
        let idx = parent.find_child(node.page_no)?;
        // Prefer the predecessor sibling; the leftmost child borrows from
        // its successor instead.
        let neighbor_idx = if idx > 0 { idx - 1 } else { idx + 1 };
        let neighbor = self.node(hdr, parent.rid(neighbor_idx).page_no)?;

        if node.num_keys() + neighbor.num_keys() >= 2 * min_size {
            self.redistribute(hdr, &neighbor, &node, &parent, idx)?;
            return Ok(());
        }

        // Merge: canonicalize so the survivor is on the left, append the
        // right node into it, then splice the right node out.
        let (left, right, right_idx) = if idx == 0 {
            (node, neighbor, idx + 1)
        } else {
            (neighbor, node, idx)
        };
        let left_size = left.num_keys();
        let right_size = right.num_keys();
        let keys = right.keys_blob(0, right_size);
        let rids = right.rids(0, right_size);
        left.insert_pairs(left_size, &keys, &rids);

        if left.is_leaf() {
            self.erase_leaf(hdr, &right)?;
            if hdr.last_leaf == right.page_no {
                hdr.last_leaf = left.page_no;
            }
        } else {
            for i in 0..right_size {
                self.maintain_child(hdr, &left, left_size + i)?;
            }
        }
        // The dead page leaks; num_pages stays a high-water mark.
        parent.erase_pair(right_idx);

        self.coalesce_or_redistribute(hdr, parent)
    }

    /// Moves one boundary pair from `neighbor` into `node` and rewrites the
    /// parent separator of whichever node changed its first key.
    fn redistribute(
        &self,
        hdr: &IndexFileHdr,
        neighbor: &Node<'_>,
        node: &Node<'_>,
        parent: &Node<'_>,
        idx: usize,
    ) -> Result<(), StorageError> {
        if idx == 0 {
            // neighbor is the right sibling: its head moves to node's tail
            let key = neighbor.key(0);
            let rid = neighbor.rid(0);
            node.insert_pairs(node.num_keys(), &key, &[rid]);
            neighbor.erase_pair(0);
            parent.set_key(idx + 1, &neighbor.key(0));
            if !node.is_leaf() {
                self.maintain_child(hdr, node, node.num_keys() - 1)?;
            }
        } else {
            // neighbor is the left sibling: its tail moves to node's head
            let last = neighbor.num_keys() - 1;
            let key = neighbor.key(last);
            let rid = neighbor.rid(last);
            node.insert_pairs(0, &key, &[rid]);
            neighbor.erase_pair(last);
            parent.set_key(idx, &node.key(0));
            if !node.is_leaf() {
                self.maintain_child(hdr, node, 0)?;
            }
        }
        Ok(())
    }

    /// Root repair: an internal root with a single child promotes that
    /// child; an empty leaf root simply stays as the (empty) tree.
    fn adjust_root(
        &self,
        hdr: &mut IndexFileHdr,
        old_root: Node<'_>,
    ) -> Result<(), StorageError> {
        if !old_root.is_leaf() && old_root.num_keys() == 1 {
            let child_page = old_root.rid(0).page_no;
            let child = self.node(hdr, child_page)?;
            child.set_parent(NO_PAGE);
            hdr.root_page = child_page;
        }
        Ok(())
    }

    /// Rewrites ancestor separators to `node`'s first key until one already
    /// matches; needed whenever a node's minimum may have changed.
    fn maintain_parent(
        &self,
        hdr: &IndexFileHdr,
        node: &Node<'_>,
    ) -> Result<(), StorageError> {
        let mut child_page = node.page_no;
        let mut child_key = node.key(0);
        let mut parent_page = node.parent();
        while parent_page != NO_PAGE {
            let parent = self.node(hdr, parent_page)?;
            let rank = parent.find_child(child_page)?;
            if parent.key(rank) == child_key {
                break;
            }
            parent.set_key(rank, &child_key);
            child_page = parent.page_no;
            child_key = parent.key(0);
            parent_page = parent.parent();
        }
        Ok(())
    }

    /// Repoints the parent pointer of child `idx` of `node` back at `node`.
    fn maintain_child(
        &self,
        hdr: &IndexFileHdr,
        node: &Node<'_>,
        idx: usize,
    ) -> Result<(), StorageError> {
        let child_page = node.rid(idx).page_no;
        let child = self.node(hdr, child_page)?;
        child.set_parent(node.page_no);
        Ok(())
    }

    /// Unlinks `leaf` from the doubly linked chain before it dies.
    fn erase_leaf(&self, hdr: &IndexFileHdr, leaf: &Node<'_>) -> Result<(), StorageError> {
        let prev = self.node(hdr, leaf.prev_leaf())?;
        prev.set_next_leaf(leaf.next_leaf());
        let next = self.node(hdr, leaf.next_leaf())?;
        next.set_prev_leaf(leaf.prev_leaf());
        Ok(())
    }

    /// Position of the first entry `>= key`, normalized onto the next leaf
    /// when it falls past a leaf's end.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iid, StorageError> {
        let hdr = self.state_lock();
        let mut leaf = self.find_leaf(&hdr, key)?;
        let mut pos = leaf.lower_bound(key, &hdr.schema.cols);
        while pos == leaf.num_keys() {
            let next = leaf.next_leaf();
            if next == IX_LEAF_SENTINEL_PAGE {
                break;
            }
            leaf = self.node(&hdr, next)?;
            pos = 0;
        }
        Ok(Iid {
            page_no: leaf.page_no,
            slot_no: pos as u32,
        })
    }

    /// Position one past the last entry `<= key`, normalized like
    /// `lower_bound`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iid, StorageError> {
        let hdr = self.state_lock();
        let mut leaf = self.find_leaf(&hdr, key)?;
        let mut pos = leaf.lower_bound(key, &hdr.schema.cols);
        if pos < leaf.num_keys()
            && ix_compare(&leaf.key(pos), key, &hdr.schema.cols) == Ordering::Equal
        {
            pos += 1;
        }
        while pos == leaf.num_keys() {
            let next = leaf.next_leaf();
            if next == IX_LEAF_SENTINEL_PAGE {
                break;
            }
            leaf = self.node(&hdr, next)?;
            pos = 0;
        }
        Ok(Iid {
            page_no: leaf.page_no,
            slot_no: pos as u32,
        })
    }

    pub fn leaf_begin(&self) -> Result<Iid, StorageError> {
        let hdr = self.state_lock();
        Ok(Iid {
            page_no: hdr.first_leaf,
            slot_no: 0,
        })
    }

    pub fn leaf_end(&self) -> Result<Iid, StorageError> {
        let hdr = self.state_lock();
        let leaf = self.node(&hdr, hdr.last_leaf)?;
        Ok(Iid {
            page_no: hdr.last_leaf,
            slot_no: leaf.num_keys() as u32,
        })
    }

    /// The stored rid at a scan position.
    pub fn rid_at(&self, iid: Iid) -> Result<Rid, StorageError> {
        let hdr = self.state_lock();
        let node = self.node(&hdr, iid.page_no)?;
        if iid.slot_no as usize >= node.num_keys() {
            return Err(StorageError::IndexEntryNotFound);
        }
        Ok(node.rid(iid.slot_no as usize))
    }

    pub fn key_at(&self, iid: Iid) -> Result<Vec<u8>, StorageError> {
        let hdr = self.state_lock();
        let node = self.node(&hdr, iid.page_no)?;
        if iid.slot_no as usize >= node.num_keys() {
            return Err(StorageError::IndexEntryNotFound);
        }
        Ok(node.key(iid.slot_no as usize))
    }

    /// Range scan over `[lower, upper]` (whole index when unbounded).
    pub fn scan_range(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<BTreeScan<'_>, StorageError> {
        let cur = match lower {
            Some(key) => self.lower_bound(key)?,
            None => self.leaf_begin()?,
        };
        let end = match upper {
            Some(key) => self.upper_bound(key)?,
            None => self.leaf_end()?,
        };
        Ok(BTreeScan {
            tree: self,
            cur,
            end,
        })
    }
}

/// Forward iterator over leaf entries; `next` follows the leaf chain.
pub struct BTreeScan<'a> {
    tree: &'a BTree,
    cur: Iid,
    end: Iid,
}

impl<'a> BTreeScan<'a> {
    pub fn is_end(&self) -> bool {
        self.cur == self.end
    }

    pub fn iid(&self) -> Iid {
        self.cur
    }

    pub fn rid(&self) -> Result<Rid, StorageError> {
        self.tree.rid_at(self.cur)
    }

    pub fn key(&self) -> Result<Vec<u8>, StorageError> {
        self.tree.key_at(self.cur)
    }

    pub fn next(&mut self) -> Result<(), StorageError> {
        if self.is_end() {
            return Ok(());
        }
        let hdr = self.tree.state_lock();
        let node = self.tree.node(&hdr, self.cur.page_no)?;
        self.cur.slot_no += 1;
        if self.cur == self.end {
            return Ok(());
        }
        if self.cur.slot_no as usize >= node.num_keys() {
            let next = node.next_leaf();
            if next != IX_LEAF_SENTINEL_PAGE {
                self.cur = Iid {
                    page_no: next,
                    slot_no: 0,
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPoolManager;
    use tempfile::tempdir;

    fn int_key(k: i32) -> Vec<u8> {
        k.to_ne_bytes().to_vec()
    }

    fn int_tree(order: u32) -> (tempfile::TempDir, BTree) {
        let dir = tempdir().unwrap();
        let bpm = Arc::new(BufferPoolManager::new());
        let schema = IndexSchema::with_order(vec![(KeyColType::Int, 4)], order);
        let tree = BTree::create(bpm, dir.path().join("t_a_.idx"), schema).unwrap();
        (dir, tree)
    }

    fn collect_keys(tree: &BTree) -> Vec<i32> {
        let mut scan = tree.scan_range(None, None).unwrap();
        let mut keys = Vec::new();
        while !scan.is_end() {
            let raw = scan.key().unwrap();
            keys.push(i32::from_ne_bytes(raw[..4].try_into().unwrap()));
            scan.next().unwrap();
        }
        keys
    }

    /// Walks the whole tree checking the structural invariants: separator
    /// equals child first key, children agree on their parent, all leaves
    /// at one depth, sizes within bounds, chain consistent and ascending.
    fn check_integrity(tree: &BTree) {
        let hdr = tree.state_lock();
        let mut leaf_depths = Vec::new();
        check_node(tree, &hdr, hdr.root_page, 0, &mut leaf_depths);
        assert!(
            leaf_depths.windows(2).all(|w| w[0] == w[1]),
            "leaves at unequal depths: {leaf_depths:?}"
        );

        // leaf chain: sentinel -> first .. last -> sentinel, ascending keys
        let sentinel = tree.node(&hdr, IX_LEAF_SENTINEL_PAGE).unwrap();
        assert_eq!(sentinel.next_leaf(), hdr.first_leaf);
        assert_eq!(sentinel.prev_leaf(), hdr.last_leaf);
        let mut page_no = hdr.first_leaf;
        let mut prev_page = IX_LEAF_SENTINEL_PAGE;
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            let leaf = tree.node(&hdr, page_no).unwrap();
            assert!(leaf.is_leaf());
            assert_eq!(leaf.prev_leaf(), prev_page);
            for i in 0..leaf.num_keys() {
                let key = leaf.key(i);
                if let Some(prev) = &last_key {
                    assert_eq!(
                        ix_compare(prev, &key, &hdr.schema.cols),
                        Ordering::Less,
                        "leaf keys not strictly ascending"
                    );
                }
                last_key = Some(key);
            }
            prev_page = page_no;
            page_no = leaf.next_leaf();
            if page_no == IX_LEAF_SENTINEL_PAGE {
                assert_eq!(prev_page, hdr.last_leaf);
                break;
            }
        }
    }

    fn check_node(
        tree: &BTree,
        hdr: &IndexFileHdr,
        page_no: PageNo,
        depth: usize,
        leaf_depths: &mut Vec<usize>,
    ) {
        let node = tree.node(hdr, page_no).unwrap();
        let min_size = (hdr.schema.order / 2) as usize;
        if page_no != hdr.root_page {
            assert!(node.num_keys() >= min_size, "node {page_no} underfull");
        }
        assert!(node.num_keys() < hdr.schema.order as usize || hdr.schema.order == 0);
        if node.is_leaf() {
            leaf_depths.push(depth);
            return;
        }
        for i in 0..node.num_keys() {
            let child = tree.node(hdr, node.rid(i).page_no).unwrap();
            assert_eq!(child.parent(), page_no, "child parent pointer stale");
            assert_eq!(
                node.key(i),
                child.key(0),
                "separator differs from child first key"
            );
            check_node(tree, hdr, node.rid(i).page_no, depth + 1, leaf_depths);
        }
    }

    #[test]
    fn test_insert_get_and_duplicate() {
        let (_dir, tree) = int_tree(4);
        assert!(tree.insert_entry(&int_key(7), Rid::new(1, 0)).unwrap());
        assert!(!tree.insert_entry(&int_key(7), Rid::new(1, 1)).unwrap());
        assert_eq!(tree.get(&int_key(7)).unwrap(), Some(Rid::new(1, 0)));
        assert_eq!(tree.get(&int_key(8)).unwrap(), None);
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let (_dir, tree) = int_tree(4);
        tree.insert_entry(&int_key(1), Rid::new(1, 0)).unwrap();
        assert!(!tree.delete_entry(&int_key(2)).unwrap());
        assert!(tree.delete_entry(&int_key(1)).unwrap());
        assert!(!tree.delete_entry(&int_key(1)).unwrap());
    }

    #[test]
    fn test_leaf_split_shape() {
        // order 4: the fourth insert fills the leaf and splits it
        let (_dir, tree) = int_tree(4);
        for (i, k) in [10, 20, 30, 40, 50].iter().enumerate() {
            tree.insert_entry(&int_key(*k), Rid::new(1, i as u32))
                .unwrap();
        }
        let hdr = tree.state_lock();
        let root = tree.node(&hdr, hdr.root_page).unwrap();
        assert!(!root.is_leaf());
        assert_eq!(root.num_keys(), 2);
        assert_eq!(root.key(0), int_key(10));
        assert_eq!(root.key(1), int_key(30));

        let left = tree.node(&hdr, root.rid(0).page_no).unwrap();
        let right = tree.node(&hdr, root.rid(1).page_no).unwrap();
        assert_eq!((0..left.num_keys()).map(|i| left.key(i)).collect::<Vec<_>>(),
                   vec![int_key(10), int_key(20)]);
        assert_eq!((0..right.num_keys()).map(|i| right.key(i)).collect::<Vec<_>>(),
                   vec![int_key(30), int_key(40), int_key(50)]);
        assert_eq!(hdr.last_leaf, right.page_no);
        assert_eq!(left.next_leaf(), right.page_no);
        assert_eq!(right.prev_leaf(), left.page_no);
        assert_eq!(right.next_leaf(), IX_LEAF_SENTINEL_PAGE);
        drop(hdr);
        check_integrity(&tree);
    }

    #[test]
    fn test_merge_collapses_to_single_leaf_root() {
        let (_dir, tree) = int_tree(4);
        for (i, k) in [10, 20, 30, 40, 50].iter().enumerate() {
            tree.insert_entry(&int_key(*k), Rid::new(1, i as u32))
                .unwrap();
        }
        for k in [10, 20, 30] {
            assert!(tree.delete_entry(&int_key(k)).unwrap());
            check_integrity(&tree);
        }
        let hdr = tree.state_lock();
        let root = tree.node(&hdr, hdr.root_page).unwrap();
        assert!(root.is_leaf());
        assert_eq!(hdr.first_leaf, hdr.root_page);
        assert_eq!(hdr.last_leaf, hdr.root_page);
        assert_eq!(root.prev_leaf(), IX_LEAF_SENTINEL_PAGE);
        assert_eq!(root.next_leaf(), IX_LEAF_SENTINEL_PAGE);
        drop(hdr);
        assert_eq!(collect_keys(&tree), vec![40, 50]);
    }

    #[test]
    fn test_delete_to_empty_then_reinsert() {
        let (_dir, tree) = int_tree(4);
        for k in 0..3 {
            tree.insert_entry(&int_key(k), Rid::new(1, k as u32)).unwrap();
        }
        for k in 0..3 {
            assert!(tree.delete_entry(&int_key(k)).unwrap());
        }
        assert_eq!(collect_keys(&tree), Vec::<i32>::new());
        assert!(tree.insert_entry(&int_key(9), Rid::new(1, 9)).unwrap());
        assert_eq!(collect_keys(&tree), vec![9]);
    }

    #[test]
    fn test_many_inserts_in_order_and_reverse() {
        for reversed in [false, true] {
            let (_dir, tree) = int_tree(4);
            let mut keys: Vec<i32> = (0..200).collect();
            if reversed {
                keys.reverse();
            }
            for k in &keys {
                assert!(tree.insert_entry(&int_key(*k), Rid::new(1, *k as u32)).unwrap());
            }
            check_integrity(&tree);
            assert_eq!(collect_keys(&tree), (0..200).collect::<Vec<_>>());
            for k in 0..200 {
                assert_eq!(tree.get(&int_key(k)).unwrap(), Some(Rid::new(1, k as u32)));
            }
        }
    }

    #[test]
    fn test_interleaved_deletes_keep_invariants() {
        let (_dir, tree) = int_tree(4);
        for k in 0..100 {
            tree.insert_entry(&int_key(k), Rid::new(1, k as u32)).unwrap();
        }
        for k in (0..100).step_by(2) {
            assert!(tree.delete_entry(&int_key(k)).unwrap());
            check_integrity(&tree);
        }
        assert_eq!(
            collect_keys(&tree),
            (0..100).filter(|k| k % 2 == 1).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_range_scan_bounds() {
        let (_dir, tree) = int_tree(4);
        for k in 0..50 {
            tree.insert_entry(&int_key(k * 2), Rid::new(1, k as u32)).unwrap();
        }
        // [10, 20] inclusive picks up 10,12,...,20
        let mut scan = tree
            .scan_range(Some(&int_key(10)), Some(&int_key(20)))
            .unwrap();
        let mut found = Vec::new();
        while !scan.is_end() {
            let raw = scan.key().unwrap();
            found.push(i32::from_ne_bytes(raw[..4].try_into().unwrap()));
            scan.next().unwrap();
        }
        assert_eq!(found, vec![10, 12, 14, 16, 18, 20]);

        // lower bound between keys starts at the next present key
        let iid = tree.lower_bound(&int_key(11)).unwrap();
        assert_eq!(tree.key_at(iid).unwrap(), int_key(12));
    }

    #[test]
    fn test_multicolumn_key_ordering() {
        let dir = tempdir().unwrap();
        let bpm = Arc::new(BufferPoolManager::new());
        let schema = IndexSchema::with_order(
            vec![(KeyColType::Int, 4), (KeyColType::Bytes, 4)],
            4,
        );
        let tree = BTree::create(bpm, dir.path().join("t_a_b_.idx"), schema).unwrap();

        let make = |a: i32, b: &[u8; 4]| {
            let mut key = a.to_ne_bytes().to_vec();
            key.extend_from_slice(b);
            key
        };
        tree.insert_entry(&make(1, b"bb\0\0"), Rid::new(1, 0)).unwrap();
        tree.insert_entry(&make(1, b"aa\0\0"), Rid::new(1, 1)).unwrap();
        tree.insert_entry(&make(0, b"zz\0\0"), Rid::new(1, 2)).unwrap();

        let mut scan = tree.scan_range(None, None).unwrap();
        let mut rids = Vec::new();
        while !scan.is_end() {
            rids.push(scan.rid().unwrap());
            scan.next().unwrap();
        }
        assert_eq!(rids, vec![Rid::new(1, 2), Rid::new(1, 1), Rid::new(1, 0)]);
    }

    #[test]
    fn test_reopen_preserves_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t_a_.idx");
        let bpm = Arc::new(BufferPoolManager::new());
        {
            let schema = IndexSchema::with_order(vec![(KeyColType::Int, 4)], 4);
            let tree = BTree::create(bpm.clone(), &path, schema).unwrap();
            for k in 0..20 {
                tree.insert_entry(&int_key(k), Rid::new(1, k as u32)).unwrap();
            }
            tree.close().unwrap();
        }
        let tree = BTree::open(bpm, &path).unwrap();
        assert_eq!(collect_keys(&tree), (0..20).collect::<Vec<_>>());
        assert_eq!(tree.get(&int_key(13)).unwrap(), Some(Rid::new(1, 13)));
    }
}
