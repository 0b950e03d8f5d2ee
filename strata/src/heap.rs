//! Slotted-page heap file for fixed-width records.
//!
//! File layout: page 0 holds the serialized `HeapFileHdr`; every page from
//! `HEAP_FIRST_DATA_PAGE` on is a data page laid out as
//! `[page header | slot bitmap | slots]`. Pages with free slots are chained
//! through `next_free_page_no`, rooted at the file header.

use bytes::{Buf, BufMut};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer_pool::{BufferPoolManager, PageGuard, PageKey};
use crate::lock_manager::LockMode;
use crate::transaction::TxnContext;
use crate::{FileId, Page, PageNo, Rid, StorageError, NO_PAGE, PAGE_SIZE};

pub const HEAP_FILE_HDR_PAGE: PageNo = 0;
pub const HEAP_FIRST_DATA_PAGE: PageNo = 1;

const PAGE_HDR_SIZE: usize = 12;

/// Heap file metadata, persisted in page 0.
#[derive(Debug, Clone)]
pub struct HeapFileHdr {
    pub record_size: u32,
    pub records_per_page: u32,
    pub bitmap_size: u32,
    pub num_pages: u32,
    pub first_free_page_no: PageNo,
}

impl HeapFileHdr {
    fn encode(&self, mut dest: &mut [u8]) {
        dest.put_u32_le(self.record_size);
        dest.put_u32_le(self.records_per_page);
        dest.put_u32_le(self.bitmap_size);
        dest.put_u32_le(self.num_pages);
        dest.put_u32_le(self.first_free_page_no);
    }

    fn decode(mut src: &[u8]) -> Self {
        Self {
            record_size: src.get_u32_le(),
            records_per_page: src.get_u32_le(),
            bitmap_size: src.get_u32_le(),
            num_pages: src.get_u32_le(),
            first_free_page_no: src.get_u32_le(),
        }
    }
}

/// Per-page header. `in_free_list` tracks list membership so that undo
/// replay (`insert_record_at`) can refill a page that is either in or out
/// of the free list without corrupting the chain.
#[derive(Debug, Clone, Copy)]
struct HeapPageHdr {
    next_free_page_no: PageNo,
    num_records: u32,
    in_free_list: bool,
}

fn read_page_hdr(page: &Page) -> HeapPageHdr {
    let mut src = &page.data[..PAGE_HDR_SIZE];
    HeapPageHdr {
        next_free_page_no: src.get_u32_le(),
        num_records: src.get_u32_le(),
        in_free_list: src.get_u32_le() != 0,
    }
}

fn write_page_hdr(page: &mut Page, hdr: &HeapPageHdr) {
    let mut dest = &mut page.data[..PAGE_HDR_SIZE];
    dest.put_u32_le(hdr.next_free_page_no);
    dest.put_u32_le(hdr.num_records);
    dest.put_u32_le(hdr.in_free_list as u32);
}

/// Bit-level helpers over a page's slot bitmap.
mod bitmap {
    pub fn is_set(bm: &[u8], i: u32) -> bool {
        bm[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    pub fn set(bm: &mut [u8], i: u32) {
        bm[(i / 8) as usize] |= 1 << (i % 8);
    }

    pub fn clear(bm: &mut [u8], i: u32) {
        bm[(i / 8) as usize] &= !(1 << (i % 8));
    }

    /// First clear bit in `[0, n)`, if any.
    pub fn first_clear(bm: &[u8], n: u32) -> Option<u32> {
        (0..n).find(|&i| !is_set(bm, i))
    }

    /// First set bit in `[from, n)`, if any.
    pub fn next_set(bm: &[u8], n: u32, from: u32) -> Option<u32> {
        (from..n).find(|&i| is_set(bm, i))
    }
}

/// The widest slot count such that header, bitmap and slots fit one page.
fn fit_records_per_page(record_size: u32) -> (u32, u32) {
    let avail = (PAGE_SIZE - PAGE_HDR_SIZE) as u32;
    let mut n = (avail * 8) / (record_size * 8 + 1);
    while n > 0 && n.div_ceil(8) + n * record_size > avail {
        n -= 1;
    }
    (n, n.div_ceil(8))
}

/// Handle to one heap file. Mutating operations serialize on the in-memory
/// header mutex; row and table locks are the caller-supplied context's job.
pub struct HeapFile {
    bpm: Arc<BufferPoolManager>,
    file: FileId,
    hdr: Mutex<HeapFileHdr>,
}

impl HeapFile {
    pub fn create<P: AsRef<Path>>(
        bpm: Arc<BufferPoolManager>,
        path: P,
        record_size: u32,
    ) -> Result<Self, StorageError> {
        let file = bpm.open_file(path)?;
        let (records_per_page, bitmap_size) = fit_records_per_page(record_size);
        let hdr = HeapFileHdr {
            record_size,
            records_per_page,
            bitmap_size,
            num_pages: 1,
            first_free_page_no: NO_PAGE,
        };
        {
            let guard = bpm.new_page(file)?;
            let mut page = guard.write();
            hdr.encode(&mut page.data[..]);
        }
        Ok(Self {
            bpm,
            file,
            hdr: Mutex::new(hdr),
        })
    }

    pub fn open<P: AsRef<Path>>(
        bpm: Arc<BufferPoolManager>,
        path: P,
    ) -> Result<Self, StorageError> {
        let file = bpm.open_file(path)?;
        let hdr = {
            let guard = bpm.acquire_page(PageKey {
                file,
                page_no: HEAP_FILE_HDR_PAGE,
            })?;
            let page = guard.read();
            HeapFileHdr::decode(&page.data[..])
        };
        Ok(Self {
            bpm,
            file,
            hdr: Mutex::new(hdr),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file
    }

    pub fn record_size(&self) -> u32 {
        self.hdr().record_size
    }

    pub fn records_per_page(&self) -> u32 {
        self.hdr().records_per_page
    }

    fn hdr(&self) -> MutexGuard<'_, HeapFileHdr> {
        self.hdr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes the in-memory header back to page 0 and flushes the file.
    pub fn flush(&self) -> Result<(), StorageError> {
        {
            let hdr = self.hdr();
            let guard = self.fetch_page_unchecked(HEAP_FILE_HDR_PAGE)?;
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

    fn fetch_page_unchecked(&self, page_no: PageNo) -> Result<PageGuard<'_>, StorageError> {
        Ok(self.bpm.acquire_page(PageKey {
            file: self.file,
            page_no,
        })?)
    }

    fn fetch_data_page(
        &self,
        page_no: PageNo,
        num_pages: u32,
    ) -> Result<PageGuard<'_>, StorageError> {
        if page_no < HEAP_FIRST_DATA_PAGE || page_no >= num_pages {
            return Err(StorageError::PageNotExist { page_no });
        }
        self.fetch_page_unchecked(page_no)
    }

    fn slot_range(&self, hdr: &HeapFileHdr, slot_no: u32) -> (usize, usize) {
        let start =
            PAGE_HDR_SIZE + hdr.bitmap_size as usize + (slot_no * hdr.record_size) as usize;
        (start, start + hdr.record_size as usize)
    }

    fn bitmap_range(hdr: &HeapFileHdr) -> (usize, usize) {
        (PAGE_HDR_SIZE, PAGE_HDR_SIZE + hdr.bitmap_size as usize)
    }

    /// Reads the record at `rid` under a shared row lock.
    pub fn get_record(
        &self,
        rid: Rid,
        ctx: Option<&TxnContext>,
    ) -> Result<Vec<u8>, StorageError> {
        if let Some(ctx) = ctx {
            ctx.lock_mgr
                .lock_record(ctx.txn, self.file, rid, LockMode::Shared)?;
        }

        let hdr = self.hdr();
        let guard = self.fetch_data_page(rid.page_no, hdr.num_pages)?;
        let page = guard.read();
        let (bm_start, bm_end) = Self::bitmap_range(&hdr);
        if !bitmap::is_set(&page.data[bm_start..bm_end], rid.slot_no) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        let (start, end) = self.slot_range(&hdr, rid.slot_no);
        Ok(page.data[start..end].to_vec())
    }

    /// Inserts into the first free slot of the free-list head, allocating a
    /// fresh page when the list is empty. The new record's row lock is taken
    /// exclusively before the slot becomes visible.
    pub fn insert_record(
        &self,
        buf: &[u8],
        ctx: Option<&TxnContext>,
    ) -> Result<Rid, StorageError> {
        let mut hdr = self.hdr();
        loop {
            if hdr.first_free_page_no == NO_PAGE {
                self.allocate_page(&mut hdr)?;
            }
            let page_no = hdr.first_free_page_no;
            let guard = self.fetch_page_unchecked(page_no)?;
            let mut page = guard.write();
            let mut page_hdr = read_page_hdr(&page);

            // A page refilled by undo replay may sit in the list while
            // already full; skip and unlink it.
            if page_hdr.num_records >= hdr.records_per_page {
                hdr.first_free_page_no = page_hdr.next_free_page_no;
                page_hdr.next_free_page_no = NO_PAGE;
                page_hdr.in_free_list = false;
                write_page_hdr(&mut page, &page_hdr);
                continue;
            }

            let (bm_start, bm_end) = Self::bitmap_range(&hdr);
            let slot_no = bitmap::first_clear(
                &page.data[bm_start..bm_end],
                hdr.records_per_page,
            )
            .ok_or(StorageError::Corrupted(
                "free-list page has no clear slot bit",
            ))?;
            let rid = Rid::new(page_no, slot_no);

            if let Some(ctx) = ctx {
                ctx.lock_mgr
                    .lock_record(ctx.txn, self.file, rid, LockMode::Exclusive)?;
            }

            let (start, end) = self.slot_range(&hdr, slot_no);
            page.data[start..end].copy_from_slice(&buf[..hdr.record_size as usize]);
            bitmap::set(&mut page.data[bm_start..bm_end], slot_no);
            page_hdr.num_records += 1;
            if page_hdr.num_records == hdr.records_per_page {
                hdr.first_free_page_no = page_hdr.next_free_page_no;
                page_hdr.next_free_page_no = NO_PAGE;
                page_hdr.in_free_list = false;
            }
            write_page_hdr(&mut page, &page_hdr);
            return Ok(rid);
        }
    }

    /// Writes into the given slot; used only by undo replay of a delete.
    /// The page may currently be in or out of the free list, both are fine.
    pub fn insert_record_at(&self, rid: Rid, buf: &[u8]) -> Result<(), StorageError> {
        let hdr = self.hdr();
        let guard = self.fetch_data_page(rid.page_no, hdr.num_pages)?;
        let mut page = guard.write();
        let (bm_start, bm_end) = Self::bitmap_range(&hdr);
        let was_set = bitmap::is_set(&page.data[bm_start..bm_end], rid.slot_no);

        let (start, end) = self.slot_range(&hdr, rid.slot_no);
        page.data[start..end].copy_from_slice(&buf[..hdr.record_size as usize]);
        if !was_set {
            bitmap::set(&mut page.data[bm_start..bm_end], rid.slot_no);
            let mut page_hdr = read_page_hdr(&page);
            page_hdr.num_records += 1;
            write_page_hdr(&mut page, &page_hdr);
        }
        Ok(())
    }

    /// Deletes the record at `rid` under an exclusive row lock. A page that
    /// regains a free slot and is not already chained joins the free-list
    /// head.
    pub fn delete_record(
        &self,
        rid: Rid,
        ctx: Option<&TxnContext>,
    ) -> Result<(), StorageError> {
        if let Some(ctx) = ctx {
            ctx.lock_mgr
                .lock_record(ctx.txn, self.file, rid, LockMode::Exclusive)?;
        }

        let mut hdr = self.hdr();
        let guard = self.fetch_data_page(rid.page_no, hdr.num_pages)?;
        let mut page = guard.write();
        let (bm_start, bm_end) = Self::bitmap_range(&hdr);
        if !bitmap::is_set(&page.data[bm_start..bm_end], rid.slot_no) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }

        bitmap::clear(&mut page.data[bm_start..bm_end], rid.slot_no);
        let mut page_hdr = read_page_hdr(&page);
        page_hdr.num_records -= 1;
        if !page_hdr.in_free_list {
            page_hdr.next_free_page_no = hdr.first_free_page_no;
            page_hdr.in_free_list = true;
            hdr.first_free_page_no = rid.page_no;
        }
        write_page_hdr(&mut page, &page_hdr);
        Ok(())
    }

    /// Overwrites the record at `rid` in place under an exclusive row lock.
    pub fn update_record(
        &self,
        rid: Rid,
        buf: &[u8],
        ctx: Option<&TxnContext>,
    ) -> Result<(), StorageError> {
        if let Some(ctx) = ctx {
            ctx.lock_mgr
                .lock_record(ctx.txn, self.file, rid, LockMode::Exclusive)?;
        }

        let hdr = self.hdr();
        let guard = self.fetch_data_page(rid.page_no, hdr.num_pages)?;
        let mut page = guard.write();
        let (bm_start, bm_end) = Self::bitmap_range(&hdr);
        if !bitmap::is_set(&page.data[bm_start..bm_end], rid.slot_no) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        let (start, end) = self.slot_range(&hdr, rid.slot_no);
        page.data[start..end].copy_from_slice(&buf[..hdr.record_size as usize]);
        Ok(())
    }

    /// Iterator over occupied rids in ascending `(page_no, slot_no)` order.
    /// Not a snapshot: rows deleted during the scan are skipped and rows
    /// inserted during it may or may not appear.
    pub fn scan(&self) -> Result<HeapScan<'_>, StorageError> {
        let mut scan = HeapScan {
            heap: self,
            rid: Rid::INVALID,
        };
        scan.advance(HEAP_FIRST_DATA_PAGE, 0)?;
        Ok(scan)
    }

    fn allocate_page(&self, hdr: &mut HeapFileHdr) -> Result<(), StorageError> {
        let guard = self.bpm.new_page(self.file)?;
        let page_no = guard.page_no();
        let mut page = guard.write();
        write_page_hdr(
            &mut page,
            &HeapPageHdr {
                next_free_page_no: hdr.first_free_page_no,
                num_records: 0,
                in_free_list: true,
            },
        );
        hdr.first_free_page_no = page_no;
        hdr.num_pages += 1;
        Ok(())
    }
}

pub struct HeapScan<'a> {
    heap: &'a HeapFile,
    rid: Rid,
}

impl<'a> HeapScan<'a> {
    pub fn is_end(&self) -> bool {
        self.rid.page_no == NO_PAGE
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn next(&mut self) -> Result<(), StorageError> {
        if self.is_end() {
            return Ok(());
        }
        let (page_no, slot_no) = (self.rid.page_no, self.rid.slot_no);
        self.advance(page_no, slot_no + 1)
    }

    fn advance(&mut self, mut page_no: PageNo, mut from_slot: u32) -> Result<(), StorageError> {
        let (num_pages, records_per_page, bitmap_size) = {
            let hdr = self.heap.hdr();
            (hdr.num_pages, hdr.records_per_page, hdr.bitmap_size)
        };
        while page_no >= HEAP_FIRST_DATA_PAGE && page_no < num_pages {
            let guard = self.heap.fetch_page_unchecked(page_no)?;
            let page = guard.read();
            let bm = &page.data[PAGE_HDR_SIZE..PAGE_HDR_SIZE + bitmap_size as usize];
            if let Some(slot) = bitmap::next_set(bm, records_per_page, from_slot) {
                self.rid = Rid::new(page_no, slot);
                return Ok(());
            }
            page_no += 1;
            from_slot = 0;
        }
        self.rid = Rid::INVALID;
        Ok(())
    }
}
