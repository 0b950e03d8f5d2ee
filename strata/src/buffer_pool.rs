//! Manages the buffer pool, a collection of in-memory frames caching pages
//! from every registered file. Pages are addressed by `(FileId, PageNo)`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::pager::Pager;
use crate::{FileId, Page, PageNo};

const DEFAULT_POOL_SIZE: usize = 256;

/// Address of a page across all registered files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file: FileId,
    pub page_no: PageNo,
}

#[derive(Debug)]
struct FrameMeta {
    key: Option<PageKey>,
    is_dirty: bool,
    pin_count: u32,
    referenced: bool,
}

/// The buffer pool manager.
///
/// Frames are `parking_lot::RwLock<Page>`; a `PageGuard` pins its frame for
/// its whole lifetime and unpins on drop, so a guard held across an error
/// path still releases the pin.
pub struct BufferPoolManager {
    files: Mutex<HashMap<FileId, Pager>>,
    next_file_id: AtomicU32,
    frames: Vec<RwLock<Page>>,
    frame_meta: Vec<Mutex<FrameMeta>>,
    page_table: RwLock<HashMap<PageKey, usize>>,
    // Serializes the whole miss path: victim selection, eviction and load.
    replacer: Mutex<Replacer>,
}

#[derive(Debug)]
struct Replacer {
    free_list: Vec<usize>,
    clock_hand: usize,
}

/// An RAII guard for a pinned page.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    key: PageKey,
    frame_idx: usize,
}

impl<'a> PageGuard<'a> {
    pub fn page_no(&self) -> PageNo {
        self.key.page_no
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Page> {
        self.bpm.frames[self.frame_idx].read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Page> {
        let mut meta = lock_mutex_recover(&self.bpm.frame_meta[self.frame_idx]);
        meta.is_dirty = true;
        drop(meta);
        self.bpm.frames[self.frame_idx].write()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.bpm.unpin_frame(self.frame_idx);
    }
}

fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BufferPoolManager {
    pub fn new() -> Self {
        Self::with_pool_size(DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut frame_meta = Vec::with_capacity(pool_size);
        let mut free_list = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(RwLock::new(Page::new(0)));
            frame_meta.push(Mutex::new(FrameMeta {
                key: None,
                is_dirty: false,
                pin_count: 0,
                referenced: false,
            }));
            free_list.push(i);
        }
        Self {
            files: Mutex::new(HashMap::new()),
            next_file_id: AtomicU32::new(1),
            frames,
            frame_meta,
            page_table: RwLock::new(HashMap::new()),
            replacer: Mutex::new(Replacer {
                free_list,
                clock_hand: 0,
            }),
        }
    }

    /// Opens (creating if absent) a file and registers its pager, returning
    /// the id used to address its pages.
    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> io::Result<FileId> {
        let pager = Pager::open(path)?;
        let file = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        lock_mutex_recover(&self.files).insert(file, pager);
        Ok(file)
    }

    /// Flushes and drops every cached page of `file`, then deregisters it.
    pub fn close_file(&self, file: FileId) -> io::Result<()> {
        self.flush_file(file)?;
        let keys: Vec<PageKey> = {
            let page_table = self.page_table.read();
            page_table
                .keys()
                .filter(|k| k.file == file)
                .copied()
                .collect()
        };
        let mut replacer = lock_mutex_recover(&self.replacer);
        let mut page_table = self.page_table.write();
        for key in keys {
            if let Some(frame_idx) = page_table.remove(&key) {
                let mut meta = lock_mutex_recover(&self.frame_meta[frame_idx]);
                meta.key = None;
                meta.is_dirty = false;
                meta.pin_count = 0;
                meta.referenced = false;
                replacer.free_list.push(frame_idx);
            }
        }
        lock_mutex_recover(&self.files).remove(&file);
        Ok(())
    }

    pub fn num_pages(&self, file: FileId) -> io::Result<u32> {
        let files = lock_mutex_recover(&self.files);
        files
            .get(&file)
            .map(|p| p.num_pages)
            .ok_or_else(|| io::Error::other("file not registered"))
    }

    pub fn acquire_page(&self, key: PageKey) -> io::Result<PageGuard<'_>> {
        loop {
            let frame_idx = {
                let page_table = self.page_table.read();
                page_table.get(&key).copied()
            };
            if let Some(frame_idx) = frame_idx {
                let mut meta = lock_mutex_recover(&self.frame_meta[frame_idx]);
                // The frame may have been re-targeted between the table
                // lookup and taking the meta lock; retry if so.
                if meta.key != Some(key) {
                    continue;
                }
                meta.pin_count += 1;
                meta.referenced = true;
                return Ok(PageGuard {
                    bpm: self,
                    key,
                    frame_idx,
                });
            }
            return self.load_page(key);
        }
    }

    /// Allocates a fresh page at the end of `file` and pins it.
    pub fn new_page(&self, file: FileId) -> io::Result<PageGuard<'_>> {
        let page_no = {
            let mut files = lock_mutex_recover(&self.files);
            let pager = files
                .get_mut(&file)
                .ok_or_else(|| io::Error::other("file not registered"))?;
            pager.allocate_page()?
        };
        let key = PageKey { file, page_no };

        let mut replacer = lock_mutex_recover(&self.replacer);
        let frame_idx = self.find_victim_frame(&mut replacer)?;
        self.evict_if_dirty(frame_idx)?;
        self.install_frame(frame_idx, key, Page::new(page_no), true);
        Ok(PageGuard {
            bpm: self,
            key,
            frame_idx,
        })
    }

    fn load_page(&self, key: PageKey) -> io::Result<PageGuard<'_>> {
        let mut replacer = lock_mutex_recover(&self.replacer);

        // Someone may have loaded the page while we waited for the replacer.
        if let Some(&frame_idx) = self.page_table.read().get(&key) {
            let mut meta = lock_mutex_recover(&self.frame_meta[frame_idx]);
            if meta.key == Some(key) {
                meta.pin_count += 1;
                meta.referenced = true;
                return Ok(PageGuard {
                    bpm: self,
                    key,
                    frame_idx,
                });
            }
        }

        let frame_idx = self.find_victim_frame(&mut replacer)?;
        self.evict_if_dirty(frame_idx)?;

        let page = {
            let mut files = lock_mutex_recover(&self.files);
            let pager = files
                .get_mut(&key.file)
                .ok_or_else(|| io::Error::other("file not registered"))?;
            pager.read_page(key.page_no)?
        };

        self.install_frame(frame_idx, key, page, false);
        Ok(PageGuard {
            bpm: self,
            key,
            frame_idx,
        })
    }

    fn install_frame(&self, frame_idx: usize, key: PageKey, page: Page, dirty: bool) {
        *self.frames[frame_idx].write() = page;
        {
            let mut meta = lock_mutex_recover(&self.frame_meta[frame_idx]);
            meta.key = Some(key);
            meta.is_dirty = dirty;
            meta.pin_count = 1;
            meta.referenced = true;
        }
        self.page_table.write().insert(key, frame_idx);
    }

    fn find_victim_frame(&self, replacer: &mut Replacer) -> io::Result<usize> {
        if let Some(frame_idx) = replacer.free_list.pop() {
            return Ok(frame_idx);
        }

        let frame_count = self.frames.len();
        // Two full sweeps: the first clears second-chance bits, the second
        // can then pick a victim.
        for _ in 0..(frame_count * 2) {
            let frame_idx = replacer.clock_hand;
            replacer.clock_hand = (replacer.clock_hand + 1) % frame_count;

            let mut meta = lock_mutex_recover(&self.frame_meta[frame_idx]);
            if meta.pin_count == 0 {
                if meta.referenced {
                    meta.referenced = false;
                } else {
                    return Ok(frame_idx);
                }
            }
        }

        Err(io::Error::other("all pages are pinned"))
    }

    fn evict_if_dirty(&self, frame_idx: usize) -> io::Result<()> {
        let mut meta = lock_mutex_recover(&self.frame_meta[frame_idx]);
        if let Some(old_key) = meta.key {
            if meta.is_dirty {
                let frame = self.frames[frame_idx].read();
                let mut files = lock_mutex_recover(&self.files);
                if let Some(pager) = files.get_mut(&old_key.file) {
                    pager.write_page(&frame)?;
                }
                meta.is_dirty = false;
            }
            self.page_table.write().remove(&old_key);
            meta.key = None;
        }
        Ok(())
    }

    fn unpin_frame(&self, frame_idx: usize) {
        let mut meta = lock_mutex_recover(&self.frame_meta[frame_idx]);
        if meta.pin_count > 0 {
            meta.pin_count -= 1;
        }
    }

    pub fn flush_file(&self, file: FileId) -> io::Result<()> {
        for (idx, meta_mutex) in self.frame_meta.iter().enumerate() {
            let mut meta = lock_mutex_recover(meta_mutex);
            match meta.key {
                Some(key) if key.file == file && meta.is_dirty => {
                    let frame = self.frames[idx].read();
                    let mut files = lock_mutex_recover(&self.files);
                    if let Some(pager) = files.get_mut(&file) {
                        pager.write_page(&frame)?;
                    }
                    meta.is_dirty = false;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> io::Result<()> {
        for (idx, meta_mutex) in self.frame_meta.iter().enumerate() {
            let mut meta = lock_mutex_recover(meta_mutex);
            if let Some(key) = meta.key {
                if meta.is_dirty {
                    let frame = self.frames[idx].read();
                    let mut files = lock_mutex_recover(&self.files);
                    if let Some(pager) = files.get_mut(&key.file) {
                        pager.write_page(&frame)?;
                    }
                    meta.is_dirty = false;
                }
            }
        }
        Ok(())
    }
}

impl Default for BufferPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_page_and_reacquire() {
        let dir = tempdir().unwrap();
        let bpm = BufferPoolManager::with_pool_size(8);
        let file = bpm.open_file(dir.path().join("t.db")).unwrap();

        let page_no = {
            let guard = bpm.new_page(file).unwrap();
            let mut page = guard.write();
            page.data[0] = 42;
            page.page_no
        };

        let guard = bpm
            .acquire_page(PageKey { file, page_no })
            .unwrap();
        assert_eq!(guard.read().data[0], 42);
    }

    #[test]
    fn test_eviction_persists_dirty_pages() {
        let dir = tempdir().unwrap();
        let bpm = BufferPoolManager::with_pool_size(4);
        let file = bpm.open_file(dir.path().join("t.db")).unwrap();

        let mut page_nos = Vec::new();
        for i in 0..16u8 {
            let guard = bpm.new_page(file).unwrap();
            guard.write().data[0] = i;
            page_nos.push(guard.page_no());
        }

        // Every page was evicted and reloaded at least once with a pool of 4.
        for (i, page_no) in page_nos.iter().enumerate() {
            let guard = bpm
                .acquire_page(PageKey {
                    file,
                    page_no: *page_no,
                })
                .unwrap();
            assert_eq!(guard.read().data[0], i as u8);
        }
    }

    #[test]
    fn test_all_pinned_fails() {
        let dir = tempdir().unwrap();
        let bpm = BufferPoolManager::with_pool_size(2);
        let file = bpm.open_file(dir.path().join("t.db")).unwrap();

        let _g1 = bpm.new_page(file).unwrap();
        let _g2 = bpm.new_page(file).unwrap();
        assert!(bpm.new_page(file).is_err());
    }

    #[test]
    fn test_close_file_flushes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let bpm = BufferPoolManager::with_pool_size(8);
        let file = bpm.open_file(&path).unwrap();
        {
            let guard = bpm.new_page(file).unwrap();
            guard.write().data[10] = 7;
        }
        bpm.close_file(file).unwrap();

        let file = bpm.open_file(&path).unwrap();
        let guard = bpm
            .acquire_page(PageKey { file, page_no: 0 })
            .unwrap();
        assert_eq!(guard.read().data[10], 7);
    }
}
