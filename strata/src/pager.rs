use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{Page, PageNo, PAGE_SIZE};

/// Block I/O for one file. Every file is a sequence of `PAGE_SIZE` frames;
/// reads past the end return a zeroed page so callers can treat freshly
/// allocated pages uniformly.
pub struct Pager {
    file: File,
    pub num_pages: u32,
}

impl Pager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path_ref = path.as_ref();
        crate::strata_debug_log!("[Pager::open] Opening file at: {path_ref:?}");
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self { file, num_pages })
    }

    pub fn read_page(&mut self, page_no: PageNo) -> io::Result<Page> {
        let mut page = Page::new(page_no);
        if page_no >= self.num_pages {
            return Ok(page);
        }

        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        let bytes_read = self.file.read(&mut page.data)?;
        if bytes_read < PAGE_SIZE {
            for b in &mut page.data[bytes_read..] {
                *b = 0;
            }
        }

        Ok(page)
    }

    pub fn write_page(&mut self, page: &Page) -> io::Result<()> {
        let offset = page.page_no as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&page.data)?;
        self.file.sync_all()?;
        if page.page_no >= self.num_pages {
            self.num_pages = page.page_no + 1;
        }
        Ok(())
    }

    /// Allocation always extends the file; freed pages are never handed out
    /// again at this layer.
    pub fn allocate_page(&mut self) -> io::Result<PageNo> {
        let page_no = self.num_pages;
        self.num_pages += 1;
        crate::strata_debug_log!("[Pager::allocate_page] page_no: {page_no}");
        Ok(page_no)
    }
}
