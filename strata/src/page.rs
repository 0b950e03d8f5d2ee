use crate::{PageNo, PAGE_SIZE};

/// A raw page frame. The interpretation of `data` belongs to whichever
/// module owns the file: the heap lays out a page header, a slot bitmap and
/// fixed-width slots, the B+tree lays out a node header and parallel
/// key/rid arrays. Page 0 of every file holds that file's header record.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_no: PageNo,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(page_no: PageNo) -> Self {
        Page {
            page_no,
            data: [0; PAGE_SIZE],
        }
    }
}
