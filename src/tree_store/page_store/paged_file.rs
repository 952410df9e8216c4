use crate::tree_store::page_store::cursor::PageCursor;
use crate::{Result, StorageBackend};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) type PageId = u64;

/// One page held by the cache.
///
/// `version` is bumped every time a write cursor releases the page, which lets read cursors
/// detect that their copy went stale.
pub(crate) struct CachedPage {
    pub(super) frame: Arc<RwLock<Box<[u8]>>>,
    pub(super) version: AtomicU64,
    pub(super) dirty: AtomicBool,
}

impl CachedPage {
    fn new(data: Box<[u8]>) -> Self {
        Self {
            frame: Arc::new(RwLock::new(data)),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }
}

/// Page cache over a [`StorageBackend`].
///
/// Every page that has been touched stays cached until the file is dropped. Dirty pages are
/// written back by [`PagedFile::flush`].
pub(crate) struct PagedFile {
    backend: Box<dyn StorageBackend>,
    page_size: usize,
    pages: RwLock<HashMap<PageId, Arc<CachedPage>>>,
}

impl PagedFile {
    pub(crate) fn new(backend: Box<dyn StorageBackend>, page_size: usize) -> Self {
        Self {
            backend,
            page_size,
            pages: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// A cursor taking shared, optimistic access to the pages it visits
    pub(crate) fn read_cursor(&self) -> PageCursor<'_> {
        PageCursor::new(self, false)
    }

    /// A cursor taking exclusive access to the pages it visits
    pub(crate) fn write_cursor(&self) -> PageCursor<'_> {
        PageCursor::new(self, true)
    }

    /// Number of pages in the backing storage, ignoring pages only present in the cache
    #[cfg(test)]
    pub(crate) fn stored_page_count(&self) -> Result<u64> {
        Ok(self.backend.len()? / self.page_size as u64)
    }

    pub(super) fn pin(&self, page_id: PageId) -> Result<Arc<CachedPage>> {
        if let Some(page) = self.pages.read().get(&page_id) {
            return Ok(page.clone());
        }

        let mut pages = self.pages.write();
        if let Some(page) = pages.get(&page_id) {
            return Ok(page.clone());
        }
        let mut data = vec![0u8; self.page_size].into_boxed_slice();
        let offset = page_id * self.page_size as u64;
        if offset + self.page_size as u64 <= self.backend.len()? {
            self.backend.read(offset, &mut data)?;
        }
        let page = Arc::new(CachedPage::new(data));
        pages.insert(page_id, page.clone());
        Ok(page)
    }

    /// Writes all dirty pages to the backend, then syncs it
    pub(crate) fn flush(&self) -> Result {
        let mut dirty: Vec<(PageId, Arc<CachedPage>)> = self
            .pages
            .read()
            .iter()
            .filter(|(_, page)| page.dirty.load(Ordering::Acquire))
            .map(|(page_id, page)| (*page_id, page.clone()))
            .collect();
        dirty.sort_unstable_by_key(|(page_id, _)| *page_id);
        if let Some((last, _)) = dirty.last() {
            let required = (last + 1) * self.page_size as u64;
            if self.backend.len()? < required {
                self.backend.set_len(required)?;
            }
        }
        for (page_id, page) in dirty {
            page.dirty.store(false, Ordering::Release);
            let data = page.frame.read();
            self.backend
                .write(page_id * self.page_size as u64, &data)?;
        }
        self.backend.sync_data()?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::tree_store::page_store::PagedFile;
    use crate::{InMemoryBackend, StorageBackend};

    #[test]
    fn flush_writes_dirty_pages() {
        let file = PagedFile::new(Box::new(InMemoryBackend::new()), 512);
        {
            let mut cursor = file.write_cursor();
            cursor.next(3).unwrap();
            cursor.put_u48_at(10, 0xDEAD_BEEF);
        }
        assert_eq!(file.stored_page_count().unwrap(), 0);
        file.flush().unwrap();
        assert_eq!(file.stored_page_count().unwrap(), 4);

        let mut cursor = file.read_cursor();
        cursor.next(3).unwrap();
        assert_eq!(cursor.get_u48_at(10), 0xDEAD_BEEF);
    }

    #[test]
    fn reads_pages_from_backend() {
        let backend = InMemoryBackend::new();
        backend.set_len(1024).unwrap();
        backend.write(512 + 7, &[42]).unwrap();
        let file = PagedFile::new(Box::new(backend), 512);
        let mut cursor = file.read_cursor();
        cursor.next(1).unwrap();
        assert_eq!(cursor.get_u8_at(7), 42);
        // Beyond the end of the backend pages read as zeroes
        cursor.next(5).unwrap();
        assert_eq!(cursor.get_u8_at(7), 0);
    }
}
