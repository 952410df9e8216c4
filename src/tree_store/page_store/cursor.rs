use crate::tree_store::page_store::paged_file::{CachedPage, PageId, PagedFile};
use crate::{Error, Result};
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::RawRwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const UNBOUND: PageId = PageId::MAX;

enum Pin {
    // Reads go to the cursor's private copy of the page
    Shared {
        page: Arc<CachedPage>,
        version: u64,
    },
    Exclusive {
        page: Arc<CachedPage>,
        guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
        modified: bool,
    },
}

/// Positioned access to one page at a time.
///
/// Shared cursors read from a copy of the page taken when it was pinned. After reading, callers
/// check [`PageCursor::should_retry`], which refreshes the copy and returns true if a writer
/// released the page in the meantime; everything read since pinning must then be discarded.
/// Exclusive cursors hold the page's write lock until they move on or are dropped, and never
/// need to retry.
///
/// Out-of-bounds accesses never panic: reads return zeroes, writes are dropped, and the bounds
/// flag is raised. Layout code that detects implausible data raises a cursor exception instead
/// of failing, so that a concurrent write can be retried away.
pub(crate) struct PageCursor<'a> {
    file: &'a PagedFile,
    exclusive: bool,
    page_id: PageId,
    pin: Option<Pin>,
    snapshot: Vec<u8>,
    offset: usize,
    out_of_bounds: bool,
    cursor_exception: Option<String>,
}

impl<'a> PageCursor<'a> {
    pub(super) fn new(file: &'a PagedFile, exclusive: bool) -> Self {
        Self {
            file,
            exclusive,
            page_id: UNBOUND,
            pin: None,
            snapshot: vec![],
            offset: 0,
            out_of_bounds: false,
            cursor_exception: None,
        }
    }

    /// A new, unpinned cursor over the same file with the same access mode
    pub(crate) fn open_linked_cursor(&self) -> PageCursor<'a> {
        PageCursor::new(self.file, self.exclusive)
    }

    /// Moves the cursor to `page_id`, releasing the current page
    pub(crate) fn next(&mut self, page_id: PageId) -> Result {
        self.unpin();
        let page = self.file.pin(page_id)?;
        if self.exclusive {
            let guard = page.frame.write_arc();
            self.pin = Some(Pin::Exclusive {
                page,
                guard,
                modified: false,
            });
        } else {
            let version = Self::take_snapshot(&page, &mut self.snapshot);
            self.pin = Some(Pin::Shared { page, version });
        }
        self.page_id = page_id;
        self.offset = 0;
        Ok(())
    }

    fn take_snapshot(page: &CachedPage, out: &mut Vec<u8>) -> u64 {
        let frame = page.frame.read();
        out.clear();
        out.extend_from_slice(&frame);
        // Writers bump the version before releasing the lock, so this matches the copy
        page.version.load(Ordering::Acquire)
    }

    fn unpin(&mut self) {
        if let Some(Pin::Exclusive {
            page,
            guard,
            modified,
        }) = self.pin.take()
        {
            if modified {
                page.dirty.store(true, Ordering::Release);
                page.version.fetch_add(1, Ordering::AcqRel);
            }
            drop(guard);
        }
        self.page_id = UNBOUND;
    }

    pub(crate) fn current_page_id(&self) -> PageId {
        self.page_id
    }

    pub(crate) fn page_size(&self) -> usize {
        self.file.page_size()
    }

    /// Returns true if the page changed since it was pinned (or since the last retry), in which
    /// case the cursor now reads the latest contents, its offset is reset and its flags cleared
    pub(crate) fn should_retry(&mut self) -> bool {
        if let Some(Pin::Shared { page, version }) = &mut self.pin {
            if page.version.load(Ordering::Acquire) == *version {
                return false;
            }
            *version = Self::take_snapshot(page, &mut self.snapshot);
            self.offset = 0;
            self.out_of_bounds = false;
            self.cursor_exception = None;
            return true;
        }
        false
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub(crate) fn check_and_clear_bounds_flag(&mut self) -> bool {
        std::mem::replace(&mut self.out_of_bounds, false)
    }

    /// Records that the data read from this page is implausible. The first message is kept
    pub(crate) fn set_cursor_exception(&mut self, message: impl Into<String>) {
        if self.cursor_exception.is_none() {
            self.cursor_exception = Some(message.into());
        }
    }

    pub(crate) fn has_cursor_exception(&self) -> bool {
        self.cursor_exception.is_some()
    }

    pub(crate) fn check_and_clear_cursor_exception(&mut self) -> Result {
        match self.cursor_exception.take() {
            Some(message) => Err(Error::Corrupted(format!(
                "page {}: {}",
                self.page_id, message
            ))),
            None => Ok(()),
        }
    }

    fn data(&self) -> &[u8] {
        match &self.pin {
            Some(Pin::Shared { .. }) => &self.snapshot,
            Some(Pin::Exclusive { guard, .. }) => &guard[..],
            None => &[],
        }
    }

    fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.pin {
            Some(Pin::Exclusive {
                guard, modified, ..
            }) => {
                *modified = true;
                Some(&mut guard[..])
            }
            _ => None,
        }
    }

    fn read_range(&mut self, offset: usize, len: usize) -> Option<&[u8]> {
        if offset + len > self.data().len() {
            self.out_of_bounds = true;
            return None;
        }
        Some(&self.data()[offset..(offset + len)])
    }

    fn get_array<const N: usize>(&mut self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.read_range(offset, N) {
            out.copy_from_slice(src);
        }
        out
    }

    fn put_slice(&mut self, offset: usize, bytes: &[u8]) {
        let written = match self.data_mut() {
            Some(data) if offset + bytes.len() <= data.len() => {
                data[offset..(offset + bytes.len())].copy_from_slice(bytes);
                true
            }
            _ => false,
        };
        if !written {
            self.out_of_bounds = true;
        }
    }

    pub(crate) fn get_u8_at(&mut self, offset: usize) -> u8 {
        self.get_array::<1>(offset)[0]
    }

    pub(crate) fn get_u16_at(&mut self, offset: usize) -> u16 {
        u16::from_be_bytes(self.get_array(offset))
    }

    pub(crate) fn get_u32_at(&mut self, offset: usize) -> u32 {
        u32::from_be_bytes(self.get_array(offset))
    }

    /// Reads a 6 byte unsigned value
    pub(crate) fn get_u48_at(&mut self, offset: usize) -> u64 {
        let bytes: [u8; 6] = self.get_array(offset);
        let mut buffer = [0u8; 8];
        buffer[2..].copy_from_slice(&bytes);
        u64::from_be_bytes(buffer)
    }

    pub(crate) fn get_u8(&mut self) -> u8 {
        let value = self.get_u8_at(self.offset);
        self.offset += 1;
        value
    }

    pub(crate) fn get_u16(&mut self) -> u16 {
        let value = self.get_u16_at(self.offset);
        self.offset += 2;
        value
    }

    pub(crate) fn get_u48(&mut self) -> u64 {
        let value = self.get_u48_at(self.offset);
        self.offset += 6;
        value
    }

    pub(crate) fn get_bytes_at(&mut self, offset: usize, out: &mut [u8]) {
        match self.read_range(offset, out.len()) {
            Some(src) => out.copy_from_slice(src),
            None => out.fill(0),
        }
    }

    pub(crate) fn get_bytes(&mut self, out: &mut [u8]) {
        self.get_bytes_at(self.offset, out);
        self.offset += out.len();
    }

    pub(crate) fn put_u8_at(&mut self, offset: usize, value: u8) {
        self.put_slice(offset, &[value]);
    }

    pub(crate) fn put_u16_at(&mut self, offset: usize, value: u16) {
        self.put_slice(offset, &value.to_be_bytes());
    }

    pub(crate) fn put_u32_at(&mut self, offset: usize, value: u32) {
        self.put_slice(offset, &value.to_be_bytes());
    }

    pub(crate) fn put_u48_at(&mut self, offset: usize, value: u64) {
        debug_assert!(value < (1 << 48));
        self.put_slice(offset, &value.to_be_bytes()[2..]);
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.put_u8_at(self.offset, value);
        self.offset += 1;
    }

    pub(crate) fn put_u16(&mut self, value: u16) {
        self.put_u16_at(self.offset, value);
        self.offset += 2;
    }

    pub(crate) fn put_u48(&mut self, value: u64) {
        self.put_u48_at(self.offset, value);
        self.offset += 6;
    }

    pub(crate) fn put_bytes_at(&mut self, offset: usize, data: &[u8]) {
        self.put_slice(offset, data);
    }

    pub(crate) fn put_bytes(&mut self, data: &[u8]) {
        self.put_slice(self.offset, data);
        self.offset += data.len();
    }

    pub(crate) fn put_zeros_at(&mut self, offset: usize, len: usize) {
        let written = match self.data_mut() {
            Some(data) if offset + len <= data.len() => {
                data[offset..(offset + len)].fill(0);
                true
            }
            _ => false,
        };
        if !written {
            self.out_of_bounds = true;
        }
    }

    /// Moves `len` bytes starting at `source_offset` by `shift` bytes within the page
    pub(crate) fn shift_bytes(&mut self, source_offset: usize, len: usize, shift: isize) {
        let target = source_offset as isize + shift;
        let moved = match self.data_mut() {
            Some(data)
                if target >= 0
                    && source_offset + len <= data.len()
                    && target as usize + len <= data.len() =>
            {
                data.copy_within(source_offset..(source_offset + len), target as usize);
                true
            }
            _ => false,
        };
        if !moved {
            self.out_of_bounds = true;
        }
    }

    /// Copies `len` bytes from this page to the page of `target`. Returns the number of bytes
    /// copied
    pub(crate) fn copy_to(
        &mut self,
        source_offset: usize,
        target: &mut PageCursor,
        target_offset: usize,
        len: usize,
    ) -> usize {
        if source_offset + len > self.data().len() {
            self.out_of_bounds = true;
            return 0;
        }
        target.put_slice(target_offset, &self.data()[source_offset..(source_offset + len)]);
        len
    }
}

impl<'a> Drop for PageCursor<'a> {
    fn drop(&mut self) {
        self.unpin();
    }
}
