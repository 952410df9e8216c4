use crate::tree_store::gen_safe_pointer::NO_NODE;
use crate::tree_store::generation::Generation;
use crate::tree_store::page_store::{PageId, PagedFile};
use crate::tree_store::tree_node::NODE_TYPE_FREE_LIST_NODE;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

// Free-list page layout:
// [0]      node type
// [1..7)   id of the next free-list page
// [7..)    entries of generation (4 bytes) + released page id (6 bytes)
const BYTE_POS_NEXT: usize = 1;
const HEADER_LENGTH: usize = BYTE_POS_NEXT + 6;
const ENTRY_SIZE: usize = 4 + 6;

/// Source of page ids for the tree and its offload records
pub(crate) trait IdProvider: Send + Sync {
    /// Returns an id that is free for writing at the unstable generation
    fn acquire_new_id(&self, generation: Generation) -> Result<PageId>;

    /// Hands back an id that became unreachable at the unstable generation
    fn release_id(&self, generation: Generation, id: PageId) -> Result;
}

/// Bookkeeping of a [`FreeListIdProvider`], persisted in the tree state
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct FreeListMetaData {
    pub(crate) last_id: PageId,
    pub(crate) write_page_id: PageId,
    pub(crate) read_page_id: PageId,
    pub(crate) write_pos: usize,
    pub(crate) read_pos: usize,
}

/// Id provider that recycles released ids through a queue of free-list pages.
///
/// Released ids are appended together with the generation they were released at. An id is only
/// handed out again once that generation has become stable, so nothing the last checkpoint can
/// still reach is ever overwritten. When the queue has nothing reusable, ids past the highest one
/// ever handed out are used.
pub(crate) struct FreeListIdProvider {
    file: Arc<PagedFile>,
    max_entries: usize,
    state: Mutex<FreeListMetaData>,
}

impl FreeListIdProvider {
    /// Creates an empty free list whose first page is the id after `last_id`
    pub(crate) fn create(file: Arc<PagedFile>, last_id: PageId) -> Result<Self> {
        let page_id = last_id + 1;
        let provider = Self::new(
            file,
            FreeListMetaData {
                last_id: page_id,
                write_page_id: page_id,
                read_page_id: page_id,
                write_pos: 0,
                read_pos: 0,
            },
        );
        provider.initialize_page(page_id)?;
        Ok(provider)
    }

    /// Resumes a free list from persisted bookkeeping
    pub(crate) fn new(file: Arc<PagedFile>, meta: FreeListMetaData) -> Self {
        let max_entries = (file.page_size() - HEADER_LENGTH) / ENTRY_SIZE;
        Self {
            file,
            max_entries,
            state: Mutex::new(meta),
        }
    }

    pub(crate) fn meta_data(&self) -> FreeListMetaData {
        *self.state.lock()
    }

    pub(crate) fn last_id(&self) -> PageId {
        self.state.lock().last_id
    }

    fn entry_offset(pos: usize) -> usize {
        HEADER_LENGTH + pos * ENTRY_SIZE
    }

    fn initialize_page(&self, page_id: PageId) -> Result {
        let mut cursor = self.file.write_cursor();
        cursor.next(page_id)?;
        cursor.put_zeros_at(0, cursor.page_size());
        cursor.put_u8_at(0, NODE_TYPE_FREE_LIST_NODE);
        cursor.put_u48_at(BYTE_POS_NEXT, NO_NODE);
        Ok(())
    }

    fn acquire_from_free_list(
        &self,
        state: &mut FreeListMetaData,
        generation: Generation,
    ) -> Result<Option<PageId>> {
        if state.read_page_id == state.write_page_id && state.read_pos == state.write_pos {
            return Ok(None);
        }

        let mut cursor = self.file.write_cursor();
        cursor.next(state.read_page_id)?;
        if cursor.get_u8_at(0) != NODE_TYPE_FREE_LIST_NODE {
            return Err(Error::Corrupted(format!(
                "page {} is not a free-list page",
                state.read_page_id
            )));
        }
        let offset = Self::entry_offset(state.read_pos);
        let released_at = cursor.get_u32_at(offset) as u64;
        if released_at > generation.stable() {
            // Entries are in release order, so nothing later is reusable either
            return Ok(None);
        }
        let id = cursor.get_u48_at(offset + 4);
        state.read_pos += 1;

        if state.read_pos == self.max_entries {
            let exhausted = state.read_page_id;
            state.read_page_id = cursor.get_u48_at(BYTE_POS_NEXT);
            state.read_pos = 0;
            drop(cursor);
            self.release_locked(state, generation, exhausted)?;
        }

        Ok(Some(id))
    }

    fn release_locked(
        &self,
        state: &mut FreeListMetaData,
        generation: Generation,
        id: PageId,
    ) -> Result {
        let mut cursor = self.file.write_cursor();
        cursor.next(state.write_page_id)?;
        let offset = Self::entry_offset(state.write_pos);
        cursor.put_u32_at(offset, generation.unstable() as u32);
        cursor.put_u48_at(offset + 4, id);
        state.write_pos += 1;

        if state.write_pos == self.max_entries {
            // Free-list pages never come from the free list itself
            state.last_id += 1;
            let new_page = state.last_id;
            cursor.put_u48_at(BYTE_POS_NEXT, new_page);
            drop(cursor);
            self.initialize_page(new_page)?;
            state.write_page_id = new_page;
            state.write_pos = 0;
        }

        Ok(())
    }

    /// Ids queued in the free list, reusable or not
    pub(crate) fn free_ids(&self) -> Result<Vec<PageId>> {
        let state = *self.state.lock();
        let mut ids = vec![];
        let mut cursor = self.file.read_cursor();
        let mut page_id = state.read_page_id;
        let mut pos = state.read_pos;
        let mut visited = 0;
        while page_id != state.write_page_id || pos < state.write_pos {
            cursor.next(page_id)?;
            let end = if page_id == state.write_page_id {
                state.write_pos
            } else {
                self.max_entries
            };
            while pos < end {
                ids.push(cursor.get_u48_at(Self::entry_offset(pos) + 4));
                pos += 1;
            }
            if page_id == state.write_page_id {
                break;
            }
            page_id = cursor.get_u48_at(BYTE_POS_NEXT);
            pos = 0;
            visited += 1;
            if page_id == NO_NODE || visited > state.last_id {
                return Err(Error::Corrupted("free-list chain is broken".to_string()));
            }
        }
        Ok(ids)
    }

    /// Ids of the pages holding the free list itself
    pub(crate) fn free_list_pages(&self) -> Result<Vec<PageId>> {
        let state = *self.state.lock();
        let mut pages = vec![state.read_page_id];
        let mut cursor = self.file.read_cursor();
        let mut page_id = state.read_page_id;
        while page_id != state.write_page_id {
            cursor.next(page_id)?;
            page_id = cursor.get_u48_at(BYTE_POS_NEXT);
            if page_id == NO_NODE || pages.len() as u64 > state.last_id {
                return Err(Error::Corrupted("free-list chain is broken".to_string()));
            }
            pages.push(page_id);
        }
        Ok(pages)
    }
}

impl IdProvider for FreeListIdProvider {
    fn acquire_new_id(&self, generation: Generation) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(id) = self.acquire_from_free_list(&mut state, generation)? {
            return Ok(id);
        }
        state.last_id += 1;
        Ok(state.last_id)
    }

    fn release_id(&self, generation: Generation, id: PageId) -> Result {
        let mut state = self.state.lock();
        self.release_locked(&mut state, generation, id)
    }
}

#[cfg(test)]
mod test {
    use crate::tree_store::free_list::{FreeListIdProvider, IdProvider};
    use crate::tree_store::generation::Generation;
    use crate::tree_store::page_store::PagedFile;
    use crate::InMemoryBackend;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn provider() -> FreeListIdProvider {
        let file = Arc::new(PagedFile::new(Box::new(InMemoryBackend::new()), 512));
        FreeListIdProvider::create(file, 3).unwrap()
    }

    #[test]
    fn fresh_ids_follow_the_free_list_page() {
        let ids = provider();
        let generation = Generation::initial();
        assert_eq!(ids.last_id(), 4);
        assert_eq!(ids.acquire_new_id(generation).unwrap(), 5);
        assert_eq!(ids.acquire_new_id(generation).unwrap(), 6);
    }

    #[test]
    fn released_ids_wait_for_stable_generation() {
        let ids = provider();
        let generation = Generation::initial();
        let a = ids.acquire_new_id(generation).unwrap();
        ids.release_id(generation, a).unwrap();
        // Released at the current unstable generation: not reusable yet
        assert_ne!(ids.acquire_new_id(generation).unwrap(), a);

        let generation = generation.next();
        assert_eq!(ids.acquire_new_id(generation).unwrap(), a);
        assert!(ids.free_ids().unwrap().is_empty());
    }

    #[test]
    fn free_list_spans_pages() {
        let ids = provider();
        let mut generation = Generation::initial();
        let acquired: Vec<u64> = (0..200)
            .map(|_| ids.acquire_new_id(generation).unwrap())
            .collect();
        for id in acquired.iter() {
            ids.release_id(generation, *id).unwrap();
        }
        assert!(ids.free_list_pages().unwrap().len() > 1);
        let mut queued = ids.free_ids().unwrap();
        queued.sort_unstable();
        assert_eq!(queued, acquired);

        generation = generation.next();
        let mut reused = HashSet::new();
        for _ in 0..200 {
            reused.insert(ids.acquire_new_id(generation).unwrap());
        }
        let expected: HashSet<u64> = acquired.into_iter().collect();
        // Exhausted free-list pages are released too, at the unstable generation
        assert_eq!(reused, expected);
        let last = ids.last_id();
        assert_eq!(ids.acquire_new_id(generation).unwrap(), last + 1);
    }
}
