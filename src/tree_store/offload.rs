use crate::tree_store::free_list::IdProvider;
use crate::tree_store::gen_safe_pointer::NO_NODE;
use crate::tree_store::generation::Generation;
use crate::tree_store::page_store::{PageCursor, PageId};
use crate::tree_store::tree_node::NODE_TYPE_OFFLOAD;
use crate::tree_store::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::{Error, Result};
use std::sync::Arc;

// Offload page layout:
// [0]      node type
// [1]      reserved
// [2..)    RECORDS_PER_PAGE records of [payload][next record id (6 bytes)]
const HEADER_LENGTH: usize = 2;
const NEXT_RECORD_SIZE: usize = 6;
pub(crate) const RECORDS_PER_PAGE: u64 = 4;
// Every record holds at least one byte of the largest possible entry
const MAX_CHAIN_LENGTH: usize = MAX_KEY_SIZE + MAX_VALUE_SIZE;

pub(crate) fn page_of_record(record_id: u64) -> PageId {
    record_id / RECORDS_PER_PAGE
}

fn record_id(page_id: PageId, slot: u64) -> u64 {
    page_id * RECORDS_PER_PAGE + slot
}

/// Stores the parts of entries that don't fit inline in a tree node as chains of fixed-size
/// records.
///
/// Records are carved from pages taken fresh from the id provider and are never handed back.
pub(crate) struct OffloadStore {
    record_size: usize,
    ids: Arc<dyn IdProvider>,
}

impl OffloadStore {
    pub(crate) fn new(page_size: usize, ids: Arc<dyn IdProvider>) -> Self {
        Self {
            record_size: (page_size - HEADER_LENGTH) / RECORDS_PER_PAGE as usize,
            ids,
        }
    }

    pub(crate) fn max_data_in_record(&self) -> usize {
        self.record_size - NEXT_RECORD_SIZE
    }

    fn record_offset(&self, slot: u64) -> usize {
        HEADER_LENGTH + slot as usize * self.record_size
    }

    pub(crate) fn records_needed(&self, length: usize) -> u64 {
        let max_data = self.max_data_in_record();
        (((length + max_data - 1) / max_data).max(1)) as u64
    }

    /// Allocates a linked chain of records able to hold `length` bytes. `cursor` only lends
    /// access to the file. Returns the id of the first record
    pub(crate) fn allocate(
        &self,
        cursor: &PageCursor,
        generation: Generation,
        length: usize,
    ) -> Result<u64> {
        let records = self.records_needed(length);
        let pages = (records + RECORDS_PER_PAGE - 1) / RECORDS_PER_PAGE;
        let mut page_ids = Vec::with_capacity(pages as usize);
        for _ in 0..pages {
            page_ids.push(self.ids.acquire_new_id(generation)?);
        }
        let record_at = |index: u64| {
            record_id(
                page_ids[(index / RECORDS_PER_PAGE) as usize],
                index % RECORDS_PER_PAGE,
            )
        };

        let mut writer = cursor.open_linked_cursor();
        for (page_index, page_id) in page_ids.iter().enumerate() {
            writer.next(*page_id)?;
            writer.put_zeros_at(0, writer.page_size());
            writer.put_u8_at(0, NODE_TYPE_OFFLOAD);
            let first = page_index as u64 * RECORDS_PER_PAGE;
            for index in first..records.min(first + RECORDS_PER_PAGE) {
                let next = if index + 1 < records {
                    record_at(index + 1)
                } else {
                    NO_NODE
                };
                let slot = index % RECORDS_PER_PAGE;
                writer.put_u48_at(self.record_offset(slot) + self.max_data_in_record(), next);
            }
        }

        Ok(record_at(0))
    }

    /// Moves `cursor` to the payload of `record_id` and returns the id of the next record in the
    /// chain. Raises a cursor exception if the page holds no offload records
    pub(crate) fn place_at(&self, cursor: &mut PageCursor, record_id: u64) -> Result<u64> {
        let page_id = page_of_record(record_id);
        cursor.next(page_id)?;
        if cursor.get_u8_at(0) != NODE_TYPE_OFFLOAD {
            cursor.set_cursor_exception(format!(
                "offload record {} points to a page that is not an offload page",
                record_id
            ));
            return Ok(NO_NODE);
        }
        let offset = self.record_offset(record_id % RECORDS_PER_PAGE);
        let next = cursor.get_u48_at(offset + self.max_data_in_record());
        cursor.set_offset(offset);
        Ok(next)
    }

    /// Stores `data` in a new chain and returns the id of its first record
    pub(crate) fn write_chain(
        &self,
        cursor: &PageCursor,
        generation: Generation,
        data: &[u8],
    ) -> Result<u64> {
        let first = self.allocate(cursor, generation, data.len())?;
        let mut writer = cursor.open_linked_cursor();
        let mut record = first;
        for chunk in data.chunks(self.max_data_in_record()) {
            let next = self.place_at(&mut writer, record)?;
            writer.put_bytes(chunk);
            record = next;
        }
        Ok(first)
    }

    /// Fills `out` from the chain starting at `record_id`, skipping its first `skip` bytes.
    /// Problems with the chain are raised as cursor exceptions on `cursor`
    pub(crate) fn read_chain(
        &self,
        cursor: &mut PageCursor,
        record_id: u64,
        skip: usize,
        out: &mut [u8],
    ) -> Result {
        let max_data = self.max_data_in_record();
        let mut reader = cursor.open_linked_cursor();
        let mut record = record_id;
        let mut position = 0;
        let mut written = 0;
        while written < out.len() {
            if record == NO_NODE {
                cursor.set_cursor_exception(format!(
                    "offload chain from record {} is too short",
                    record_id
                ));
                return Ok(());
            }
            let next = self.place_at(&mut reader, record)?;
            if reader.has_cursor_exception() || reader.check_and_clear_bounds_flag() {
                cursor.set_cursor_exception(format!(
                    "offload chain from record {} is broken at record {}",
                    record_id, record
                ));
                return Ok(());
            }
            let record_end = position + max_data;
            if record_end > skip {
                let start = skip.saturating_sub(position);
                let len = (max_data - start).min(out.len() - written);
                let offset = reader.offset() + start;
                reader.get_bytes_at(offset, &mut out[written..(written + len)]);
                written += len;
            }
            position = record_end;
            record = next;
        }
        Ok(())
    }

    /// Ids of the pages a chain occupies, in chain order without repeats
    pub(crate) fn chain_pages(&self, cursor: &PageCursor, record_id: u64) -> Result<Vec<PageId>> {
        let mut reader = cursor.open_linked_cursor();
        let mut pages: Vec<PageId> = vec![];
        let mut record = record_id;
        let mut steps = 0;
        while record != NO_NODE {
            let next = self.place_at(&mut reader, record)?;
            reader.check_and_clear_cursor_exception()?;
            let page_id = page_of_record(record);
            if pages.last() != Some(&page_id) {
                pages.push(page_id);
            }
            record = next;
            steps += 1;
            if steps > MAX_CHAIN_LENGTH {
                return Err(Error::Corrupted(format!(
                    "offload chain from record {} does not terminate",
                    record_id
                )));
            }
        }
        Ok(pages)
    }
}
