use crate::tree_store::dynamic_size::{
    self, key_child_header_size, key_value_header_size, put_key_child_header,
    put_key_value_header, MAX_KEY_VALUE_HEADER_SIZE, OFFLOAD_ID_SIZE,
};
use crate::tree_store::free_list::IdProvider;
use crate::tree_store::gen_safe_pointer::{GSPP_SIZE, NO_NODE};
use crate::tree_store::generation::Generation;
use crate::tree_store::offload::OffloadStore;
use crate::tree_store::page_store::{PageCursor, PageId};
use crate::tree_store::tree_node::{
    self, NodeLayout, NodeSpace, NodeType, Overflow, TreeNode, BASE_HEADER_LENGTH,
};
use crate::tree_store::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::{Error, Result};
use std::sync::Arc;

// Dynamic node layout:
// [shared header][alloc offset (2)][dead space (2)]
// leaf:     [offset 0][offset 1]..[offset n-1]  ...free...  [entries]
// internal: [child 0][offset 0][child 1][offset 1]..[offset n-1][child n]  ...free...  [entries]
//
// Entries are allocated backwards from the end of the page. Removing an entry only sets its
// tombstone bit and accounts its bytes as dead space, which defragmentation reclaims.
const BYTE_POS_ALLOC_OFFSET: usize = BASE_HEADER_LENGTH;
const BYTE_POS_DEAD_SPACE: usize = BYTE_POS_ALLOC_OFFSET + 2;
const HEADER_LENGTH_DYNAMIC: usize = BYTE_POS_DEAD_SPACE + 2;

const OFFSET_SIZE: usize = 2;
const INTERNAL_SLOT_SIZE: usize = GSPP_SIZE + OFFSET_SIZE;
const LEAST_NUMBER_OF_ENTRIES_PER_PAGE: usize = 2;
const MINIMUM_ENTRY_SIZE_CAP: usize = 16;
// Overhead of one entry besides its inline key and value bytes, at worst
const MAX_ENTRY_OVERHEAD: usize = OFFSET_SIZE + MAX_KEY_VALUE_HEADER_SIZE + OFFLOAD_ID_SIZE + GSPP_SIZE;
// Smallest possible entry: one byte key header, one byte value header
const MIN_ENTRY_SIZE: usize = 2;

#[derive(Debug)]
struct EntryHeader {
    key_size: usize,
    value_size: usize,
    inline_key: usize,
    inline_value: usize,
    offload_id: Option<u64>,
    data_offset: usize,
}

/// Node layout for variable-length keys and values.
///
/// Entries whose inline size would exceed `key_value_size_cap` keep a prefix inline and move
/// the rest into an offload chain, so at least two entries always fit into a node.
pub(crate) struct TreeNodeDynamicSize {
    page_size: usize,
    total_space: usize,
    half_space: usize,
    key_value_size_cap: usize,
    offload: OffloadStore,
}

impl TreeNodeDynamicSize {
    pub(crate) fn new(page_size: usize, ids: Arc<dyn IdProvider>) -> Result<Self> {
        let total_space = page_size.saturating_sub(HEADER_LENGTH_DYNAMIC);
        let key_value_size_cap = (total_space.saturating_sub(GSPP_SIZE)
            / LEAST_NUMBER_OF_ENTRIES_PER_PAGE)
            .saturating_sub(MAX_ENTRY_OVERHEAD);
        if key_value_size_cap < MINIMUM_ENTRY_SIZE_CAP {
            return Err(Error::MetadataMismatch(format!(
                "page size {} leaves {} bytes per entry, at least {} are needed",
                page_size, key_value_size_cap, MINIMUM_ENTRY_SIZE_CAP
            )));
        }

        Ok(Self {
            page_size,
            total_space,
            half_space: total_space / 2,
            key_value_size_cap,
            offload: OffloadStore::new(page_size, ids),
        })
    }

    fn alloc_offset(&self, cursor: &mut PageCursor) -> usize {
        cursor.get_u16_at(BYTE_POS_ALLOC_OFFSET) as usize
    }

    fn set_alloc_offset(&self, cursor: &mut PageCursor, offset: usize) {
        cursor.put_u16_at(BYTE_POS_ALLOC_OFFSET, offset as u16);
    }

    fn dead_space(&self, cursor: &mut PageCursor) -> usize {
        cursor.get_u16_at(BYTE_POS_DEAD_SPACE) as usize
    }

    fn set_dead_space(&self, cursor: &mut PageCursor, dead_space: usize) {
        cursor.put_u16_at(BYTE_POS_DEAD_SPACE, dead_space as u16);
    }

    fn key_pos_offset(&self, pos: usize, node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => HEADER_LENGTH_DYNAMIC + pos * OFFSET_SIZE,
            NodeType::Internal => HEADER_LENGTH_DYNAMIC + pos * INTERNAL_SLOT_SIZE + GSPP_SIZE,
        }
    }

    fn end_of_offset_array(&self, key_count: usize, node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => HEADER_LENGTH_DYNAMIC + key_count * OFFSET_SIZE,
            NodeType::Internal => {
                HEADER_LENGTH_DYNAMIC + key_count * INTERNAL_SLOT_SIZE + GSPP_SIZE
            }
        }
    }

    fn alloc_space(&self, cursor: &mut PageCursor, key_count: usize, node_type: NodeType) -> usize {
        self.alloc_offset(cursor)
            .saturating_sub(self.end_of_offset_array(key_count, node_type))
    }

    fn read_key_offset(&self, cursor: &mut PageCursor, pos: usize, node_type: NodeType) -> usize {
        cursor.get_u16_at(self.key_pos_offset(pos, node_type)) as usize
    }

    /// Inline key bytes, inline value bytes and whether the entry is offloaded
    fn inline_sizes(&self, key_size: usize, value_size: usize) -> (usize, usize, bool) {
        let cap = self.key_value_size_cap;
        if key_size + value_size <= cap {
            return (key_size, value_size, false);
        }
        let inline_key = key_size.min((cap / 2).max(cap.saturating_sub(value_size)));
        let inline_value = value_size.min(cap - inline_key);
        (inline_key, inline_value, true)
    }

    fn inline_key_size(&self, key_size: usize) -> (usize, bool) {
        if key_size <= self.key_value_size_cap {
            (key_size, false)
        } else {
            (self.key_value_size_cap, true)
        }
    }

    /// Bytes an entry occupies in the node, excluding its slot in the offset array
    fn entry_space(&self, node_type: NodeType, key_size: usize, value_size: usize) -> usize {
        match node_type {
            NodeType::Leaf => {
                let (inline_key, inline_value, offload) = self.inline_sizes(key_size, value_size);
                key_value_header_size(key_size, value_size, offload) + inline_key + inline_value
            }
            NodeType::Internal => {
                let (inline_key, offload) = self.inline_key_size(key_size);
                key_child_header_size(key_size, offload) + inline_key
            }
        }
    }

    fn slot_space(node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => OFFSET_SIZE,
            NodeType::Internal => INTERNAL_SLOT_SIZE,
        }
    }

    // Space and tombstone state of the entry at `offset`, trusting its header
    fn entry_space_at(
        &self,
        cursor: &mut PageCursor,
        offset: usize,
        node_type: NodeType,
    ) -> (usize, bool) {
        cursor.set_offset(offset);
        let size = match node_type {
            NodeType::Leaf => dynamic_size::read_key_value_size(cursor),
            NodeType::Internal => dynamic_size::read_key_size(cursor),
        };
        let space = self.entry_space(node_type, size.extract_key_size(), size.extract_value_size());
        (space, size.extract_tombstone())
    }

    fn entry_space_of(&self, cursor: &mut PageCursor, pos: usize, node_type: NodeType) -> usize {
        let offset = self.read_key_offset(cursor, pos, node_type);
        self.entry_space_at(cursor, offset, node_type).0
    }

    /// Reads and validates the header of the entry at `pos`. Implausible data raises a cursor
    /// exception and yields None
    fn read_header(
        &self,
        cursor: &mut PageCursor,
        pos: usize,
        node_type: NodeType,
    ) -> Option<EntryHeader> {
        let offset = self.read_key_offset(cursor, pos, node_type);
        let alloc = self.alloc_offset(cursor);
        if offset < alloc.max(HEADER_LENGTH_DYNAMIC) || offset >= self.page_size {
            cursor.set_cursor_exception(format!(
                "entry offset {} at position {} is outside [{}, {})",
                offset, pos, alloc, self.page_size
            ));
            return None;
        }

        cursor.set_offset(offset);
        let size = match node_type {
            NodeType::Leaf => dynamic_size::read_key_value_size(cursor),
            NodeType::Internal => dynamic_size::read_key_size(cursor),
        };
        if size.extract_tombstone() {
            cursor.set_cursor_exception(format!("entry at position {} is a tombstone", pos));
            return None;
        }
        let key_size = size.extract_key_size();
        let value_size = size.extract_value_size();
        let offload = size.extract_offload();
        let (inline_key, inline_value, expect_offload) = match node_type {
            NodeType::Leaf => self.inline_sizes(key_size, value_size),
            NodeType::Internal => {
                let (inline_key, offload) = self.inline_key_size(key_size);
                (inline_key, 0, offload)
            }
        };
        if key_size > MAX_KEY_SIZE || value_size > MAX_VALUE_SIZE || offload != expect_offload {
            cursor.set_cursor_exception(format!(
                "implausible entry at position {}: key size {}, value size {}, offload {}",
                pos, key_size, value_size, offload
            ));
            return None;
        }
        let offload_id = if offload {
            let id = dynamic_size::read_offload_id(cursor);
            if id == NO_NODE {
                cursor.set_cursor_exception(format!("entry at position {} has no offload id", pos));
                return None;
            }
            Some(id)
        } else {
            None
        };
        let data_offset = cursor.offset();
        if data_offset + inline_key + inline_value > self.page_size {
            cursor.set_cursor_exception(format!(
                "entry at position {} runs past the end of the page",
                pos
            ));
            return None;
        }

        Some(EntryHeader {
            key_size,
            value_size,
            inline_key,
            inline_value,
            offload_id,
            data_offset,
        })
    }

    fn read_key(&self, cursor: &mut PageCursor, header: &EntryHeader) -> Result<Vec<u8>> {
        let mut key = vec![0; header.key_size];
        cursor.get_bytes_at(header.data_offset, &mut key[..header.inline_key]);
        if let Some(id) = header.offload_id {
            if header.inline_key < header.key_size {
                self.offload
                    .read_chain(cursor, id, 0, &mut key[header.inline_key..])?;
            }
        }
        Ok(key)
    }

    fn read_value(&self, cursor: &mut PageCursor, header: &EntryHeader) -> Result<Vec<u8>> {
        let mut value = vec![0; header.value_size];
        cursor.get_bytes_at(
            header.data_offset + header.inline_key,
            &mut value[..header.inline_value],
        );
        if let Some(id) = header.offload_id {
            if header.inline_value < header.value_size {
                let skip = header.key_size - header.inline_key;
                self.offload
                    .read_chain(cursor, id, skip, &mut value[header.inline_value..])?;
            }
        }
        Ok(value)
    }

    // Writes a complete entry at `at`, offloading its tail if needed. `value` is None for
    // internal entries
    fn write_entry(
        &self,
        cursor: &mut PageCursor,
        at: usize,
        key: &[u8],
        value: Option<&[u8]>,
        generation: Generation,
    ) -> Result {
        let (inline_key, inline_value, offload) = match value {
            Some(value) => self.inline_sizes(key.len(), value.len()),
            None => {
                let (inline_key, offload) = self.inline_key_size(key.len());
                (inline_key, 0, offload)
            }
        };
        let offload_id = if offload {
            let mut tail = key[inline_key..].to_vec();
            if let Some(value) = value {
                tail.extend_from_slice(&value[inline_value..]);
            }
            Some(self.offload.write_chain(cursor, generation, &tail)?)
        } else {
            None
        };

        cursor.set_offset(at);
        match value {
            Some(value) => put_key_value_header(cursor, key.len(), value.len(), offload_id),
            None => put_key_child_header(cursor, key.len(), offload_id),
        }
        cursor.put_bytes(&key[..inline_key]);
        if let Some(value) = value {
            cursor.put_bytes(&value[..inline_value]);
        }
        Ok(())
    }

    // Reserves `space` bytes below the allocation offset. The caller checked that they fit
    fn allocate_entry(
        &self,
        cursor: &mut PageCursor,
        space: usize,
        key_count: usize,
        node_type: NodeType,
    ) -> Result<usize> {
        if space + Self::slot_space(node_type) > self.alloc_space(cursor, key_count, node_type) {
            return Err(Error::TreeInconsistency(format!(
                "page {}: no room for an entry of {} bytes",
                cursor.current_page_id(),
                space
            )));
        }
        let at = self.alloc_offset(cursor) - space;
        self.set_alloc_offset(cursor, at);
        Ok(at)
    }

    fn tombstone_entry(&self, cursor: &mut PageCursor, pos: usize, node_type: NodeType) {
        let offset = self.read_key_offset(cursor, pos, node_type);
        let (space, _) = self.entry_space_at(cursor, offset, node_type);
        dynamic_size::put_tombstone(cursor, offset);
        let dead = self.dead_space(cursor);
        self.set_dead_space(cursor, dead + space);
    }

    // Copies the entry at `source_pos` byte for byte into `target`, writing only its offset
    // slot at `target_pos`. The source entry is left untouched
    fn copy_entry(
        &self,
        source: &mut PageCursor,
        source_pos: usize,
        target: &mut PageCursor,
        target_pos: usize,
        node_type: NodeType,
    ) {
        let offset = self.read_key_offset(source, source_pos, node_type);
        let (space, _) = self.entry_space_at(source, offset, node_type);
        let alloc = self.alloc_offset(target);
        let end_of_slots = self.end_of_offset_array(target_pos + 1, node_type);
        let at = match alloc.checked_sub(space) {
            Some(at) if at >= end_of_slots => at,
            _ => {
                target.set_cursor_exception(format!(
                    "no room for an entry of {} bytes at position {}",
                    space, target_pos
                ));
                return;
            }
        };
        source.copy_to(offset, target, at, space);
        self.set_alloc_offset(target, at);
        target.put_u16_at(self.key_pos_offset(target_pos, node_type), at as u16);
    }

    fn copy_entries(
        &self,
        source: &mut PageCursor,
        from_pos: usize,
        to_pos: usize,
        target: &mut PageCursor,
        target_pos: usize,
        node_type: NodeType,
    ) {
        for (i, pos) in (from_pos..to_pos).enumerate() {
            self.copy_entry(source, pos, target, target_pos + i, node_type);
        }
    }

    fn copy_children(
        &self,
        source: &mut PageCursor,
        source_pos: usize,
        target: &mut PageCursor,
        target_pos: usize,
        count: usize,
    ) {
        for i in 0..count {
            source.copy_to(
                self.child_offset(source_pos + i),
                target,
                self.child_offset(target_pos + i),
                GSPP_SIZE,
            );
        }
    }

    // Drops the entries from `new_count` on: tombstones them, clears their slots and sets the
    // key count
    fn truncate(
        &self,
        cursor: &mut PageCursor,
        new_count: usize,
        old_count: usize,
        node_type: NodeType,
    ) {
        for pos in new_count..old_count {
            self.tombstone_entry(cursor, pos, node_type);
        }
        let from = self.end_of_offset_array(new_count, node_type);
        let to = self.end_of_offset_array(old_count, node_type);
        cursor.put_zeros_at(from, to - from);
        tree_node::set_key_count(cursor, new_count);
    }

    fn defragment(&self, cursor: &mut PageCursor, node_type: NodeType) {
        let key_count = tree_node::key_count(cursor);
        let alloc = self.alloc_offset(cursor);

        // (offset, space, dead) of every entry, in page order
        let mut blocks: Vec<(usize, usize, bool)> = vec![];
        let mut offset = alloc;
        while offset < self.page_size {
            let (space, dead) = self.entry_space_at(cursor, offset, node_type);
            blocks.push((offset, space, dead));
            offset += space;
        }
        if offset != self.page_size {
            cursor.set_cursor_exception(format!(
                "entries from {} overrun the page end by {} bytes",
                alloc,
                offset - self.page_size
            ));
            return;
        }

        // Slide alive runs towards the page end, rightmost first, so that no run overwrites
        // one that hasn't moved yet
        let mut moved: Vec<(usize, usize)> = Vec::with_capacity(key_count);
        let mut shift = 0;
        let mut index = blocks.len();
        while index > 0 {
            let (block_offset, space, dead) = blocks[index - 1];
            if dead {
                shift += space;
                index -= 1;
                continue;
            }
            let run_end = block_offset + space;
            let mut run_start_index = index - 1;
            while run_start_index > 0 && !blocks[run_start_index - 1].2 {
                run_start_index -= 1;
            }
            let run_start = blocks[run_start_index].0;
            for (block_offset, _, _) in blocks[run_start_index..index].iter() {
                moved.push((*block_offset, block_offset + shift));
            }
            if shift > 0 {
                cursor.shift_bytes(run_start, run_end - run_start, shift as isize);
            }
            index = run_start_index;
        }
        cursor.put_zeros_at(alloc, shift);
        self.set_alloc_offset(cursor, alloc + shift);
        self.set_dead_space(cursor, 0);

        moved.sort_unstable();
        for pos in 0..key_count {
            let old = self.read_key_offset(cursor, pos, node_type);
            match moved.binary_search_by_key(&old, |(from, _)| *from) {
                Ok(found) => {
                    let new = moved[found].1;
                    cursor.put_u16_at(self.key_pos_offset(pos, node_type), new as u16);
                }
                Err(_) => {
                    cursor.set_cursor_exception(format!(
                        "offset {} at position {} doesn't point at a live entry",
                        old, pos
                    ));
                    return;
                }
            }
        }
    }

    fn overflow(&self, needed: usize, alloc_space: usize, dead_space: usize) -> Overflow {
        if needed <= alloc_space {
            Overflow::No
        } else if needed <= alloc_space + dead_space {
            Overflow::NoNeedDefrag
        } else {
            Overflow::Yes
        }
    }

    fn active_space(&self, cursor: &mut PageCursor, key_count: usize, node_type: NodeType) -> usize {
        let entries: usize = (0..key_count)
            .map(|pos| self.entry_space_of(cursor, pos, node_type))
            .sum();
        entries + self.end_of_offset_array(key_count, node_type) - HEADER_LENGTH_DYNAMIC
    }
}

/// Number of leading entries to keep on the left so that the bytes on either side are as even
/// as possible. Always takes the first entry and keeps taking while the imbalance strictly
/// shrinks
fn balance_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let mut left = 0;
    let mut delta = total;
    let mut count = 0;
    for size in sizes {
        let new_left = left + size;
        let new_delta = total.abs_diff(2 * new_left);
        if count > 0 && new_delta >= delta {
            break;
        }
        left = new_left;
        delta = new_delta;
        count += 1;
    }
    count
}

impl TreeNode for TreeNodeDynamicSize {
    fn layout(&self) -> NodeLayout {
        NodeLayout::Dynamic
    }

    fn leaf_max_key_count(&self) -> usize {
        self.total_space / (MIN_ENTRY_SIZE + OFFSET_SIZE)
    }

    fn internal_max_key_count(&self) -> usize {
        (self.total_space - GSPP_SIZE) / (1 + INTERNAL_SLOT_SIZE)
    }

    fn validate_entry_size(&self, key_len: usize, value_len: usize) -> Result {
        if key_len > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge(key_len));
        }
        if value_len > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge(value_len));
        }
        Ok(())
    }

    fn initialize_layout(&self, cursor: &mut PageCursor) {
        self.set_alloc_offset(cursor, self.page_size);
        self.set_dead_space(cursor, 0);
    }

    fn key_at(&self, cursor: &mut PageCursor, pos: usize, node_type: NodeType) -> Result<Vec<u8>> {
        match self.read_header(cursor, pos, node_type) {
            Some(header) => self.read_key(cursor, &header),
            None => Ok(vec![]),
        }
    }

    fn value_at(&self, cursor: &mut PageCursor, pos: usize) -> Result<Vec<u8>> {
        match self.read_header(cursor, pos, NodeType::Leaf) {
            Some(header) => self.read_value(cursor, &header),
            None => Ok(vec![]),
        }
    }

    fn key_value_at(&self, cursor: &mut PageCursor, pos: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        match self.read_header(cursor, pos, NodeType::Leaf) {
            Some(header) => Ok((
                self.read_key(cursor, &header)?,
                self.read_value(cursor, &header)?,
            )),
            None => Ok((vec![], vec![])),
        }
    }

    fn child_offset(&self, pos: usize) -> usize {
        HEADER_LENGTH_DYNAMIC + pos * INTERNAL_SLOT_SIZE
    }

    fn insert_key_value_at(
        &self,
        cursor: &mut PageCursor,
        key: &[u8],
        value: &[u8],
        pos: usize,
        key_count: usize,
        generation: Generation,
    ) -> Result {
        let space = self.entry_space(NodeType::Leaf, key.len(), value.len());
        let at = self.allocate_entry(cursor, space, key_count, NodeType::Leaf)?;
        self.write_entry(cursor, at, key, Some(value), generation)?;

        let slot = self.key_pos_offset(pos, NodeType::Leaf);
        cursor.shift_bytes(slot, (key_count - pos) * OFFSET_SIZE, OFFSET_SIZE as isize);
        cursor.put_u16_at(slot, at as u16);
        Ok(())
    }

    fn insert_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor,
        key: &[u8],
        child: PageId,
        pos: usize,
        key_count: usize,
        generation: Generation,
    ) -> Result {
        let space = self.entry_space(NodeType::Internal, key.len(), 0);
        let at = self.allocate_entry(cursor, space, key_count, NodeType::Internal)?;
        self.write_entry(cursor, at, key, None, generation)?;

        let slot = self.key_pos_offset(pos, NodeType::Internal);
        cursor.shift_bytes(
            slot,
            (key_count - pos) * INTERNAL_SLOT_SIZE,
            INTERNAL_SLOT_SIZE as isize,
        );
        cursor.put_u16_at(slot, at as u16);
        self.write_new_child_at(cursor, child, pos + 1, generation)
    }

    fn remove_key_value_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize) {
        self.tombstone_entry(cursor, pos, NodeType::Leaf);
        let slot = self.key_pos_offset(pos, NodeType::Leaf);
        cursor.shift_bytes(
            slot + OFFSET_SIZE,
            (key_count - pos - 1) * OFFSET_SIZE,
            -(OFFSET_SIZE as isize),
        );
        cursor.put_zeros_at(self.key_pos_offset(key_count - 1, NodeType::Leaf), OFFSET_SIZE);
    }

    fn remove_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor,
        key_pos: usize,
        key_count: usize,
    ) {
        self.tombstone_entry(cursor, key_pos, NodeType::Internal);
        let end = self.end_of_offset_array(key_count, NodeType::Internal);
        let from = self.key_pos_offset(key_pos, NodeType::Internal) + INTERNAL_SLOT_SIZE;
        cursor.shift_bytes(from, end - from, -(INTERNAL_SLOT_SIZE as isize));
        cursor.put_zeros_at(end - INTERNAL_SLOT_SIZE, INTERNAL_SLOT_SIZE);
    }

    fn set_value_at(&self, cursor: &mut PageCursor, value: &[u8], pos: usize) -> Result<bool> {
        let Some(header) = self.read_header(cursor, pos, NodeType::Leaf) else {
            return Ok(false);
        };
        if header.offload_id.is_some() || header.value_size != value.len() {
            return Ok(false);
        }
        cursor.put_bytes_at(header.data_offset + header.inline_key, value);
        Ok(true)
    }

    fn leaf_overflow(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        key: &[u8],
        value: &[u8],
    ) -> Overflow {
        let needed = self.entry_space(NodeType::Leaf, key.len(), value.len()) + OFFSET_SIZE;
        let alloc_space = self.alloc_space(cursor, key_count, NodeType::Leaf);
        let dead_space = self.dead_space(cursor);
        self.overflow(needed, alloc_space, dead_space)
    }

    fn internal_overflow(&self, cursor: &mut PageCursor, key_count: usize, key: &[u8]) -> Overflow {
        let needed = self.entry_space(NodeType::Internal, key.len(), 0) + INTERNAL_SLOT_SIZE;
        let alloc_space = self.alloc_space(cursor, key_count, NodeType::Internal);
        let dead_space = self.dead_space(cursor);
        self.overflow(needed, alloc_space, dead_space)
    }

    fn leaf_underflow(&self, cursor: &mut PageCursor, key_count: usize) -> bool {
        let alloc_space = self.alloc_space(cursor, key_count, NodeType::Leaf);
        let dead_space = self.dead_space(cursor);
        alloc_space + dead_space > self.half_space
    }

    fn can_rebalance_leaves(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
    ) -> Option<usize> {
        let mut left_active = self.active_space(left, left_key_count, NodeType::Leaf);
        let mut right_active = self.active_space(right, right_key_count, NodeType::Leaf);
        if left_active + right_active <= self.total_space || left_active < right_active {
            return None;
        }

        let mut delta = left_active - right_active;
        let mut moved = 0;
        for pos in (1..left_key_count).rev() {
            let size = self.entry_space_of(left, pos, NodeType::Leaf) + OFFSET_SIZE;
            let new_delta = (left_active - size).abs_diff(right_active + size);
            if new_delta >= delta {
                break;
            }
            left_active -= size;
            right_active += size;
            delta = new_delta;
            moved += 1;
        }
        if moved == 0 {
            None
        } else {
            Some(moved)
        }
    }

    fn can_merge_leaves(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
    ) -> bool {
        let left_active = self.active_space(left, left_key_count, NodeType::Leaf);
        let right_active = self.active_space(right, right_key_count, NodeType::Leaf);
        left_active + right_active <= self.total_space
    }

    fn do_split_leaf(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        insert_pos: usize,
        key: &[u8],
        value: &[u8],
        generation: Generation,
    ) -> Result<Vec<u8>> {
        let n = left_key_count;
        let mut sizes: Vec<usize> = (0..n)
            .map(|pos| self.entry_space_of(left, pos, NodeType::Leaf) + OFFSET_SIZE)
            .collect();
        sizes.insert(
            insert_pos,
            self.entry_space(NodeType::Leaf, key.len(), value.len()) + OFFSET_SIZE,
        );
        let middle = balance_point(&sizes).clamp(1, n);

        if insert_pos < middle {
            self.copy_entries(left, middle - 1, n, right, 0, NodeType::Leaf);
            self.truncate(left, middle - 1, n, NodeType::Leaf);
            self.defragment_leaf(left);
            self.insert_key_value_at(left, key, value, insert_pos, middle - 1, generation)?;
        } else {
            self.copy_entries(left, middle, n, right, 0, NodeType::Leaf);
            self.truncate(left, middle, n, NodeType::Leaf);
            self.defragment_leaf(left);
            self.insert_key_value_at(right, key, value, insert_pos - middle, n - middle, generation)?;
        }
        tree_node::set_key_count(left, middle);
        tree_node::set_key_count(right, n + 1 - middle);

        self.key_at(right, 0, NodeType::Leaf)
    }

    fn do_split_internal(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        insert_pos: usize,
        key: &[u8],
        right_child: PageId,
        generation: Generation,
    ) -> Result<Vec<u8>> {
        let n = left_key_count;
        let mut sizes: Vec<usize> = (0..n)
            .map(|pos| self.entry_space_of(left, pos, NodeType::Internal) + INTERNAL_SLOT_SIZE)
            .collect();
        sizes.insert(
            insert_pos,
            self.entry_space(NodeType::Internal, key.len(), 0) + INTERNAL_SLOT_SIZE,
        );
        // Both sides keep at least one key besides the one moving up
        let middle = balance_point(&sizes).clamp(1, n.saturating_sub(1).max(1));

        let splitter = if insert_pos < middle {
            let splitter = self.key_at(left, middle - 1, NodeType::Internal)?;
            self.copy_entries(left, middle, n, right, 0, NodeType::Internal);
            self.copy_children(left, middle, right, 0, n - middle + 1);
            self.truncate(left, middle, n, NodeType::Internal);
            self.remove_key_and_right_child_at(left, middle - 1, middle);
            tree_node::set_key_count(left, middle - 1);
            self.defragment_internal(left);
            self.insert_key_and_right_child_at(
                left,
                key,
                right_child,
                insert_pos,
                middle - 1,
                generation,
            )?;
            tree_node::set_key_count(right, n - middle);
            splitter
        } else if insert_pos == middle {
            self.copy_entries(left, middle, n, right, 0, NodeType::Internal);
            self.copy_children(left, middle + 1, right, 1, n - middle);
            self.write_new_child_at(right, right_child, 0, generation)?;
            self.truncate(left, middle, n, NodeType::Internal);
            tree_node::set_key_count(right, n - middle);
            key.to_vec()
        } else {
            let splitter = self.key_at(left, middle, NodeType::Internal)?;
            self.copy_entries(left, middle + 1, n, right, 0, NodeType::Internal);
            self.copy_children(left, middle + 1, right, 0, n - middle);
            self.truncate(left, middle + 1, n, NodeType::Internal);
            self.remove_key_and_right_child_at(left, middle, middle + 1);
            tree_node::set_key_count(left, middle);
            self.defragment_internal(left);
            self.insert_key_and_right_child_at(
                right,
                key,
                right_child,
                insert_pos - middle - 1,
                n - middle - 1,
                generation,
            )?;
            tree_node::set_key_count(right, n - middle);
            splitter
        };
        tree_node::set_key_count(left, middle);

        Ok(splitter)
    }

    fn move_key_values_from_left_to_right(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
        from_pos: usize,
    ) {
        let count = left_key_count - from_pos;
        self.defragment_leaf(right);
        right.shift_bytes(
            self.key_pos_offset(0, NodeType::Leaf),
            right_key_count * OFFSET_SIZE,
            (count * OFFSET_SIZE) as isize,
        );
        self.copy_entries(left, from_pos, left_key_count, right, 0, NodeType::Leaf);
        self.truncate(left, from_pos, left_key_count, NodeType::Leaf);
        tree_node::set_key_count(right, right_key_count + count);
    }

    fn merge_leaves(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
    ) {
        self.defragment_leaf(left);
        self.copy_entries(right, 0, right_key_count, left, left_key_count, NodeType::Leaf);
        tree_node::set_key_count(left, left_key_count + right_key_count);
    }

    fn defragment_leaf(&self, cursor: &mut PageCursor) {
        self.defragment(cursor, NodeType::Leaf);
    }

    fn defragment_internal(&self, cursor: &mut PageCursor) {
        self.defragment(cursor, NodeType::Internal);
    }

    fn check_meta_consistency(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        node_type: NodeType,
    ) -> Option<String> {
        if !self.reasonable_key_count(key_count, node_type) {
            return Some(format!("unreasonable key count {}", key_count));
        }
        let alloc = self.alloc_offset(cursor);
        let dead_space = self.dead_space(cursor);
        let end = self.end_of_offset_array(key_count, node_type);
        if alloc < end || alloc > self.page_size {
            return Some(format!(
                "alloc offset {} outside [{}, {}]",
                alloc, end, self.page_size
            ));
        }

        let mut live_offsets = vec![];
        let mut dead_total = 0;
        let mut offset = alloc;
        while offset < self.page_size {
            let (space, dead) = self.entry_space_at(cursor, offset, node_type);
            if offset + space > self.page_size {
                return Some(format!("entry at {} runs past the page end", offset));
            }
            if dead {
                dead_total += space;
            } else {
                live_offsets.push(offset);
            }
            offset += space;
        }
        if dead_total != dead_space {
            return Some(format!(
                "dead space is {} but tombstoned entries cover {} bytes",
                dead_space, dead_total
            ));
        }

        let mut slots: Vec<usize> = (0..key_count)
            .map(|pos| self.read_key_offset(cursor, pos, node_type))
            .collect();
        slots.sort_unstable();
        if slots != live_offsets {
            return Some(format!(
                "{} offsets in the offset array but {} live entries",
                slots.len(),
                live_offsets.len()
            ));
        }
        None
    }

    fn space(&self, cursor: &mut PageCursor, key_count: usize, node_type: NodeType) -> NodeSpace {
        NodeSpace {
            active: self.active_space(cursor, key_count, node_type),
            dead: self.dead_space(cursor),
        }
    }

    fn offload_chain_pages(&self, cursor: &PageCursor, record_id: u64) -> Result<Vec<PageId>> {
        self.offload.chain_pages(cursor, record_id)
    }

    fn offload_ids(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        node_type: NodeType,
    ) -> Vec<u64> {
        (0..key_count)
            .filter_map(|pos| {
                self.read_header(cursor, pos, node_type)
                    .and_then(|header| header.offload_id)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use crate::tree_store::free_list::FreeListIdProvider;
    use crate::tree_store::generation::Generation;
    use crate::tree_store::page_store::{PageCursor, PagedFile};
    use crate::tree_store::tree_node::{self, NodeType, Overflow, TreeNode};
    use crate::tree_store::tree_node_dynamic::{balance_point, TreeNodeDynamicSize, OFFSET_SIZE};
    use crate::{Error, InMemoryBackend};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    const PAGE_SIZE: usize = 512;

    fn setup() -> (Arc<PagedFile>, TreeNodeDynamicSize) {
        let file = Arc::new(PagedFile::new(Box::new(InMemoryBackend::new()), PAGE_SIZE));
        let ids = Arc::new(FreeListIdProvider::create(file.clone(), 10).unwrap());
        let node = TreeNodeDynamicSize::new(PAGE_SIZE, ids).unwrap();
        (file, node)
    }

    fn entry(rng: &mut StdRng, id: u32, max_value: usize) -> (Vec<u8>, Vec<u8>) {
        let mut key = id.to_be_bytes().to_vec();
        key.extend(std::iter::repeat(0xAB).take(rng.gen_range(0..12)));
        let value: Vec<u8> = (0..rng.gen_range(0..max_value)).map(|_| rng.gen()).collect();
        (key, value)
    }

    fn contents(node: &TreeNodeDynamicSize, cursor: &mut PageCursor) -> Vec<(Vec<u8>, Vec<u8>)> {
        let count = tree_node::key_count(cursor);
        let result = (0..count)
            .map(|pos| node.key_value_at(cursor, pos).unwrap())
            .collect();
        cursor.check_and_clear_cursor_exception().unwrap();
        result
    }

    fn entry_bytes(node: &TreeNodeDynamicSize, cursor: &mut PageCursor) -> usize {
        let count = tree_node::key_count(cursor);
        node.space(cursor, count, NodeType::Leaf).active - count * OFFSET_SIZE
    }

    // Inserts sorted entries until the leaf is full
    fn fill(
        node: &TreeNodeDynamicSize,
        cursor: &mut PageCursor,
        rng: &mut StdRng,
        max_value: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let generation = Generation::initial();
        node.initialize_leaf(cursor, generation).unwrap();
        let mut expected = vec![];
        for id in 0.. {
            let (key, value) = entry(rng, id, max_value);
            let count = tree_node::key_count(cursor);
            if node.leaf_overflow(cursor, count, &key, &value) != Overflow::No {
                break;
            }
            node.insert_key_value_at(cursor, &key, &value, count, count, generation)
                .unwrap();
            tree_node::set_key_count(cursor, count + 1);
            expected.push((key, value));
        }
        expected
    }

    #[test]
    fn copied_entry_never_overlaps_offsets() {
        let (file, node) = setup();
        let generation = Generation::initial();
        let mut source = file.write_cursor();
        source.next(3).unwrap();
        node.initialize_leaf(&mut source, generation).unwrap();
        node.insert_key_value_at(&mut source, &[7; 8], &[1; 100], 0, 0, generation)
            .unwrap();
        tree_node::set_key_count(&mut source, 1);

        let mut target = source.open_linked_cursor();
        target.next(4).unwrap();
        node.initialize_leaf(&mut target, generation).unwrap();
        // The slot of position 200 ends where the entry would have to start
        node.copy_entry(&mut source, 0, &mut target, 200, NodeType::Leaf);
        assert!(target.has_cursor_exception());
        assert!(target.check_and_clear_cursor_exception().is_err());
        assert_eq!(node.alloc_offset(&mut target), PAGE_SIZE);

        node.copy_entry(&mut source, 0, &mut target, 0, NodeType::Leaf);
        assert!(target.check_and_clear_cursor_exception().is_ok());
        tree_node::set_key_count(&mut target, 1);
        assert_eq!(contents(&node, &mut target), vec![(vec![7; 8], vec![1; 100])]);
    }

    #[test]
    fn rejects_tiny_pages() {
        let file = Arc::new(PagedFile::new(Box::new(InMemoryBackend::new()), 128));
        let ids = Arc::new(FreeListIdProvider::create(file, 10).unwrap());
        assert!(matches!(
            TreeNodeDynamicSize::new(128, ids),
            Err(Error::MetadataMismatch(_))
        ));
    }

    #[test]
    fn defragment_is_transparent() {
        let (file, node) = setup();
        let mut rng = StdRng::seed_from_u64(1);
        let mut cursor = file.write_cursor();
        cursor.next(3).unwrap();
        let mut expected = fill(&node, &mut cursor, &mut rng, 40);
        assert!(expected.len() > 4);

        let mut previous_alloc = node.alloc_offset(&mut cursor);
        let mut pos = 0;
        while pos < expected.len() {
            let count = tree_node::key_count(&mut cursor);
            node.remove_key_value_at(&mut cursor, pos, count);
            tree_node::set_key_count(&mut cursor, count - 1);
            expected.remove(pos);
            // Removal never moves the allocation offset
            assert_eq!(node.alloc_offset(&mut cursor), previous_alloc);
            pos += 2;
        }
        assert!(node.dead_space(&mut cursor) > 0);
        assert_eq!(contents(&node, &mut cursor), expected);
        let count = tree_node::key_count(&mut cursor);
        assert_eq!(node.check_meta_consistency(&mut cursor, count, NodeType::Leaf), None);

        node.defragment_leaf(&mut cursor);
        cursor.check_and_clear_cursor_exception().unwrap();
        assert_eq!(contents(&node, &mut cursor), expected);
        assert_eq!(node.dead_space(&mut cursor), 0);
        previous_alloc = node.alloc_offset(&mut cursor);
        assert_eq!(previous_alloc, PAGE_SIZE - entry_bytes(&node, &mut cursor));
        assert_eq!(node.check_meta_consistency(&mut cursor, count, NodeType::Leaf), None);

        // Inserting after defragmentation only moves the allocation offset down
        let (key, value) = (vec![0, 0, 0, 0, 1], vec![7; 3]);
        node.insert_key_value_at(&mut cursor, &key, &value, 0, count, Generation::initial())
            .unwrap();
        tree_node::set_key_count(&mut cursor, count + 1);
        expected.insert(0, (key, value));
        assert!(node.alloc_offset(&mut cursor) < previous_alloc);
        assert_eq!(contents(&node, &mut cursor), expected);
    }

    #[test]
    fn overflow_three_way() {
        let (file, node) = setup();
        let generation = Generation::initial();
        let mut cursor = file.write_cursor();
        cursor.next(3).unwrap();
        node.initialize_leaf(&mut cursor, generation).unwrap();
        // Entries of 2 + 4 + 10 bytes plus a 2 byte slot
        let value = vec![3; 10];
        let mut count = 0;
        loop {
            let key = (count as u32).to_be_bytes();
            match node.leaf_overflow(&mut cursor, count, &key, &value) {
                Overflow::No => {}
                other => {
                    assert_eq!(other, Overflow::Yes);
                    break;
                }
            }
            node.insert_key_value_at(&mut cursor, &key, &value, count, count, generation)
                .unwrap();
            count += 1;
            tree_node::set_key_count(&mut cursor, count);
        }
        assert_eq!(count, (PAGE_SIZE - 87) / 18);

        node.remove_key_value_at(&mut cursor, 0, count);
        count -= 1;
        tree_node::set_key_count(&mut cursor, count);
        let key = 1000u32.to_be_bytes();
        assert_eq!(
            node.leaf_overflow(&mut cursor, count, &key, &value),
            Overflow::NoNeedDefrag
        );
        node.defragment_leaf(&mut cursor);
        assert_eq!(
            node.leaf_overflow(&mut cursor, count, &key, &value),
            Overflow::No
        );
    }

    #[test]
    fn offloaded_entries_round_trip() {
        let (file, node) = setup();
        let cap = node.key_value_size_cap;
        let generation = Generation::initial();
        let mut cursor = file.write_cursor();
        cursor.next(3).unwrap();
        node.initialize_leaf(&mut cursor, generation).unwrap();

        let entries = vec![
            (vec![1; 10], (0..3 * cap).map(|i| i as u8).collect::<Vec<u8>>()),
            (vec![2; 2 * cap], vec![9; 5]),
            (vec![4; 3], vec![5; 3]),
        ];
        for (pos, (key, value)) in entries.iter().enumerate() {
            let count = tree_node::key_count(&mut cursor);
            assert_eq!(node.leaf_overflow(&mut cursor, count, key, value), Overflow::No);
            node.insert_key_value_at(&mut cursor, key, value, pos, count, generation)
                .unwrap();
            tree_node::set_key_count(&mut cursor, count + 1);
        }
        assert_eq!(contents(&node, &mut cursor), entries);
        assert_eq!(node.offload_ids(&mut cursor, 3, NodeType::Leaf).len(), 2);
        // Offloaded entries can't be overwritten in place
        assert!(!node.set_value_at(&mut cursor, &[0; 5], 1).unwrap());
        assert!(node.set_value_at(&mut cursor, &[6; 3], 2).unwrap());
        assert_eq!(node.value_at(&mut cursor, 2).unwrap(), vec![6; 3]);

        // Offloaded internal keys
        let mut internal = file.write_cursor();
        internal.next(4).unwrap();
        node.initialize_internal(&mut internal, generation).unwrap();
        node.write_new_child_at(&mut internal, 100, 0, generation)
            .unwrap();
        let long_key = vec![8; cap + 50];
        node.insert_key_and_right_child_at(&mut internal, &long_key, 101, 0, 0, generation)
            .unwrap();
        tree_node::set_key_count(&mut internal, 1);
        assert_eq!(
            node.key_at(&mut internal, 0, NodeType::Internal).unwrap(),
            long_key
        );
        assert_eq!(node.child_at(&mut internal, 1, generation).unwrap().pointer, 101);
    }

    #[test]
    fn split_leaf_balances_bytes() {
        let (file, node) = setup();
        let mut rng = StdRng::seed_from_u64(3);
        let generation = Generation::initial();

        for round in 0..50 {
            let mut left = file.write_cursor();
            let mut right = file.write_cursor();
            left.next(3).unwrap();
            right.next(4).unwrap();
            let mut expected = fill(&node, &mut left, &mut rng, 60);
            node.initialize_leaf(&mut right, generation).unwrap();
            let count = tree_node::key_count(&mut left);

            // A key that sorts at a random position
            let insert_pos = rng.gen_range(0..=count);
            let key = if insert_pos == 0 {
                vec![]
            } else {
                let mut key = expected[insert_pos - 1].0.clone();
                key.push(0xFF);
                key
            };
            let value = vec![round as u8; rng.gen_range(0..60)];
            if node.leaf_overflow(&mut left, count, &key, &value) != Overflow::Yes {
                continue;
            }
            expected.insert(insert_pos, (key.clone(), value.clone()));

            let splitter = node
                .do_split_leaf(&mut left, count, &mut right, insert_pos, &key, &value, generation)
                .unwrap();
            let mut all = contents(&node, &mut left);
            let right_contents = contents(&node, &mut right);
            assert_eq!(splitter, right_contents[0].0);
            all.extend(right_contents);
            assert_eq!(all, expected);

            let largest = expected
                .iter()
                .map(|(k, v)| node.entry_space(NodeType::Leaf, k.len(), v.len()) + OFFSET_SIZE)
                .max()
                .unwrap();
            let left_count = tree_node::key_count(&mut left);
            let right_count = tree_node::key_count(&mut right);
            let left_active = node.space(&mut left, left_count, NodeType::Leaf).active;
            let right_active = node.space(&mut right, right_count, NodeType::Leaf).active;
            assert!(left_active.abs_diff(right_active) <= largest);
            for (cursor, count) in [(&mut left, left_count), (&mut right, right_count)] {
                assert_eq!(node.check_meta_consistency(cursor, count, NodeType::Leaf), None);
            }
        }
    }

    #[test]
    fn split_internal_keeps_children_in_order() {
        let (file, node) = setup();
        let generation = Generation::initial();

        for insert_pos in 0..8 {
            let mut left = file.write_cursor();
            let mut right = file.write_cursor();
            left.next(3).unwrap();
            right.next(4).unwrap();
            node.initialize_internal(&mut left, generation).unwrap();
            node.initialize_internal(&mut right, generation).unwrap();
            node.write_new_child_at(&mut left, 1000, 0, generation).unwrap();
            // Keys 10, 20, .. with uneven lengths until the node is full
            let mut keys: Vec<Vec<u8>> = vec![];
            loop {
                let count = keys.len();
                let mut key = vec![(count as u8 + 1) * 10];
                key.extend(std::iter::repeat(1).take((count * 7) % 30));
                if node.internal_overflow(&mut left, count, &key) != Overflow::No {
                    break;
                }
                node.insert_key_and_right_child_at(
                    &mut left,
                    &key,
                    1001 + count as u64,
                    count,
                    count,
                    generation,
                )
                .unwrap();
                tree_node::set_key_count(&mut left, count + 1);
                keys.push(key);
            }
            let count = keys.len();
            assert!(insert_pos < count);
            let new_key = vec![insert_pos as u8 * 10 + 5; 40];
            let mut expected_keys = keys.clone();
            expected_keys.insert(insert_pos, new_key.clone());
            let mut expected_children: Vec<u64> = (0..=count as u64).map(|c| 1000 + c).collect();
            expected_children.insert(insert_pos + 1, 5000);

            let splitter = node
                .do_split_internal(
                    &mut left,
                    count,
                    &mut right,
                    insert_pos,
                    &new_key,
                    5000,
                    generation,
                )
                .unwrap();

            let left_count = tree_node::key_count(&mut left);
            let right_count = tree_node::key_count(&mut right);
            assert!(left_count >= 1 && right_count >= 1);
            let mut all_keys = vec![];
            let mut children = vec![];
            for (cursor, count) in [(&mut left, left_count), (&mut right, right_count)] {
                for pos in 0..count {
                    all_keys.push(node.key_at(cursor, pos, NodeType::Internal).unwrap());
                }
                for pos in 0..=count {
                    children.push(node.child_at(cursor, pos, generation).unwrap().pointer);
                }
                cursor.check_and_clear_cursor_exception().unwrap();
                assert_eq!(
                    node.check_meta_consistency(cursor, count, NodeType::Internal),
                    None
                );
            }
            all_keys.insert(left_count, splitter);
            assert_eq!(all_keys, expected_keys);
            assert_eq!(children, expected_children);
        }
    }

    #[test]
    fn rebalance_then_merge() {
        let (file, node) = setup();
        let mut rng = StdRng::seed_from_u64(4);
        let generation = Generation::initial();
        let mut left = file.write_cursor();
        let mut right = file.write_cursor();
        left.next(3).unwrap();
        right.next(4).unwrap();
        let left_entries = fill(&node, &mut left, &mut rng, 30);
        node.initialize_leaf(&mut right, generation).unwrap();
        let right_entry = (vec![0xFF; 6], vec![1; 60]);
        node.insert_key_value_at(&mut right, &right_entry.0, &right_entry.1, 0, 0, generation)
            .unwrap();
        tree_node::set_key_count(&mut right, 1);

        let left_count = left_entries.len();
        assert!(node.leaf_underflow(&mut right, 1));
        assert!(!node.can_merge_leaves(&mut left, left_count, &mut right, 1));
        let moved = node
            .can_rebalance_leaves(&mut left, left_count, &mut right, 1)
            .unwrap();
        node.move_key_values_from_left_to_right(
            &mut left,
            left_count,
            &mut right,
            1,
            left_count - moved,
        );
        let mut all = contents(&node, &mut left);
        all.extend(contents(&node, &mut right));
        let mut expected = left_entries.clone();
        expected.push(right_entry.clone());
        assert_eq!(all, expected);
        assert_eq!(tree_node::key_count(&mut right), moved + 1);

        // Empty the right side down to one entry, then merge it back
        let mut right_count = moved + 1;
        while right_count > 1 {
            node.remove_key_value_at(&mut right, 0, right_count);
            right_count -= 1;
            tree_node::set_key_count(&mut right, right_count);
        }
        let left_count = tree_node::key_count(&mut left);
        loop {
            let count = tree_node::key_count(&mut left);
            if node.can_merge_leaves(&mut left, count, &mut right, 1) {
                break;
            }
            node.remove_key_value_at(&mut left, count - 1, count);
            tree_node::set_key_count(&mut left, count - 1);
        }
        assert!(tree_node::key_count(&mut left) <= left_count);
        let mut expected = contents(&node, &mut left);
        expected.extend(contents(&node, &mut right));
        let count = tree_node::key_count(&mut left);
        node.merge_leaves(&mut left, count, &mut right, 1);
        assert_eq!(contents(&node, &mut left), expected);
        assert_eq!(tree_node::key_count(&mut right), 1);
    }

    #[test]
    fn torn_offsets_raise_cursor_exception() {
        let (file, node) = setup();
        let generation = Generation::initial();
        let mut cursor = file.write_cursor();
        cursor.next(3).unwrap();
        node.initialize_leaf(&mut cursor, generation).unwrap();
        node.insert_key_value_at(&mut cursor, b"key", b"value", 0, 0, generation)
            .unwrap();
        tree_node::set_key_count(&mut cursor, 1);

        cursor.put_u16_at(node.key_pos_offset(0, NodeType::Leaf), 10);
        assert_eq!(node.key_at(&mut cursor, 0, NodeType::Leaf).unwrap(), Vec::<u8>::new());
        assert!(cursor.check_and_clear_cursor_exception().is_err());
        assert!(node
            .check_meta_consistency(&mut cursor, 1, NodeType::Leaf)
            .is_some());
    }

    #[test]
    fn balance_point_minimizes_delta() {
        assert_eq!(balance_point(&[10, 10, 10, 10]), 2);
        assert_eq!(balance_point(&[100, 1, 1, 1]), 1);
        assert_eq!(balance_point(&[1, 1, 1, 100]), 3);
        assert_eq!(balance_point(&[5]), 1);
    }
}
