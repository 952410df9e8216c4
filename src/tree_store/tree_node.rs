use crate::tree_store::gen_safe_pointer::{self, PointerFailure, PointerRead, GSPP_SIZE, NO_NODE};
use crate::tree_store::generation::Generation;
use crate::tree_store::page_store::{PageCursor, PageId};
use crate::{Error, Result};
use std::cmp::Ordering;

pub(crate) const NODE_TYPE_TREE_NODE: u8 = 1;
pub(crate) const NODE_TYPE_FREE_LIST_NODE: u8 = 2;
pub(crate) const NODE_TYPE_OFFLOAD: u8 = 3;

const LEAF_FLAG: u8 = 1;
const INTERNAL_FLAG: u8 = 0;

// Header shared by both layouts
const BYTE_POS_NODE_TYPE: usize = 0;
const BYTE_POS_TYPE: usize = BYTE_POS_NODE_TYPE + 1;
const BYTE_POS_GENERATION: usize = BYTE_POS_TYPE + 1;
const BYTE_POS_KEY_COUNT: usize = BYTE_POS_GENERATION + 4;
pub(crate) const BYTE_POS_RIGHT_SIBLING: usize = BYTE_POS_KEY_COUNT + 4;
pub(crate) const BYTE_POS_LEFT_SIBLING: usize = BYTE_POS_RIGHT_SIBLING + GSPP_SIZE;
pub(crate) const BYTE_POS_SUCCESSOR: usize = BYTE_POS_LEFT_SIBLING + GSPP_SIZE;
const BYTE_POS_LAYOUT: usize = BYTE_POS_SUCCESSOR + GSPP_SIZE;
pub(crate) const BASE_HEADER_LENGTH: usize = BYTE_POS_LAYOUT + 1;

pub(crate) type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// How entries are laid out within a tree node page
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeLayout {
    /// Flat arrays of fixed-width keys, values and children. Requires fixed-width types
    Fixed,
    /// Variable-length entries allocated from the end of the page
    Dynamic,
}

impl NodeLayout {
    pub(crate) fn marker(self) -> u8 {
        match self {
            NodeLayout::Fixed => 1,
            NodeLayout::Dynamic => 2,
        }
    }

    pub(crate) fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            1 => Some(NodeLayout::Fixed),
            2 => Some(NodeLayout::Dynamic),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum NodeType {
    Leaf,
    Internal,
}

/// Whether an entry fits into a node
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Overflow {
    No,
    /// Fits once dead space has been reclaimed
    NoNeedDefrag,
    Yes,
}

/// Bytes of a node in use by live entries (including their slots) and by dead entries
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct NodeSpace {
    pub(crate) active: usize,
    pub(crate) dead: usize,
}

impl From<PointerFailure> for Error {
    fn from(failure: PointerFailure) -> Error {
        Error::TreeInconsistency(failure.to_string())
    }
}

pub(crate) fn initialize(
    cursor: &mut PageCursor,
    layout: NodeLayout,
    node_type: NodeType,
    generation: Generation,
) -> Result {
    cursor.put_zeros_at(0, cursor.page_size());
    cursor.put_u8_at(BYTE_POS_NODE_TYPE, NODE_TYPE_TREE_NODE);
    cursor.put_u8_at(
        BYTE_POS_TYPE,
        match node_type {
            NodeType::Leaf => LEAF_FLAG,
            NodeType::Internal => INTERNAL_FLAG,
        },
    );
    set_generation(cursor, generation.unstable());
    set_key_count(cursor, 0);
    set_right_sibling(cursor, NO_NODE, generation)?;
    set_left_sibling(cursor, NO_NODE, generation)?;
    set_successor(cursor, NO_NODE, generation)?;
    cursor.put_u8_at(BYTE_POS_LAYOUT, layout.marker());
    Ok(())
}

pub(crate) fn node_type(cursor: &mut PageCursor) -> u8 {
    cursor.get_u8_at(BYTE_POS_NODE_TYPE)
}

pub(crate) fn is_node(cursor: &mut PageCursor) -> bool {
    node_type(cursor) == NODE_TYPE_TREE_NODE
}

/// Leaf or internal, or None if the type byte is neither
pub(crate) fn tree_node_type(cursor: &mut PageCursor) -> Option<NodeType> {
    match cursor.get_u8_at(BYTE_POS_TYPE) {
        LEAF_FLAG => Some(NodeType::Leaf),
        INTERNAL_FLAG => Some(NodeType::Internal),
        _ => None,
    }
}

pub(crate) fn layout_marker(cursor: &mut PageCursor) -> u8 {
    cursor.get_u8_at(BYTE_POS_LAYOUT)
}

pub(crate) fn generation(cursor: &mut PageCursor) -> u64 {
    cursor.get_u32_at(BYTE_POS_GENERATION) as u64
}

pub(crate) fn set_generation(cursor: &mut PageCursor, generation: u64) {
    cursor.put_u32_at(BYTE_POS_GENERATION, generation as u32);
}

pub(crate) fn key_count(cursor: &mut PageCursor) -> usize {
    cursor.get_u32_at(BYTE_POS_KEY_COUNT) as usize
}

pub(crate) fn set_key_count(cursor: &mut PageCursor, count: usize) {
    cursor.put_u32_at(BYTE_POS_KEY_COUNT, count as u32);
}

pub(crate) fn right_sibling(
    cursor: &mut PageCursor,
    generation: Generation,
) -> std::result::Result<PointerRead, PointerFailure> {
    gen_safe_pointer::read(
        cursor,
        BYTE_POS_RIGHT_SIBLING,
        generation.stable(),
        generation.unstable(),
    )
}

pub(crate) fn left_sibling(
    cursor: &mut PageCursor,
    generation: Generation,
) -> std::result::Result<PointerRead, PointerFailure> {
    gen_safe_pointer::read(
        cursor,
        BYTE_POS_LEFT_SIBLING,
        generation.stable(),
        generation.unstable(),
    )
}

pub(crate) fn successor(
    cursor: &mut PageCursor,
    generation: Generation,
) -> std::result::Result<PointerRead, PointerFailure> {
    gen_safe_pointer::read(
        cursor,
        BYTE_POS_SUCCESSOR,
        generation.stable(),
        generation.unstable(),
    )
}

pub(crate) fn set_right_sibling(
    cursor: &mut PageCursor,
    pointer: PageId,
    generation: Generation,
) -> Result {
    gen_safe_pointer::write(
        cursor,
        BYTE_POS_RIGHT_SIBLING,
        pointer,
        generation.stable(),
        generation.unstable(),
    )?;
    Ok(())
}

pub(crate) fn set_left_sibling(
    cursor: &mut PageCursor,
    pointer: PageId,
    generation: Generation,
) -> Result {
    gen_safe_pointer::write(
        cursor,
        BYTE_POS_LEFT_SIBLING,
        pointer,
        generation.stable(),
        generation.unstable(),
    )?;
    Ok(())
}

pub(crate) fn set_successor(
    cursor: &mut PageCursor,
    pointer: PageId,
    generation: Generation,
) -> Result {
    gen_safe_pointer::write(
        cursor,
        BYTE_POS_SUCCESSOR,
        pointer,
        generation.stable(),
        generation.unstable(),
    )?;
    Ok(())
}

/// Resets the successor pointer. Used on a fresh copy of a node, which must not inherit the
/// successor of its source
pub(crate) fn clear_successor(cursor: &mut PageCursor, generation: Generation) -> Result {
    gen_safe_pointer::clean(cursor, BYTE_POS_SUCCESSOR);
    set_successor(cursor, NO_NODE, generation)
}

/// Binary search for `key` among the keys of a node. Returns the position of the key if found,
/// otherwise the position it would be inserted at
pub(crate) fn search(
    node: &dyn TreeNode,
    cursor: &mut PageCursor,
    node_type: NodeType,
    key: &[u8],
    key_count: usize,
    compare: KeyComparator,
) -> Result<(usize, bool)> {
    let mut min = 0;
    let mut max = key_count;
    while min < max {
        let mid = (min + max) / 2;
        let probe = node.key_at(cursor, mid, node_type)?;
        match compare(key, &probe) {
            Ordering::Less => max = mid,
            Ordering::Greater => min = mid + 1,
            Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((min, false))
}

/// Position of the child to descend into when looking for `key` in an internal node
pub(crate) fn child_position(position: usize, found: bool) -> usize {
    if found {
        position + 1
    } else {
        position
    }
}

/// Operations of one node layout over raw pages.
///
/// Positions are zero based. Methods that insert or remove single entries do not update the key
/// count, the caller does; methods that move entries between nodes set the key counts of both.
pub(crate) trait TreeNode: Send + Sync {
    fn layout(&self) -> NodeLayout;

    fn leaf_max_key_count(&self) -> usize;

    fn internal_max_key_count(&self) -> usize;

    /// Rejects entries this layout can't store
    fn validate_entry_size(&self, key_len: usize, value_len: usize) -> Result;

    /// Layout specific part of initialization, after the shared header has been written
    fn initialize_layout(&self, cursor: &mut PageCursor);

    fn initialize_leaf(&self, cursor: &mut PageCursor, generation: Generation) -> Result {
        initialize(cursor, self.layout(), NodeType::Leaf, generation)?;
        self.initialize_layout(cursor);
        Ok(())
    }

    fn initialize_internal(&self, cursor: &mut PageCursor, generation: Generation) -> Result {
        initialize(cursor, self.layout(), NodeType::Internal, generation)?;
        self.initialize_layout(cursor);
        Ok(())
    }

    fn key_at(&self, cursor: &mut PageCursor, pos: usize, node_type: NodeType) -> Result<Vec<u8>>;

    fn value_at(&self, cursor: &mut PageCursor, pos: usize) -> Result<Vec<u8>>;

    fn key_value_at(&self, cursor: &mut PageCursor, pos: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((
            self.key_at(cursor, pos, NodeType::Leaf)?,
            self.value_at(cursor, pos)?,
        ))
    }

    fn child_offset(&self, pos: usize) -> usize;

    fn child_at(
        &self,
        cursor: &mut PageCursor,
        pos: usize,
        generation: Generation,
    ) -> std::result::Result<PointerRead, PointerFailure> {
        gen_safe_pointer::read(
            cursor,
            self.child_offset(pos),
            generation.stable(),
            generation.unstable(),
        )
    }

    fn set_child_at(
        &self,
        cursor: &mut PageCursor,
        child: PageId,
        pos: usize,
        generation: Generation,
    ) -> Result {
        gen_safe_pointer::write(
            cursor,
            self.child_offset(pos),
            child,
            generation.stable(),
            generation.unstable(),
        )?;
        Ok(())
    }

    /// Writes a child pointer into a slot whose previous contents are meaningless
    fn write_new_child_at(
        &self,
        cursor: &mut PageCursor,
        child: PageId,
        pos: usize,
        generation: Generation,
    ) -> Result {
        gen_safe_pointer::clean(cursor, self.child_offset(pos));
        self.set_child_at(cursor, child, pos, generation)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_key_value_at(
        &self,
        cursor: &mut PageCursor,
        key: &[u8],
        value: &[u8],
        pos: usize,
        key_count: usize,
        generation: Generation,
    ) -> Result;

    /// Inserts `key` at `pos` and `child` at `pos + 1`
    #[allow(clippy::too_many_arguments)]
    fn insert_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor,
        key: &[u8],
        child: PageId,
        pos: usize,
        key_count: usize,
        generation: Generation,
    ) -> Result;

    fn remove_key_value_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize);

    /// Removes the key at `key_pos` and the child at `key_pos + 1`
    fn remove_key_and_right_child_at(&self, cursor: &mut PageCursor, key_pos: usize, key_count: usize);

    /// Overwrites the value at `pos` in place. Returns false if the new value doesn't fit the
    /// existing entry, in which case nothing was written
    fn set_value_at(&self, cursor: &mut PageCursor, value: &[u8], pos: usize) -> Result<bool>;

    fn leaf_overflow(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        key: &[u8],
        value: &[u8],
    ) -> Overflow;

    fn internal_overflow(&self, cursor: &mut PageCursor, key_count: usize, key: &[u8]) -> Overflow;

    fn leaf_underflow(&self, cursor: &mut PageCursor, key_count: usize) -> bool;

    /// Number of trailing entries to move from `left` to `right` to even them out, if the two
    /// can't be merged and moving would help
    fn can_rebalance_leaves(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
    ) -> Option<usize>;

    fn can_merge_leaves(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
    ) -> bool;

    /// Splits the full leaf `left` into `left` and the empty, initialized leaf `right` while
    /// inserting the new entry at `insert_pos`. Returns the first key of `right`
    #[allow(clippy::too_many_arguments)]
    fn do_split_leaf(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        insert_pos: usize,
        key: &[u8],
        value: &[u8],
        generation: Generation,
    ) -> Result<Vec<u8>>;

    /// Splits the full internal node `left` into `left` and the empty, initialized internal node
    /// `right` while inserting `key` at `insert_pos` with `right_child` to its right. Returns the
    /// key that separates the two and no longer lives in either
    #[allow(clippy::too_many_arguments)]
    fn do_split_internal(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        insert_pos: usize,
        key: &[u8],
        right_child: PageId,
        generation: Generation,
    ) -> Result<Vec<u8>>;

    /// Moves the entries of `left` from `from_pos` onwards to the front of `right`
    fn move_key_values_from_left_to_right(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
        from_pos: usize,
    );

    /// Appends all entries of `right` to `left`. `right` itself is left as it was
    fn merge_leaves(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
    );

    fn defragment_leaf(&self, cursor: &mut PageCursor);

    fn defragment_internal(&self, cursor: &mut PageCursor);

    fn reasonable_key_count(&self, key_count: usize, node_type: NodeType) -> bool {
        match node_type {
            NodeType::Leaf => key_count <= self.leaf_max_key_count(),
            NodeType::Internal => key_count <= self.internal_max_key_count(),
        }
    }

    /// Describes what is wrong with the layout specific bookkeeping of the node, if anything
    fn check_meta_consistency(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        node_type: NodeType,
    ) -> Option<String>;

    fn space(&self, cursor: &mut PageCursor, key_count: usize, node_type: NodeType) -> NodeSpace;

    /// Pages holding the offload chain that starts at `record_id`
    fn offload_chain_pages(&self, _cursor: &PageCursor, _record_id: u64) -> Result<Vec<PageId>> {
        Ok(vec![])
    }

    /// Ids of the offload records referenced by live entries
    fn offload_ids(
        &self,
        _cursor: &mut PageCursor,
        _key_count: usize,
        _node_type: NodeType,
    ) -> Vec<u64> {
        vec![]
    }
}

#[cfg(test)]
mod test {
    use crate::tree_store::gen_safe_pointer::NO_NODE;
    use crate::tree_store::generation::Generation;
    use crate::tree_store::page_store::PagedFile;
    use crate::tree_store::tree_node::*;
    use crate::InMemoryBackend;

    #[test]
    fn header_round_trip() {
        let file = PagedFile::new(Box::new(InMemoryBackend::new()), 512);
        let mut cursor = file.write_cursor();
        cursor.next(3).unwrap();
        let current = Generation::new(4, 5);
        initialize(&mut cursor, NodeLayout::Dynamic, NodeType::Internal, current).unwrap();

        assert!(is_node(&mut cursor));
        assert_eq!(tree_node_type(&mut cursor), Some(NodeType::Internal));
        assert_eq!(generation(&mut cursor), 5);
        assert_eq!(key_count(&mut cursor), 0);
        assert_eq!(layout_marker(&mut cursor), NodeLayout::Dynamic.marker());
        assert_eq!(right_sibling(&mut cursor, current).unwrap().pointer, NO_NODE);
        assert_eq!(left_sibling(&mut cursor, current).unwrap().pointer, NO_NODE);
        assert_eq!(successor(&mut cursor, current).unwrap().pointer, NO_NODE);

        set_key_count(&mut cursor, 17);
        set_right_sibling(&mut cursor, 99, current).unwrap();
        assert_eq!(key_count(&mut cursor), 17);
        assert_eq!(right_sibling(&mut cursor, current).unwrap().pointer, 99);
        assert_eq!(BASE_HEADER_LENGTH, 83);
    }

    #[test]
    fn layout_markers() {
        for layout in [NodeLayout::Fixed, NodeLayout::Dynamic] {
            assert_eq!(NodeLayout::from_marker(layout.marker()), Some(layout));
        }
        assert_eq!(NodeLayout::from_marker(0), None);
    }
}
