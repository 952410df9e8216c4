use crate::tree_store::gen_safe_pointer::GSPP_SIZE;
use crate::tree_store::generation::Generation;
use crate::tree_store::page_store::{PageCursor, PageId};
use crate::tree_store::tree_node::{
    self, NodeLayout, NodeSpace, NodeType, Overflow, TreeNode, BASE_HEADER_LENGTH,
};
use crate::{Error, Result};

/// Node layout for keys and values of constant width.
///
/// Keys, values and children live in three flat arrays after the header:
/// ```text
/// leaf:     [header][key 0 .. key leaf_max)[value 0 .. value leaf_max)
/// internal: [header][key 0 .. key internal_max)[child 0 .. child internal_max]
/// ```
pub(crate) struct TreeNodeFixedSize {
    key_size: usize,
    value_size: usize,
    leaf_max_key_count: usize,
    internal_max_key_count: usize,
}

impl TreeNodeFixedSize {
    pub(crate) fn new(page_size: usize, key_size: usize, value_size: usize) -> Result<Self> {
        let usable = page_size.saturating_sub(BASE_HEADER_LENGTH);
        let leaf_max_key_count = usable / (key_size + value_size).max(1);
        let internal_max_key_count = usable.saturating_sub(GSPP_SIZE) / (key_size + GSPP_SIZE);
        if leaf_max_key_count < 2 || internal_max_key_count < 2 {
            return Err(Error::MetadataMismatch(format!(
                "page size {} fits fewer than two entries of key size {} and value size {}",
                page_size, key_size, value_size
            )));
        }

        Ok(Self {
            key_size,
            value_size,
            leaf_max_key_count,
            internal_max_key_count,
        })
    }

    fn key_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + pos * self.key_size
    }

    fn value_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + self.leaf_max_key_count * self.key_size + pos * self.value_size
    }

    fn max_key_count(&self, node_type: NodeType) -> usize {
        match node_type {
            NodeType::Leaf => self.leaf_max_key_count,
            NodeType::Internal => self.internal_max_key_count,
        }
    }

    pub(crate) fn insert_key_at(
        &self,
        cursor: &mut PageCursor,
        key: &[u8],
        pos: usize,
        key_count: usize,
    ) {
        insert_slot_at(cursor, self.key_offset(0), self.key_size, pos, key_count);
        cursor.put_bytes_at(self.key_offset(pos), key);
    }

    pub(crate) fn insert_value_at(
        &self,
        cursor: &mut PageCursor,
        value: &[u8],
        pos: usize,
        key_count: usize,
    ) {
        insert_slot_at(cursor, self.value_offset(0), self.value_size, pos, key_count);
        cursor.put_bytes_at(self.value_offset(pos), value);
    }

    pub(crate) fn insert_child_at(
        &self,
        cursor: &mut PageCursor,
        child: PageId,
        pos: usize,
        key_count: usize,
        generation: Generation,
    ) -> Result {
        insert_slot_at(cursor, self.child_offset(0), GSPP_SIZE, pos, key_count + 1);
        self.write_new_child_at(cursor, child, pos, generation)
    }

    pub(crate) fn remove_key_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize) {
        remove_slot_at(cursor, self.key_offset(0), self.key_size, pos, key_count);
    }

    pub(crate) fn remove_value_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize) {
        remove_slot_at(cursor, self.value_offset(0), self.value_size, pos, key_count);
    }

    pub(crate) fn remove_child_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize) {
        remove_slot_at(cursor, self.child_offset(0), GSPP_SIZE, pos, key_count + 1);
    }

    // Copies `count` keys (and values, for leaves) from `source` at `source_pos` to `target` at
    // `target_pos`
    fn copy_key_values(
        &self,
        source: &mut PageCursor,
        source_pos: usize,
        target: &mut PageCursor,
        target_pos: usize,
        count: usize,
    ) {
        source.copy_to(
            self.key_offset(source_pos),
            target,
            self.key_offset(target_pos),
            count * self.key_size,
        );
        source.copy_to(
            self.value_offset(source_pos),
            target,
            self.value_offset(target_pos),
            count * self.value_size,
        );
    }

    fn copy_keys(
        &self,
        source: &mut PageCursor,
        source_pos: usize,
        target: &mut PageCursor,
        target_pos: usize,
        count: usize,
    ) {
        source.copy_to(
            self.key_offset(source_pos),
            target,
            self.key_offset(target_pos),
            count * self.key_size,
        );
    }

    fn copy_children(
        &self,
        source: &mut PageCursor,
        source_pos: usize,
        target: &mut PageCursor,
        target_pos: usize,
        count: usize,
    ) {
        source.copy_to(
            self.child_offset(source_pos),
            target,
            self.child_offset(target_pos),
            count * GSPP_SIZE,
        );
    }

    // Zeroes the key and value slots from `from` up to the leaf capacity
    fn clear_leaf_tail(&self, cursor: &mut PageCursor, from: usize) {
        let max = self.leaf_max_key_count;
        cursor.put_zeros_at(self.key_offset(from), (max - from) * self.key_size);
        cursor.put_zeros_at(self.value_offset(from), (max - from) * self.value_size);
    }

    // Zeroes the key slots from `from_key` and child slots from `from_key + 1`
    fn clear_internal_tail(&self, cursor: &mut PageCursor, from_key: usize) {
        let max = self.internal_max_key_count;
        cursor.put_zeros_at(self.key_offset(from_key), (max - from_key) * self.key_size);
        cursor.put_zeros_at(
            self.child_offset(from_key + 1),
            (max - from_key) * GSPP_SIZE,
        );
    }
}

fn insert_slot_at(
    cursor: &mut PageCursor,
    base: usize,
    slot_size: usize,
    pos: usize,
    count: usize,
) {
    debug_assert!(pos <= count);
    let at = base + pos * slot_size;
    cursor.shift_bytes(at, (count - pos) * slot_size, slot_size as isize);
}

fn remove_slot_at(
    cursor: &mut PageCursor,
    base: usize,
    slot_size: usize,
    pos: usize,
    count: usize,
) {
    debug_assert!(pos < count);
    let at = base + pos * slot_size;
    cursor.shift_bytes(
        at + slot_size,
        (count - pos - 1) * slot_size,
        -(slot_size as isize),
    );
    cursor.put_zeros_at(base + (count - 1) * slot_size, slot_size);
}

impl TreeNode for TreeNodeFixedSize {
    fn layout(&self) -> NodeLayout {
        NodeLayout::Fixed
    }

    fn leaf_max_key_count(&self) -> usize {
        self.leaf_max_key_count
    }

    fn internal_max_key_count(&self) -> usize {
        self.internal_max_key_count
    }

    fn validate_entry_size(&self, key_len: usize, value_len: usize) -> Result {
        if key_len != self.key_size {
            return Err(Error::MetadataMismatch(format!(
                "key of {} bytes in a tree of {} byte keys",
                key_len, self.key_size
            )));
        }
        if value_len != self.value_size {
            return Err(Error::MetadataMismatch(format!(
                "value of {} bytes in a tree of {} byte values",
                value_len, self.value_size
            )));
        }
        Ok(())
    }

    fn initialize_layout(&self, _cursor: &mut PageCursor) {}

    fn key_at(&self, cursor: &mut PageCursor, pos: usize, node_type: NodeType) -> Result<Vec<u8>> {
        let mut key = vec![0; self.key_size];
        if pos >= self.max_key_count(node_type) {
            cursor.set_cursor_exception(format!("key position {} out of range", pos));
            return Ok(key);
        }
        cursor.get_bytes_at(self.key_offset(pos), &mut key);
        Ok(key)
    }

    fn value_at(&self, cursor: &mut PageCursor, pos: usize) -> Result<Vec<u8>> {
        let mut value = vec![0; self.value_size];
        if pos >= self.leaf_max_key_count {
            cursor.set_cursor_exception(format!("value position {} out of range", pos));
            return Ok(value);
        }
        cursor.get_bytes_at(self.value_offset(pos), &mut value);
        Ok(value)
    }

    fn child_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + self.internal_max_key_count * self.key_size + pos * GSPP_SIZE
    }

    fn insert_key_value_at(
        &self,
        cursor: &mut PageCursor,
        key: &[u8],
        value: &[u8],
        pos: usize,
        key_count: usize,
        _generation: Generation,
    ) -> Result {
        self.insert_key_at(cursor, key, pos, key_count);
        self.insert_value_at(cursor, value, pos, key_count);
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
        self.insert_key_at(cursor, key, pos, key_count);
        self.insert_child_at(cursor, child, pos + 1, key_count, generation)
    }

    fn remove_key_value_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize) {
        self.remove_key_at(cursor, pos, key_count);
        self.remove_value_at(cursor, pos, key_count);
    }

    fn remove_key_and_right_child_at(
        &self,
        cursor: &mut PageCursor,
        key_pos: usize,
        key_count: usize,
    ) {
        self.remove_key_at(cursor, key_pos, key_count);
        self.remove_child_at(cursor, key_pos + 1, key_count);
    }

    fn set_value_at(&self, cursor: &mut PageCursor, value: &[u8], pos: usize) -> Result<bool> {
        if pos >= self.leaf_max_key_count {
            return Err(Error::Corrupted(format!(
                "page {}: value position {} out of range",
                cursor.current_page_id(),
                pos
            )));
        }
        if value.len() != self.value_size {
            return Ok(false);
        }
        cursor.put_bytes_at(self.value_offset(pos), value);
        Ok(true)
    }

    fn leaf_overflow(
        &self,
        _cursor: &mut PageCursor,
        key_count: usize,
        _key: &[u8],
        _value: &[u8],
    ) -> Overflow {
        if key_count + 1 > self.leaf_max_key_count {
            Overflow::Yes
        } else {
            Overflow::No
        }
    }

    fn internal_overflow(&self, _cursor: &mut PageCursor, key_count: usize, _key: &[u8]) -> Overflow {
        if key_count + 1 > self.internal_max_key_count {
            Overflow::Yes
        } else {
            Overflow::No
        }
    }

    fn leaf_underflow(&self, _cursor: &mut PageCursor, key_count: usize) -> bool {
        key_count < (self.leaf_max_key_count + 1) / 2
    }

    fn can_rebalance_leaves(
        &self,
        _left: &mut PageCursor,
        left_key_count: usize,
        _right: &mut PageCursor,
        right_key_count: usize,
    ) -> Option<usize> {
        let total = left_key_count + right_key_count;
        if total <= self.leaf_max_key_count || left_key_count <= right_key_count {
            return None;
        }
        Some(left_key_count - total / 2)
    }

    fn can_merge_leaves(
        &self,
        _left: &mut PageCursor,
        left_key_count: usize,
        _right: &mut PageCursor,
        right_key_count: usize,
    ) -> bool {
        left_key_count + right_key_count <= self.leaf_max_key_count
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
        let middle = (n + 1) / 2;

        if insert_pos < middle {
            // The new entry lands in the left half, which gives up one more entry
            self.copy_key_values(left, middle - 1, right, 0, n - (middle - 1));
            self.clear_leaf_tail(left, middle - 1);
            self.insert_key_value_at(left, key, value, insert_pos, middle - 1, generation)?;
        } else {
            let before = insert_pos - middle;
            self.copy_key_values(left, middle, right, 0, before);
            right.put_bytes_at(self.key_offset(before), key);
            right.put_bytes_at(self.value_offset(before), value);
            self.copy_key_values(left, insert_pos, right, before + 1, n - insert_pos);
            self.clear_leaf_tail(left, middle);
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
        let middle = (n + 1) / 2;

        let splitter = if insert_pos < middle {
            let splitter = self.key_at(left, middle - 1, NodeType::Internal)?;
            self.copy_keys(left, middle, right, 0, n - middle);
            self.copy_children(left, middle, right, 0, n - middle + 1);
            self.clear_internal_tail(left, middle - 1);
            self.insert_key_and_right_child_at(
                left,
                key,
                right_child,
                insert_pos,
                middle - 1,
                generation,
            )?;
            splitter
        } else if insert_pos == middle {
            self.copy_keys(left, middle, right, 0, n - middle);
            self.copy_children(left, middle + 1, right, 1, n - middle);
            self.write_new_child_at(right, right_child, 0, generation)?;
            self.clear_internal_tail(left, middle);
            key.to_vec()
        } else {
            let splitter = self.key_at(left, middle, NodeType::Internal)?;
            let before = insert_pos - middle - 1;
            self.copy_keys(left, middle + 1, right, 0, before);
            right.put_bytes_at(self.key_offset(before), key);
            self.copy_keys(left, insert_pos, right, before + 1, n - insert_pos);
            self.copy_children(left, middle + 1, right, 0, before + 1);
            self.write_new_child_at(right, right_child, before + 1, generation)?;
            self.copy_children(left, insert_pos + 1, right, before + 2, n - insert_pos);
            self.clear_internal_tail(left, middle);
            splitter
        };
        tree_node::set_key_count(left, middle);
        tree_node::set_key_count(right, n - middle);

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
        right.shift_bytes(
            self.key_offset(0),
            right_key_count * self.key_size,
            (count * self.key_size) as isize,
        );
        right.shift_bytes(
            self.value_offset(0),
            right_key_count * self.value_size,
            (count * self.value_size) as isize,
        );
        self.copy_key_values(left, from_pos, right, 0, count);
        self.clear_leaf_tail(left, from_pos);
        tree_node::set_key_count(left, from_pos);
        tree_node::set_key_count(right, right_key_count + count);
    }

    fn merge_leaves(
        &self,
        left: &mut PageCursor,
        left_key_count: usize,
        right: &mut PageCursor,
        right_key_count: usize,
    ) {
        right.copy_to(
            self.key_offset(0),
            left,
            self.key_offset(left_key_count),
            right_key_count * self.key_size,
        );
        right.copy_to(
            self.value_offset(0),
            left,
            self.value_offset(left_key_count),
            right_key_count * self.value_size,
        );
        tree_node::set_key_count(left, left_key_count + right_key_count);
    }

    fn defragment_leaf(&self, _cursor: &mut PageCursor) {}

    fn defragment_internal(&self, _cursor: &mut PageCursor) {}

    fn check_meta_consistency(
        &self,
        _cursor: &mut PageCursor,
        key_count: usize,
        node_type: NodeType,
    ) -> Option<String> {
        if !self.reasonable_key_count(key_count, node_type) {
            return Some(format!(
                "key count {} exceeds the maximum of {}",
                key_count,
                self.max_key_count(node_type)
            ));
        }
        None
    }

    fn space(&self, _cursor: &mut PageCursor, key_count: usize, node_type: NodeType) -> NodeSpace {
        let active = match node_type {
            NodeType::Leaf => key_count * (self.key_size + self.value_size),
            NodeType::Internal => key_count * (self.key_size + GSPP_SIZE) + GSPP_SIZE,
        };
        NodeSpace { active, dead: 0 }
    }
}

#[cfg(test)]
mod test {
    use crate::tree_store::generation::Generation;
    use crate::tree_store::page_store::{PageCursor, PagedFile};
    use crate::tree_store::tree_node::{self, NodeType, Overflow, TreeNode};
    use crate::tree_store::tree_node_fixed::TreeNodeFixedSize;
    use crate::{Error, InMemoryBackend};

    const PAGE_SIZE: usize = 512;

    fn key(value: u64) -> Vec<u8> {
        value.to_be_bytes().to_vec()
    }

    fn leaf_contents(node: &TreeNodeFixedSize, cursor: &mut PageCursor) -> Vec<(u64, u64)> {
        let count = tree_node::key_count(cursor);
        (0..count)
            .map(|pos| {
                let (k, v) = node.key_value_at(cursor, pos).unwrap();
                (
                    u64::from_be_bytes(k.try_into().unwrap()),
                    u64::from_be_bytes(v.try_into().unwrap()),
                )
            })
            .collect()
    }

    fn fill_leaf(node: &TreeNodeFixedSize, cursor: &mut PageCursor, keys: &[u64]) {
        let generation = Generation::initial();
        node.initialize_leaf(cursor, generation).unwrap();
        for (pos, k) in keys.iter().enumerate() {
            node.insert_key_value_at(cursor, &key(*k), &key(k * 10), pos, pos, generation)
                .unwrap();
        }
        tree_node::set_key_count(cursor, keys.len());
    }

    #[test]
    fn max_key_counts() {
        let node = TreeNodeFixedSize::new(PAGE_SIZE, 8, 8).unwrap();
        assert_eq!(node.leaf_max_key_count(), (512 - 83) / 16);
        assert_eq!(node.internal_max_key_count(), (512 - 83 - 24) / 32);
        assert!(matches!(
            TreeNodeFixedSize::new(PAGE_SIZE, 8, 300),
            Err(Error::MetadataMismatch(_))
        ));
    }

    #[test]
    fn insert_and_remove_shift_slots() {
        let file = PagedFile::new(Box::new(InMemoryBackend::new()), PAGE_SIZE);
        let node = TreeNodeFixedSize::new(PAGE_SIZE, 8, 8).unwrap();
        let mut cursor = file.write_cursor();
        cursor.next(3).unwrap();
        fill_leaf(&node, &mut cursor, &[1, 3, 5]);

        node.insert_key_value_at(&mut cursor, &key(4), &key(40), 2, 3, Generation::initial())
            .unwrap();
        tree_node::set_key_count(&mut cursor, 4);
        assert_eq!(
            leaf_contents(&node, &mut cursor),
            vec![(1, 10), (3, 30), (4, 40), (5, 50)]
        );

        node.remove_key_value_at(&mut cursor, 0, 4);
        tree_node::set_key_count(&mut cursor, 3);
        assert_eq!(
            leaf_contents(&node, &mut cursor),
            vec![(3, 30), (4, 40), (5, 50)]
        );
        assert!(!cursor.check_and_clear_bounds_flag());
    }

    #[test]
    fn set_value_in_place() {
        let file = PagedFile::new(Box::new(InMemoryBackend::new()), PAGE_SIZE);
        let node = TreeNodeFixedSize::new(PAGE_SIZE, 8, 8).unwrap();
        let mut cursor = file.write_cursor();
        cursor.next(3).unwrap();
        fill_leaf(&node, &mut cursor, &[1, 3, 5]);

        assert!(node.set_value_at(&mut cursor, &key(33), 1).unwrap());
        assert!(!node.set_value_at(&mut cursor, &[1, 2], 1).unwrap());
        assert_eq!(
            leaf_contents(&node, &mut cursor),
            vec![(1, 10), (3, 33), (5, 50)]
        );

        let max = node.leaf_max_key_count();
        assert!(matches!(
            node.set_value_at(&mut cursor, &key(1), max),
            Err(Error::Corrupted(_))
        ));
        assert!(!cursor.check_and_clear_bounds_flag());
    }

    #[test]
    fn internal_children_follow_keys() {
        let file = PagedFile::new(Box::new(InMemoryBackend::new()), PAGE_SIZE);
        let node = TreeNodeFixedSize::new(PAGE_SIZE, 8, 8).unwrap();
        let generation = Generation::initial();
        let mut cursor = file.write_cursor();
        cursor.next(3).unwrap();
        node.initialize_internal(&mut cursor, generation).unwrap();
        node.write_new_child_at(&mut cursor, 100, 0, generation).unwrap();
        node.insert_key_and_right_child_at(&mut cursor, &key(10), 110, 0, 0, generation)
            .unwrap();
        node.insert_key_and_right_child_at(&mut cursor, &key(5), 105, 0, 1, generation)
            .unwrap();
        tree_node::set_key_count(&mut cursor, 2);

        let children: Vec<u64> = (0..3)
            .map(|pos| node.child_at(&mut cursor, pos, generation).unwrap().pointer)
            .collect();
        assert_eq!(children, vec![100, 105, 110]);

        node.remove_key_and_right_child_at(&mut cursor, 0, 2);
        let children: Vec<u64> = (0..2)
            .map(|pos| node.child_at(&mut cursor, pos, generation).unwrap().pointer)
            .collect();
        assert_eq!(children, vec![100, 110]);
        assert_eq!(node.key_at(&mut cursor, 0, NodeType::Internal).unwrap(), key(10));
    }

    #[test]
    fn split_leaf_at_every_position() {
        let file = PagedFile::new(Box::new(InMemoryBackend::new()), PAGE_SIZE);
        let node = TreeNodeFixedSize::new(PAGE_SIZE, 8, 8).unwrap();
        let max = node.leaf_max_key_count();
        let existing: Vec<u64> = (1..=max as u64).map(|k| k * 2).collect();

        for insert_pos in 0..=max {
            let mut left = file.write_cursor();
            let mut right = file.write_cursor();
            left.next(3).unwrap();
            right.next(4).unwrap();
            fill_leaf(&node, &mut left, &existing);
            node.initialize_leaf(&mut right, Generation::initial()).unwrap();
            let new_key = insert_pos as u64 * 2 + 1;
            let mut expected: Vec<u64> = existing.clone();
            expected.insert(insert_pos, new_key);

            let splitter = node
                .do_split_leaf(
                    &mut left,
                    max,
                    &mut right,
                    insert_pos,
                    &key(new_key),
                    &key(new_key * 10),
                    Generation::initial(),
                )
                .unwrap();

            let mut all = leaf_contents(&node, &mut left);
            let right_contents = leaf_contents(&node, &mut right);
            assert_eq!(splitter, key(right_contents[0].0));
            assert_eq!(all.len(), (max + 1) / 2);
            all.extend(right_contents);
            let keys: Vec<u64> = all.iter().map(|(k, _)| *k).collect();
            assert_eq!(keys, expected);
            assert!(all.iter().all(|(k, v)| *v == k * 10));
        }
    }

    #[test]
    fn split_internal_at_every_position() {
        let file = PagedFile::new(Box::new(InMemoryBackend::new()), PAGE_SIZE);
        let node = TreeNodeFixedSize::new(PAGE_SIZE, 8, 8).unwrap();
        let generation = Generation::initial();
        let max = node.internal_max_key_count();

        for insert_pos in 0..=max {
            let mut left = file.write_cursor();
            let mut right = file.write_cursor();
            left.next(3).unwrap();
            right.next(4).unwrap();
            node.initialize_internal(&mut left, generation).unwrap();
            node.initialize_internal(&mut right, generation).unwrap();
            // Keys 10, 20, ..; child i holds 1000 + i
            node.write_new_child_at(&mut left, 1000, 0, generation).unwrap();
            for pos in 0..max {
                node.insert_key_and_right_child_at(
                    &mut left,
                    &key((pos as u64 + 1) * 10),
                    1001 + pos as u64,
                    pos,
                    pos,
                    generation,
                )
                .unwrap();
            }
            tree_node::set_key_count(&mut left, max);

            let new_key = insert_pos as u64 * 10 + 5;
            let mut expected_keys: Vec<u64> = (1..=max as u64).map(|k| k * 10).collect();
            expected_keys.insert(insert_pos, new_key);
            let mut expected_children: Vec<u64> = (0..=max as u64).map(|c| 1000 + c).collect();
            expected_children.insert(insert_pos + 1, 5000);

            let splitter = node
                .do_split_internal(
                    &mut left,
                    max,
                    &mut right,
                    insert_pos,
                    &key(new_key),
                    5000,
                    generation,
                )
                .unwrap();

            let left_count = tree_node::key_count(&mut left);
            let right_count = tree_node::key_count(&mut right);
            assert_eq!(left_count + right_count + 1, max + 1);
            let mut keys = vec![];
            let mut children = vec![];
            for (cursor, count) in [(&mut left, left_count), (&mut right, right_count)] {
                for pos in 0..count {
                    keys.push(node.key_at(cursor, pos, NodeType::Internal).unwrap());
                }
                for pos in 0..=count {
                    children.push(node.child_at(cursor, pos, generation).unwrap().pointer);
                }
            }
            keys.insert(left_count, splitter);
            let keys: Vec<u64> = keys
                .into_iter()
                .map(|k| u64::from_be_bytes(k.try_into().unwrap()))
                .collect();
            assert_eq!(keys, expected_keys);
            assert_eq!(children, expected_children);
        }
    }

    #[test]
    fn rebalance_and_merge() {
        let file = PagedFile::new(Box::new(InMemoryBackend::new()), PAGE_SIZE);
        let node = TreeNodeFixedSize::new(PAGE_SIZE, 8, 8).unwrap();
        let max = node.leaf_max_key_count();
        let mut left = file.write_cursor();
        let mut right = file.write_cursor();
        left.next(3).unwrap();
        right.next(4).unwrap();

        let left_keys: Vec<u64> = (0..max as u64).collect();
        fill_leaf(&node, &mut left, &left_keys);
        fill_leaf(&node, &mut right, &[100]);
        assert!(node.leaf_underflow(&mut right, 1));
        assert!(!node.can_merge_leaves(&mut left, max, &mut right, 1));
        let count = node
            .can_rebalance_leaves(&mut left, max, &mut right, 1)
            .unwrap();
        node.move_key_values_from_left_to_right(&mut left, max, &mut right, 1, max - count);
        let left_count = tree_node::key_count(&mut left);
        let right_count = tree_node::key_count(&mut right);
        assert_eq!(left_count + right_count, max + 1);
        assert!(!node.leaf_underflow(&mut left, left_count));
        assert!(!node.leaf_underflow(&mut right, right_count));
        let right_contents = leaf_contents(&node, &mut right);
        assert_eq!(right_contents.last(), Some(&(100, 1000)));
        assert_eq!(right_contents[0].0, left_count as u64);

        fill_leaf(&node, &mut left, &[1, 2]);
        fill_leaf(&node, &mut right, &[3]);
        assert!(node.can_merge_leaves(&mut left, 2, &mut right, 1));
        assert_eq!(node.can_rebalance_leaves(&mut left, 2, &mut right, 1), None);
        node.merge_leaves(&mut left, 2, &mut right, 1);
        assert_eq!(
            leaf_contents(&node, &mut left),
            vec![(1, 10), (2, 20), (3, 30)]
        );
        assert_eq!(
            node.leaf_overflow(&mut left, max, &key(0), &key(0)),
            Overflow::Yes
        );
    }
}
