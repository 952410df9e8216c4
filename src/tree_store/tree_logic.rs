use crate::tree_store::free_list::IdProvider;
use crate::tree_store::gen_safe_pointer::NO_NODE;
use crate::tree_store::generation::Generation;
use crate::tree_store::page_store::{PageCursor, PageId, PagedFile};
use crate::tree_store::tree_node::{self, child_position, KeyComparator, NodeType, Overflow, TreeNode};
use crate::{Error, Result};
#[cfg(feature = "logging")]
use log::debug;

/// Where the tree starts, and the generation the pointer to it was written at
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Root {
    pub(crate) id: PageId,
    pub(crate) generation: u64,
}

/// What readers need to start a seek
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct TreeRoot {
    pub(crate) root: Root,
    pub(crate) generation: Generation,
}

// Structure changes a node reports to its parent
struct Propagation {
    // The node's id, which changes when it was copied on write
    id: PageId,
    // Splitter key and id of the new right sibling
    split: Option<(Vec<u8>, PageId)>,
    // Only reported by leaves
    underflow: bool,
}

impl Propagation {
    fn unchanged(id: PageId) -> Self {
        Self {
            id,
            split: None,
            underflow: false,
        }
    }
}

/// The writer side of the tree: all structural modifications for one operation under one
/// generation
pub(crate) struct TreeLogic<'a> {
    file: &'a PagedFile,
    node: &'a dyn TreeNode,
    ids: &'a dyn IdProvider,
    compare: KeyComparator,
    generation: Generation,
}

impl<'a> TreeLogic<'a> {
    pub(crate) fn new(
        file: &'a PagedFile,
        node: &'a dyn TreeNode,
        ids: &'a dyn IdProvider,
        compare: KeyComparator,
        generation: Generation,
    ) -> Self {
        Self {
            file,
            node,
            ids,
            compare,
            generation,
        }
    }

    /// Writes an empty leaf at `id` to serve as the root of a new tree
    pub(crate) fn initialize_root(&self, id: PageId) -> Result<Root> {
        let mut cursor = self.file.write_cursor();
        cursor.next(id)?;
        self.node.initialize_leaf(&mut cursor, self.generation)?;
        Ok(Root {
            id,
            generation: self.generation.unstable(),
        })
    }

    /// Inserts or overwrites `key`, returning the value it replaced
    pub(crate) fn insert(
        &self,
        root: &mut Root,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.node.validate_entry_size(key.len(), value.len())?;
        let mut replaced = None;
        let result = self.insert_helper(root.id, key, value, &mut replaced)?;
        self.finish_root(root, result)?;
        Ok(replaced)
    }

    /// Removes `key`, returning its value if it was present
    pub(crate) fn remove(&self, root: &mut Root, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut removed = None;
        let result = self.remove_helper(root.id, key, &mut removed)?;
        self.finish_root(root, result)?;
        Ok(removed)
    }

    fn check(cursor: &mut PageCursor) -> Result {
        if cursor.check_and_clear_bounds_flag() {
            return Err(Error::Corrupted(format!(
                "page {}: access out of bounds",
                cursor.current_page_id()
            )));
        }
        cursor.check_and_clear_cursor_exception()
    }

    // Pins `id` on the writer path and returns its type
    fn open_node(&self, id: PageId) -> Result<(PageCursor<'a>, NodeType)> {
        let mut cursor = self.file.write_cursor();
        cursor.next(id)?;
        if !tree_node::is_node(&mut cursor) {
            return Err(Error::Corrupted(format!(
                "page {} reached on the writer path is not a tree node",
                id
            )));
        }
        let successor = tree_node::successor(&mut cursor, self.generation)?;
        if successor.pointer != NO_NODE {
            return Err(Error::TreeInconsistency(format!(
                "node {} on the writer path has successor {}",
                id, successor.pointer
            )));
        }
        let node_type = tree_node::tree_node_type(&mut cursor).ok_or_else(|| {
            Error::Corrupted(format!("page {} has an unknown tree node type", id))
        })?;
        Ok((cursor, node_type))
    }

    // Copies the node to a fresh page unless it was written in the unstable generation already
    fn make_writable(
        &self,
        mut cursor: PageCursor<'a>,
        id: PageId,
    ) -> Result<(PageCursor<'a>, PageId)> {
        let node_generation = tree_node::generation(&mut cursor);
        if node_generation == self.generation.unstable() {
            return Ok((cursor, id));
        }
        if node_generation > self.generation.unstable() {
            return Err(Error::TreeInconsistency(format!(
                "node {} has generation {} above the unstable generation {}",
                id,
                node_generation,
                self.generation.unstable()
            )));
        }
        self.create_successor(cursor, id)
    }

    fn make_writable_id(&self, id: PageId) -> Result<PageId> {
        let (cursor, _) = self.open_node(id)?;
        let (_, id) = self.make_writable(cursor, id)?;
        Ok(id)
    }

    fn create_successor(
        &self,
        mut cursor: PageCursor<'a>,
        id: PageId,
    ) -> Result<(PageCursor<'a>, PageId)> {
        let new_id = self.ids.acquire_new_id(self.generation)?;
        let mut successor = self.file.write_cursor();
        successor.next(new_id)?;
        cursor.copy_to(0, &mut successor, 0, cursor.page_size());
        Self::check(&mut cursor)?;
        tree_node::set_generation(&mut successor, self.generation.unstable());
        tree_node::clear_successor(&mut successor, self.generation)?;

        tree_node::set_successor(&mut cursor, new_id, self.generation)?;
        let left = tree_node::left_sibling(&mut cursor, self.generation)?.pointer;
        let right = tree_node::right_sibling(&mut cursor, self.generation)?.pointer;
        drop(cursor);

        if left != NO_NODE {
            let mut neighbour = self.file.write_cursor();
            neighbour.next(left)?;
            tree_node::set_right_sibling(&mut neighbour, new_id, self.generation)?;
        }
        if right != NO_NODE {
            let mut neighbour = self.file.write_cursor();
            neighbour.next(right)?;
            tree_node::set_left_sibling(&mut neighbour, new_id, self.generation)?;
        }
        self.ids.release_id(self.generation, id)?;

        Ok((successor, new_id))
    }

    // Hooks the freshly split off `right` in between `left` and its former right sibling
    fn link_right_sibling(
        &self,
        left: &mut PageCursor,
        left_id: PageId,
        right: &mut PageCursor,
        right_id: PageId,
    ) -> Result {
        let old_right = tree_node::right_sibling(left, self.generation)?.pointer;
        tree_node::set_right_sibling(right, old_right, self.generation)?;
        tree_node::set_left_sibling(right, left_id, self.generation)?;
        tree_node::set_right_sibling(left, right_id, self.generation)?;
        if old_right != NO_NODE {
            let mut neighbour = self.file.write_cursor();
            neighbour.next(old_right)?;
            tree_node::set_left_sibling(&mut neighbour, right_id, self.generation)?;
        }
        Ok(())
    }

    // Points the former right sibling of `removed` back at `left`, which took over its entries
    fn unlink_right_sibling(&self, left: &mut PageCursor, removed: &mut PageCursor) -> Result<PageId> {
        let next = tree_node::right_sibling(removed, self.generation)?.pointer;
        tree_node::set_right_sibling(left, next, self.generation)?;
        Ok(next)
    }

    fn relink_left_sibling(&self, id: PageId, left_id: PageId) -> Result {
        if id != NO_NODE {
            let mut neighbour = self.file.write_cursor();
            neighbour.next(id)?;
            tree_node::set_left_sibling(&mut neighbour, left_id, self.generation)?;
        }
        Ok(())
    }

    fn insert_helper(
        &self,
        id: PageId,
        key: &[u8],
        value: &[u8],
        replaced: &mut Option<Vec<u8>>,
    ) -> Result<Propagation> {
        let (mut cursor, node_type) = self.open_node(id)?;
        match node_type {
            NodeType::Leaf => self.insert_in_leaf(cursor, id, key, value, replaced),
            NodeType::Internal => {
                let key_count = tree_node::key_count(&mut cursor);
                let (pos, found) = tree_node::search(
                    self.node,
                    &mut cursor,
                    NodeType::Internal,
                    key,
                    key_count,
                    self.compare,
                )?;
                Self::check(&mut cursor)?;
                let child_pos = child_position(pos, found);
                let child = self.node.child_at(&mut cursor, child_pos, self.generation)?;
                let result = self.insert_helper(child.pointer, key, value, replaced)?;
                self.apply_child_changes(cursor, id, child_pos, child.pointer, result)
            }
        }
    }

    fn insert_in_leaf(
        &self,
        cursor: PageCursor<'a>,
        id: PageId,
        key: &[u8],
        value: &[u8],
        replaced: &mut Option<Vec<u8>>,
    ) -> Result<Propagation> {
        let (mut cursor, id) = self.make_writable(cursor, id)?;
        let mut key_count = tree_node::key_count(&mut cursor);
        let (pos, found) = tree_node::search(
            self.node,
            &mut cursor,
            NodeType::Leaf,
            key,
            key_count,
            self.compare,
        )?;
        if found {
            *replaced = Some(self.node.value_at(&mut cursor, pos)?);
            Self::check(&mut cursor)?;
            if self.node.set_value_at(&mut cursor, value, pos)? {
                return Ok(Propagation::unchanged(id));
            }
            self.node.remove_key_value_at(&mut cursor, pos, key_count);
            key_count -= 1;
            tree_node::set_key_count(&mut cursor, key_count);
        }
        Self::check(&mut cursor)?;

        match self.node.leaf_overflow(&mut cursor, key_count, key, value) {
            Overflow::No => {}
            Overflow::NoNeedDefrag => self.node.defragment_leaf(&mut cursor),
            Overflow::Yes => {
                let right_id = self.ids.acquire_new_id(self.generation)?;
                let mut right = self.file.write_cursor();
                right.next(right_id)?;
                self.node.initialize_leaf(&mut right, self.generation)?;
                let splitter = self.node.do_split_leaf(
                    &mut cursor,
                    key_count,
                    &mut right,
                    pos,
                    key,
                    value,
                    self.generation,
                )?;
                self.link_right_sibling(&mut cursor, id, &mut right, right_id)?;
                Self::check(&mut right)?;
                Self::check(&mut cursor)?;
                return Ok(Propagation {
                    id,
                    split: Some((splitter, right_id)),
                    underflow: false,
                });
            }
        }
        self.node
            .insert_key_value_at(&mut cursor, key, value, pos, key_count, self.generation)?;
        tree_node::set_key_count(&mut cursor, key_count + 1);
        Self::check(&mut cursor)?;
        Ok(Propagation::unchanged(id))
    }

    // Inserts `key` at `pos` with `right_child` to its right
    fn insert_in_internal(
        &self,
        cursor: PageCursor<'a>,
        id: PageId,
        pos: usize,
        key: &[u8],
        right_child: PageId,
    ) -> Result<Propagation> {
        let (mut cursor, id) = self.make_writable(cursor, id)?;
        let key_count = tree_node::key_count(&mut cursor);
        match self.node.internal_overflow(&mut cursor, key_count, key) {
            Overflow::No => {}
            Overflow::NoNeedDefrag => self.node.defragment_internal(&mut cursor),
            Overflow::Yes => {
                let right_id = self.ids.acquire_new_id(self.generation)?;
                let mut right = self.file.write_cursor();
                right.next(right_id)?;
                self.node.initialize_internal(&mut right, self.generation)?;
                let splitter = self.node.do_split_internal(
                    &mut cursor,
                    key_count,
                    &mut right,
                    pos,
                    key,
                    right_child,
                    self.generation,
                )?;
                self.link_right_sibling(&mut cursor, id, &mut right, right_id)?;
                Self::check(&mut right)?;
                Self::check(&mut cursor)?;
                return Ok(Propagation {
                    id,
                    split: Some((splitter, right_id)),
                    underflow: false,
                });
            }
        }
        self.node.insert_key_and_right_child_at(
            &mut cursor,
            key,
            right_child,
            pos,
            key_count,
            self.generation,
        )?;
        tree_node::set_key_count(&mut cursor, key_count + 1);
        Self::check(&mut cursor)?;
        Ok(Propagation::unchanged(id))
    }

    fn apply_child_changes(
        &self,
        mut cursor: PageCursor<'a>,
        id: PageId,
        child_pos: usize,
        child: PageId,
        result: Propagation,
    ) -> Result<Propagation> {
        // A moved child only needs its pointer updated, which the pointer pair allows in place
        if result.id != child {
            self.node
                .set_child_at(&mut cursor, result.id, child_pos, self.generation)?;
        }
        if result.underflow {
            return self.handle_leaf_underflow(cursor, id, child_pos, result.id);
        }
        match result.split {
            Some((splitter, right)) => self.insert_in_internal(cursor, id, child_pos, &splitter, right),
            None => Ok(Propagation::unchanged(id)),
        }
    }

    fn remove_helper(
        &self,
        id: PageId,
        key: &[u8],
        removed: &mut Option<Vec<u8>>,
    ) -> Result<Propagation> {
        let (mut cursor, node_type) = self.open_node(id)?;
        let key_count = tree_node::key_count(&mut cursor);
        let (pos, found) = tree_node::search(
            self.node,
            &mut cursor,
            node_type,
            key,
            key_count,
            self.compare,
        )?;
        Self::check(&mut cursor)?;
        match node_type {
            NodeType::Leaf => {
                if !found {
                    return Ok(Propagation::unchanged(id));
                }
                let (mut cursor, id) = self.make_writable(cursor, id)?;
                *removed = Some(self.node.value_at(&mut cursor, pos)?);
                self.node.remove_key_value_at(&mut cursor, pos, key_count);
                tree_node::set_key_count(&mut cursor, key_count - 1);
                Self::check(&mut cursor)?;
                Ok(Propagation {
                    id,
                    split: None,
                    underflow: self.node.leaf_underflow(&mut cursor, key_count - 1),
                })
            }
            NodeType::Internal => {
                let child_pos = child_position(pos, found);
                let child = self.node.child_at(&mut cursor, child_pos, self.generation)?;
                let result = self.remove_helper(child.pointer, key, removed)?;
                self.apply_child_changes(cursor, id, child_pos, child.pointer, result)
            }
        }
    }

    // Evens out or merges the underflowing leaf at `child_pos` with a sibling under the same
    // parent: rebalance from the left, else merge into the left, else merge the right in
    fn handle_leaf_underflow(
        &self,
        parent: PageCursor<'a>,
        parent_id: PageId,
        child_pos: usize,
        child_id: PageId,
    ) -> Result<Propagation> {
        let mut parent = parent;
        let parent_key_count = tree_node::key_count(&mut parent);

        if child_pos > 0 {
            let left_id = self
                .node
                .child_at(&mut parent, child_pos - 1, self.generation)?
                .pointer;
            let (rebalance, merge) = {
                let mut left = self.file.write_cursor();
                left.next(left_id)?;
                let mut child = self.file.write_cursor();
                child.next(child_id)?;
                let left_count = tree_node::key_count(&mut left);
                let child_count = tree_node::key_count(&mut child);
                let rebalance =
                    self.node
                        .can_rebalance_leaves(&mut left, left_count, &mut child, child_count);
                let merge = rebalance.is_none()
                    && self
                        .node
                        .can_merge_leaves(&mut left, left_count, &mut child, child_count);
                Self::check(&mut left)?;
                Self::check(&mut child)?;
                (rebalance, merge)
            };

            if rebalance.is_some() || merge {
                // Siblings are pinned one at a time while copying, so the copy can relink them
                let new_left_id = self.make_writable_id(left_id)?;
                if new_left_id != left_id {
                    self.node
                        .set_child_at(&mut parent, new_left_id, child_pos - 1, self.generation)?;
                }
                let mut left = self.file.write_cursor();
                left.next(new_left_id)?;
                let mut child = self.file.write_cursor();
                child.next(child_id)?;
                let left_count = tree_node::key_count(&mut left);
                let child_count = tree_node::key_count(&mut child);

                if let Some(count) = rebalance {
                    self.node.move_key_values_from_left_to_right(
                        &mut left,
                        left_count,
                        &mut child,
                        child_count,
                        left_count - count,
                    );
                    let splitter = self.node.key_at(&mut child, 0, NodeType::Leaf)?;
                    Self::check(&mut child)?;
                    Self::check(&mut left)?;
                    drop(child);
                    drop(left);
                    return self.replace_splitter(parent, parent_id, child_pos - 1, &splitter);
                }

                self.node
                    .merge_leaves(&mut left, left_count, &mut child, child_count);
                let next = self.unlink_right_sibling(&mut left, &mut child)?;
                Self::check(&mut child)?;
                Self::check(&mut left)?;
                drop(child);
                drop(left);
                self.relink_left_sibling(next, new_left_id)?;
                self.ids.release_id(self.generation, child_id)?;
                return self.remove_from_internal(parent, parent_id, child_pos - 1);
            }
        }

        if child_pos < parent_key_count {
            let right_id = self
                .node
                .child_at(&mut parent, child_pos + 1, self.generation)?
                .pointer;
            let mut child = self.file.write_cursor();
            child.next(child_id)?;
            let mut right = self.file.write_cursor();
            right.next(right_id)?;
            let child_count = tree_node::key_count(&mut child);
            let right_count = tree_node::key_count(&mut right);
            if self
                .node
                .can_merge_leaves(&mut child, child_count, &mut right, right_count)
            {
                // The child was written in this generation when its entry was removed
                self.node
                    .merge_leaves(&mut child, child_count, &mut right, right_count);
                let next = self.unlink_right_sibling(&mut child, &mut right)?;
                Self::check(&mut right)?;
                Self::check(&mut child)?;
                drop(right);
                drop(child);
                self.relink_left_sibling(next, child_id)?;
                self.ids.release_id(self.generation, right_id)?;
                return self.remove_from_internal(parent, parent_id, child_pos);
            }
            Self::check(&mut right)?;
            Self::check(&mut child)?;
        }

        Ok(Propagation::unchanged(parent_id))
    }

    // The separator is variable length in general, so it's removed and inserted again
    fn replace_splitter(
        &self,
        parent: PageCursor<'a>,
        parent_id: PageId,
        key_pos: usize,
        splitter: &[u8],
    ) -> Result<Propagation> {
        let (mut parent, parent_id) = self.make_writable(parent, parent_id)?;
        let key_count = tree_node::key_count(&mut parent);
        let right_child = self
            .node
            .child_at(&mut parent, key_pos + 1, self.generation)?
            .pointer;
        self.node
            .remove_key_and_right_child_at(&mut parent, key_pos, key_count);
        tree_node::set_key_count(&mut parent, key_count - 1);
        self.insert_in_internal(parent, parent_id, key_pos, splitter, right_child)
    }

    // Drops the key at `key_pos` together with the child to its right
    fn remove_from_internal(
        &self,
        parent: PageCursor<'a>,
        parent_id: PageId,
        key_pos: usize,
    ) -> Result<Propagation> {
        let (mut parent, parent_id) = self.make_writable(parent, parent_id)?;
        let key_count = tree_node::key_count(&mut parent);
        self.node
            .remove_key_and_right_child_at(&mut parent, key_pos, key_count);
        tree_node::set_key_count(&mut parent, key_count - 1);
        Self::check(&mut parent)?;
        Ok(Propagation::unchanged(parent_id))
    }

    // Grows a new root on a root split and collapses internal roots left without keys
    fn finish_root(&self, root: &mut Root, result: Propagation) -> Result {
        if result.id != root.id {
            *root = Root {
                id: result.id,
                generation: self.generation.unstable(),
            };
        }

        if let Some((splitter, right)) = result.split {
            let new_root = self.ids.acquire_new_id(self.generation)?;
            let mut cursor = self.file.write_cursor();
            cursor.next(new_root)?;
            self.node.initialize_internal(&mut cursor, self.generation)?;
            self.node
                .write_new_child_at(&mut cursor, root.id, 0, self.generation)?;
            self.node.insert_key_and_right_child_at(
                &mut cursor,
                &splitter,
                right,
                0,
                0,
                self.generation,
            )?;
            tree_node::set_key_count(&mut cursor, 1);
            Self::check(&mut cursor)?;
            #[cfg(feature = "logging")]
            debug!("Root split: {} and {} under new root {}", root.id, right, new_root);
            *root = Root {
                id: new_root,
                generation: self.generation.unstable(),
            };
            return Ok(());
        }

        loop {
            let (mut cursor, node_type) = self.open_node(root.id)?;
            if node_type == NodeType::Leaf || tree_node::key_count(&mut cursor) > 0 {
                return Ok(());
            }
            let child = self.node.child_at(&mut cursor, 0, self.generation)?.pointer;
            drop(cursor);
            #[cfg(feature = "logging")]
            debug!("Root {} collapsed onto {}", root.id, child);
            self.ids.release_id(self.generation, root.id)?;
            *root = Root {
                id: child,
                generation: self.generation.unstable(),
            };
        }
    }
}
