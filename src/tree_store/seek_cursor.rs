use crate::tree_store::gen_safe_pointer::{PointerFailure, PointerRead, NO_NODE};
use crate::tree_store::generation::Generation;
use crate::tree_store::page_store::{PageCursor, PageId, PagedFile};
use crate::tree_store::tree_logic::TreeRoot;
use crate::tree_store::tree_node::{self, child_position, KeyComparator, NodeType, TreeNode};
use crate::{Error, Result};
#[cfg(feature = "logging")]
use log::warn;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Bound;

// Deeper than any tree with 48 bit page ids can be, plus successor hops
const MAX_HOPS: usize = 128;

enum Next {
    Root,
    // A right sibling pointer read from the previous leaf
    Leaf {
        id: PageId,
        pointer_generation: u64,
        generation: Generation,
    },
    Done,
}

enum Attempt {
    Loaded,
    Restart(String),
}

// One consistent read of a node
enum Snapshot {
    Invalid(String),
    Successor(PointerRead),
    Leaf {
        generation: u64,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        right: std::result::Result<PointerRead, PointerFailure>,
    },
    Internal {
        generation: u64,
        child: std::result::Result<PointerRead, PointerFailure>,
    },
}

/// Reader over a key range.
///
/// Leaves are read whole into a buffer, one at a time. Anything that looks inconsistent, a page
/// changed under the read, a reused page or an unreadable pointer, makes the seek start over from
/// the current root, continuing after the last key it returned.
pub(crate) struct SeekCursor<'a> {
    file: &'a PagedFile,
    node: &'a dyn TreeNode,
    compare: KeyComparator,
    roots: &'a RwLock<TreeRoot>,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    retry_limit: u64,
    last_key: Option<Vec<u8>>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    next: Next,
}

impl<'a> SeekCursor<'a> {
    pub(crate) fn new(
        file: &'a PagedFile,
        node: &'a dyn TreeNode,
        compare: KeyComparator,
        roots: &'a RwLock<TreeRoot>,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
        retry_limit: u64,
    ) -> Self {
        Self {
            file,
            node,
            compare,
            roots,
            start,
            end,
            retry_limit,
            last_key: None,
            buffer: VecDeque::new(),
            next: Next::Root,
        }
    }

    pub(crate) fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if let Some((key, value)) = self.buffer.pop_front() {
                self.last_key = Some(key.clone());
                return Ok(Some((key, value)));
            }
            if matches!(self.next, Next::Done) {
                return Ok(None);
            }
            self.load_next_leaf()?;
        }
    }

    fn load_next_leaf(&mut self) -> Result {
        let mut restarts = 0;
        loop {
            match self.try_load_next_leaf()? {
                Attempt::Loaded => return Ok(()),
                Attempt::Restart(reason) => {
                    restarts += 1;
                    if restarts > self.retry_limit {
                        #[cfg(feature = "logging")]
                        warn!("Seek gave up after {} restarts: {}", self.retry_limit, reason);
                        return Err(Error::TreeInconsistency(format!(
                            "seek gave up after {} restarts: {}",
                            self.retry_limit, reason
                        )));
                    }
                    self.next = Next::Root;
                }
            }
        }
    }

    // The key to descend towards from the root
    fn descent_key(&self) -> Option<Vec<u8>> {
        if let Some(last) = &self.last_key {
            return Some(last.clone());
        }
        match &self.start {
            Bound::Included(key) | Bound::Excluded(key) => Some(key.clone()),
            Bound::Unbounded => None,
        }
    }

    fn after_start(&self, key: &[u8]) -> bool {
        if let Some(last) = &self.last_key {
            return (self.compare)(key, last) == Ordering::Greater;
        }
        match &self.start {
            Bound::Included(start) => (self.compare)(key, start) != Ordering::Less,
            Bound::Excluded(start) => (self.compare)(key, start) == Ordering::Greater,
            Bound::Unbounded => true,
        }
    }

    fn before_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => (self.compare)(key, end) != Ordering::Greater,
            Bound::Excluded(end) => (self.compare)(key, end) == Ordering::Less,
            Bound::Unbounded => true,
        }
    }

    fn try_load_next_leaf(&mut self) -> Result<Attempt> {
        let (mut id, mut pointer_generation, generation) = match self.next {
            Next::Done => return Ok(Attempt::Loaded),
            Next::Leaf {
                id,
                pointer_generation,
                generation,
            } => (id, pointer_generation, generation),
            Next::Root => {
                let current = *self.roots.read();
                (
                    current.root.id,
                    current.root.generation,
                    current.generation,
                )
            }
        };
        let key = self.descent_key();
        let mut cursor = self.file.read_cursor();

        for _ in 0..MAX_HOPS {
            if id == NO_NODE {
                return Ok(Attempt::Restart("pointer to no node".to_string()));
            }
            cursor.next(id)?;
            let snapshot = loop {
                let snapshot = self.snapshot(&mut cursor, generation, key.as_deref())?;
                if !cursor.should_retry() {
                    break snapshot;
                }
            };

            match snapshot {
                Snapshot::Invalid(reason) => {
                    return Ok(Attempt::Restart(format!("page {}: {}", id, reason)));
                }
                Snapshot::Successor(successor) => {
                    id = successor.pointer;
                    pointer_generation = successor.generation;
                }
                Snapshot::Internal {
                    generation: node_generation,
                    child,
                } => {
                    if node_generation > pointer_generation {
                        return Ok(Attempt::Restart(format!("page {} was reused", id)));
                    }
                    match child {
                        Ok(child) => {
                            id = child.pointer;
                            pointer_generation = child.generation;
                        }
                        Err(failure) => {
                            return Ok(Attempt::Restart(format!("page {}: {}", id, failure)));
                        }
                    }
                }
                Snapshot::Leaf {
                    generation: node_generation,
                    entries,
                    right,
                } => {
                    if node_generation > pointer_generation {
                        return Ok(Attempt::Restart(format!("page {} was reused", id)));
                    }
                    let right = match right {
                        Ok(right) => right,
                        Err(failure) => {
                            return Ok(Attempt::Restart(format!("page {}: {}", id, failure)));
                        }
                    };
                    let mut reached_end = false;
                    for (key, value) in entries {
                        if !self.before_end(&key) {
                            reached_end = true;
                            break;
                        }
                        if self.after_start(&key) {
                            self.buffer.push_back((key, value));
                        }
                    }
                    self.next = if reached_end || right.pointer == NO_NODE {
                        Next::Done
                    } else {
                        Next::Leaf {
                            id: right.pointer,
                            pointer_generation: right.generation,
                            generation,
                        }
                    };
                    return Ok(Attempt::Loaded);
                }
            }
        }

        Ok(Attempt::Restart(format!(
            "no leaf within {} hops",
            MAX_HOPS
        )))
    }

    fn snapshot(
        &self,
        cursor: &mut PageCursor,
        generation: Generation,
        key: Option<&[u8]>,
    ) -> Result<Snapshot> {
        if !tree_node::is_node(cursor) {
            return Ok(Snapshot::Invalid("not a tree node".to_string()));
        }
        if let Ok(successor) = tree_node::successor(cursor, generation) {
            if successor.pointer != NO_NODE {
                return Ok(Snapshot::Successor(successor));
            }
        }
        let node_generation = tree_node::generation(cursor);
        let key_count = tree_node::key_count(cursor);
        let Some(node_type) = tree_node::tree_node_type(cursor) else {
            return Ok(Snapshot::Invalid("unknown tree node type".to_string()));
        };
        if !self.node.reasonable_key_count(key_count, node_type) {
            return Ok(Snapshot::Invalid(format!(
                "unreasonable key count {}",
                key_count
            )));
        }

        let snapshot = match node_type {
            NodeType::Leaf => {
                let mut entries = Vec::with_capacity(key_count);
                for pos in 0..key_count {
                    entries.push(self.node.key_value_at(cursor, pos)?);
                }
                Snapshot::Leaf {
                    generation: node_generation,
                    entries,
                    right: tree_node::right_sibling(cursor, generation),
                }
            }
            NodeType::Internal => {
                let pos = match key {
                    Some(key) => {
                        let (pos, found) = tree_node::search(
                            self.node,
                            cursor,
                            NodeType::Internal,
                            key,
                            key_count,
                            self.compare,
                        )?;
                        child_position(pos, found)
                    }
                    None => 0,
                };
                Snapshot::Internal {
                    generation: node_generation,
                    child: self.node.child_at(cursor, pos, generation),
                }
            }
        };

        if cursor.check_and_clear_bounds_flag() {
            return Ok(Snapshot::Invalid("read out of bounds".to_string()));
        }
        if let Err(err) = cursor.check_and_clear_cursor_exception() {
            return Ok(Snapshot::Invalid(err.to_string()));
        }
        Ok(snapshot)
    }
}
