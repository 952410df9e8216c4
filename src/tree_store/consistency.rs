use crate::tree_store::free_list::FreeListIdProvider;
use crate::tree_store::gen_safe_pointer::NO_NODE;
use crate::tree_store::generation::Generation;
use crate::tree_store::page_store::{PageCursor, PageId, PagedFile};
use crate::tree_store::tree_logic::Root;
use crate::tree_store::tree_node::{self, KeyComparator, NodeType, TreeNode, NODE_TYPE_OFFLOAD};
use crate::tree_store::MIN_TREE_NODE_ID;
use crate::Result;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

const MAX_TREE_HEIGHT: usize = 64;

/// Page and entry counts of a tree
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeStats {
    pub(crate) tree_height: usize,
    pub(crate) leaf_pages: u64,
    pub(crate) internal_pages: u64,
    pub(crate) entries: u64,
    pub(crate) live_bytes: u64,
    pub(crate) dead_bytes: u64,
    pub(crate) free_pages: u64,
    pub(crate) free_list_pages: u64,
    pub(crate) offload_pages: u64,
    pub(crate) leaked_offload_pages: u64,
    pub(crate) allocated_pages: u64,
    pub(crate) page_size: usize,
}

impl TreeStats {
    /// Number of levels from the root down to the leaves. A tree holding a single leaf has height 1
    pub fn tree_height(&self) -> usize {
        self.tree_height
    }

    pub fn leaf_pages(&self) -> u64 {
        self.leaf_pages
    }

    pub fn internal_pages(&self) -> u64 {
        self.internal_pages
    }

    /// Number of key-value pairs in the leaves
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Bytes of tree nodes taken by live entries and their slots, offload records excluded
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Bytes of removed entries still occupying dynamic nodes until they are defragmented
    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes
    }

    /// Number of released pages waiting in the free list, including ones not yet reusable
    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    /// Number of pages the free list itself occupies
    pub fn free_list_pages(&self) -> u64 {
        self.free_list_pages
    }

    /// Number of pages holding offload records of live entries
    pub fn offload_pages(&self) -> u64 {
        self.offload_pages
    }

    /// Number of offload pages nothing references any more.
    ///
    /// Records of removed or rewritten entries are not reclaimed, so this only grows.
    pub fn leaked_offload_pages(&self) -> u64 {
        self.leaked_offload_pages
    }

    /// Number of pages the file has ever handed out, reserved pages included
    pub fn allocated_pages(&self) -> u64 {
        self.allocated_pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Result of a full consistency check
#[derive(Clone, Debug, Default)]
pub struct ConsistencyReport {
    problems: Vec<String>,
    stats: TreeStats,
}

impl ConsistencyReport {
    /// True if no problem was found
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }

    /// Human readable description of every problem found
    pub fn problems(&self) -> &[String] {
        &self.problems
    }

    /// Counts gathered while walking the tree
    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    fn problem(&mut self, message: String) {
        #[cfg(feature = "logging")]
        log::warn!("Consistency problem: {}", message);
        self.problems.push(message);
    }
}

impl Display for ConsistencyReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.problems.is_empty() {
            return write!(f, "consistent");
        }
        writeln!(f, "{} problem(s):", self.problems.len())?;
        for problem in &self.problems {
            writeln!(f, "  {}", problem)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Owner {
    Reserved,
    TreeNode,
    Offload,
    FreeListPage,
    FreeId,
}

// A node waiting to be visited, with the key range its parent allows for it
struct Pending {
    id: PageId,
    pointer_generation: u64,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
}

// What a visited node says about its neighbours
struct Visited {
    id: PageId,
    node_type: Option<NodeType>,
    left: Option<PageId>,
    right: Option<PageId>,
}

/// Walks a whole tree and the free list, verifying structure and page accounting.
///
/// Must run while no writer modifies the tree.
pub(crate) struct ConsistencyChecker<'a> {
    file: &'a PagedFile,
    node: &'a dyn TreeNode,
    ids: &'a FreeListIdProvider,
    compare: KeyComparator,
    generation: Generation,
    owners: HashMap<PageId, Owner>,
    report: ConsistencyReport,
}

impl<'a> ConsistencyChecker<'a> {
    pub(crate) fn new(
        file: &'a PagedFile,
        node: &'a dyn TreeNode,
        ids: &'a FreeListIdProvider,
        compare: KeyComparator,
        generation: Generation,
    ) -> Self {
        Self {
            file,
            node,
            ids,
            compare,
            generation,
            owners: HashMap::new(),
            report: ConsistencyReport::default(),
        }
    }

    pub(crate) fn check(mut self, root: Root) -> Result<ConsistencyReport> {
        let last_id = self.ids.last_id();
        self.report.stats.page_size = self.file.page_size();
        self.report.stats.allocated_pages = last_id + 1;
        for id in 0..MIN_TREE_NODE_ID {
            self.claim(id, Owner::Reserved);
        }

        self.check_tree(root, last_id)?;

        for page in self.ids.free_list_pages()? {
            self.claim(page, Owner::FreeListPage);
            self.report.stats.free_list_pages += 1;
        }
        for id in self.ids.free_ids()? {
            if id < MIN_TREE_NODE_ID || id > last_id {
                self.report
                    .problem(format!("free id {} is outside [{}, {}]", id, MIN_TREE_NODE_ID, last_id));
            }
            self.claim(id, Owner::FreeId);
            self.report.stats.free_pages += 1;
        }

        let mut cursor = self.file.read_cursor();
        for id in MIN_TREE_NODE_ID..=last_id {
            if self.owners.contains_key(&id) {
                continue;
            }
            cursor.next(id)?;
            if tree_node::node_type(&mut cursor) == NODE_TYPE_OFFLOAD {
                self.report.stats.leaked_offload_pages += 1;
            } else {
                self.report
                    .problem(format!("page {} is neither reachable nor free", id));
            }
        }

        Ok(self.report)
    }

    // Records who owns `id`. Returns false if some other structure already claimed it
    fn claim(&mut self, id: PageId, owner: Owner) -> bool {
        match self.owners.insert(id, owner) {
            None => true,
            Some(previous) => {
                self.owners.insert(id, previous);
                self.report.problem(format!(
                    "page {} is used as {:?} and as {:?}",
                    id, previous, owner
                ));
                false
            }
        }
    }

    fn check_tree(&mut self, root: Root, last_id: PageId) -> Result {
        let mut level = vec![Pending {
            id: root.id,
            pointer_generation: root.generation,
            lower: None,
            upper: None,
        }];
        let mut leaf_level_seen = false;

        while !level.is_empty() {
            if leaf_level_seen {
                self.report
                    .problem("nodes were found below the leaf level".to_string());
                break;
            }
            self.report.stats.tree_height += 1;
            if self.report.stats.tree_height > MAX_TREE_HEIGHT {
                self.report.problem("tree is implausibly deep".to_string());
                break;
            }

            let mut next_level = vec![];
            let mut visited = vec![];
            for pending in level {
                if pending.id < MIN_TREE_NODE_ID || pending.id > last_id {
                    self.report.problem(format!(
                        "child pointer {} is outside [{}, {}]",
                        pending.id, MIN_TREE_NODE_ID, last_id
                    ));
                    continue;
                }
                if !self.claim(pending.id, Owner::TreeNode) {
                    continue;
                }
                let mut cursor = self.file.read_cursor();
                cursor.next(pending.id)?;
                let node = self.check_node(&mut cursor, &pending, &mut next_level)?;
                visited.push(node);
            }

            let types: Vec<Option<NodeType>> = visited.iter().map(|v| v.node_type).collect();
            if types.iter().all(|t| *t == Some(NodeType::Leaf)) {
                leaf_level_seen = true;
            } else if types.iter().any(|t| *t == Some(NodeType::Leaf)) {
                self.report.problem(format!(
                    "leaves and internal nodes are mixed at depth {}",
                    self.report.stats.tree_height
                ));
            }
            self.check_siblings(&visited);
            level = next_level;
        }

        Ok(())
    }

    fn check_node(
        &mut self,
        cursor: &mut PageCursor,
        pending: &Pending,
        next_level: &mut Vec<Pending>,
    ) -> Result<Visited> {
        let id = pending.id;
        let mut visited = Visited {
            id,
            node_type: None,
            left: None,
            right: None,
        };

        if !tree_node::is_node(cursor) {
            self.report
                .problem(format!("page {} is reachable but not a tree node", id));
            return Ok(visited);
        }
        if tree_node::layout_marker(cursor) != self.node.layout().marker() {
            self.report
                .problem(format!("node {} has the wrong layout marker", id));
            return Ok(visited);
        }
        let node_type = match tree_node::tree_node_type(cursor) {
            Some(node_type) => node_type,
            None => {
                self.report
                    .problem(format!("node {} is neither leaf nor internal", id));
                return Ok(visited);
            }
        };
        visited.node_type = Some(node_type);

        let generation = tree_node::generation(cursor);
        if generation > pending.pointer_generation {
            self.report.problem(format!(
                "node {} has generation {} but was pointed to at generation {}",
                id, generation, pending.pointer_generation
            ));
        }
        if generation > self.generation.unstable() {
            self.report.problem(format!(
                "node {} has generation {} beyond unstable {}",
                id,
                generation,
                self.generation.unstable()
            ));
        }
        match tree_node::successor(cursor, self.generation) {
            Ok(read) if read.pointer != NO_NODE => self
                .report
                .problem(format!("node {} reachable from the root has a successor", id)),
            Ok(_) => {}
            Err(failure) => self
                .report
                .problem(format!("node {} successor: {}", id, failure)),
        }
        match tree_node::left_sibling(cursor, self.generation) {
            Ok(read) => visited.left = Some(read.pointer),
            Err(failure) => self
                .report
                .problem(format!("node {} left sibling: {}", id, failure)),
        }
        match tree_node::right_sibling(cursor, self.generation) {
            Ok(read) => visited.right = Some(read.pointer),
            Err(failure) => self
                .report
                .problem(format!("node {} right sibling: {}", id, failure)),
        }

        let key_count = tree_node::key_count(cursor);
        if !self.node.reasonable_key_count(key_count, node_type) {
            self.report
                .problem(format!("node {} has unreasonable key count {}", id, key_count));
            return Ok(visited);
        }
        if let Some(message) = self.node.check_meta_consistency(cursor, key_count, node_type) {
            self.report.problem(format!("node {}: {}", id, message));
            return Ok(visited);
        }
        let space = self.node.space(cursor, key_count, node_type);
        self.report.stats.live_bytes += space.active as u64;
        self.report.stats.dead_bytes += space.dead as u64;

        let mut keys = Vec::with_capacity(key_count);
        for pos in 0..key_count {
            keys.push(self.node.key_at(cursor, pos, node_type)?);
        }
        cursor.check_and_clear_cursor_exception()?;
        self.check_keys(id, &keys, pending);

        for record in self.node.offload_ids(cursor, key_count, node_type) {
            for page in self.node.offload_chain_pages(cursor, record)? {
                if self.claim(page, Owner::Offload) {
                    self.report.stats.offload_pages += 1;
                }
            }
        }

        match node_type {
            NodeType::Leaf => {
                self.report.stats.leaf_pages += 1;
                self.report.stats.entries += key_count as u64;
            }
            NodeType::Internal => {
                self.report.stats.internal_pages += 1;
                for pos in 0..=key_count {
                    match self.node.child_at(cursor, pos, self.generation) {
                        Ok(child) => next_level.push(Pending {
                            id: child.pointer,
                            pointer_generation: child.generation,
                            lower: if pos == 0 {
                                pending.lower.clone()
                            } else {
                                Some(keys[pos - 1].clone())
                            },
                            upper: if pos == key_count {
                                pending.upper.clone()
                            } else {
                                Some(keys[pos].clone())
                            },
                        }),
                        Err(failure) => self
                            .report
                            .problem(format!("node {} child {}: {}", id, pos, failure)),
                    }
                }
            }
        }

        if cursor.check_and_clear_bounds_flag() {
            self.report
                .problem(format!("node {} has reads outside its page", id));
        }
        Ok(visited)
    }

    fn check_keys(&mut self, id: PageId, keys: &[Vec<u8>], pending: &Pending) {
        for pair in keys.windows(2) {
            if (self.compare)(&pair[0], &pair[1]) != Ordering::Less {
                self.report
                    .problem(format!("keys of node {} are not strictly ascending", id));
                break;
            }
        }
        if let (Some(lower), Some(first)) = (&pending.lower, keys.first()) {
            if (self.compare)(first, lower) == Ordering::Less {
                self.report.problem(format!(
                    "node {} has a key below the splitter of its parent",
                    id
                ));
            }
        }
        if let (Some(upper), Some(last)) = (&pending.upper, keys.last()) {
            if (self.compare)(last, upper) != Ordering::Less {
                self.report.problem(format!(
                    "node {} has a key at or above the splitter of its parent",
                    id
                ));
            }
        }
    }

    // Each level must form a doubly linked chain in key order
    fn check_siblings(&mut self, level: &[Visited]) {
        for (i, node) in level.iter().enumerate() {
            let expected_left = if i == 0 { NO_NODE } else { level[i - 1].id };
            let expected_right = level.get(i + 1).map_or(NO_NODE, |next| next.id);
            if let Some(left) = node.left {
                if left != expected_left {
                    self.report.problem(format!(
                        "node {} has left sibling {} but {} precedes it",
                        node.id, left, expected_left
                    ));
                }
            }
            if let Some(right) = node.right {
                if right != expected_right {
                    self.report.problem(format!(
                        "node {} has right sibling {} but {} follows it",
                        node.id, right, expected_right
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::tree_store::consistency::ConsistencyChecker;
    use crate::tree_store::free_list::{FreeListIdProvider, IdProvider};
    use crate::tree_store::generation::Generation;
    use crate::tree_store::page_store::PagedFile;
    use crate::tree_store::tree_logic::{Root, TreeLogic};
    use crate::tree_store::tree_node::{self, NodeType, TreeNode};
    use crate::tree_store::tree_node_dynamic::TreeNodeDynamicSize;
    use crate::tree_store::tree_node_fixed::TreeNodeFixedSize;
    use crate::InMemoryBackend;
    use std::sync::Arc;

    fn compare(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        a.cmp(b)
    }

    fn build(
        node: &dyn TreeNode,
        file: &PagedFile,
        ids: &FreeListIdProvider,
        count: u64,
        value_len: usize,
    ) -> Root {
        let logic = TreeLogic::new(file, node, ids, compare, Generation::initial());
        let mut root = logic.initialize_root(3).unwrap();
        for i in 0..count {
            logic
                .insert(&mut root, &i.to_be_bytes(), &vec![i as u8; value_len])
                .unwrap();
        }
        root
    }

    #[test]
    fn healthy_tree_is_consistent() {
        let file = Arc::new(PagedFile::new(Box::new(InMemoryBackend::new()), 512));
        let ids = Arc::new(FreeListIdProvider::create(file.clone(), 3).unwrap());
        let node = TreeNodeFixedSize::new(512, 8, 8).unwrap();
        let root = build(&node, &file, &ids, 1000, 8);

        let report = ConsistencyChecker::new(&file, &node, &ids, compare, Generation::initial())
            .check(root)
            .unwrap();
        assert!(report.is_consistent(), "{}", report);
        let stats = report.stats();
        assert_eq!(stats.entries(), 1000);
        assert!(stats.tree_height() >= 2);
        assert_eq!(stats.offload_pages(), 0);
        assert_eq!(
            stats.leaf_pages() + stats.internal_pages() + stats.free_list_pages() + 3,
            stats.allocated_pages()
        );
        assert!(stats.live_bytes() >= 1000 * 16);
        assert_eq!(stats.dead_bytes(), 0);
    }

    #[test]
    fn removed_entries_count_as_dead_bytes() {
        let file = Arc::new(PagedFile::new(Box::new(InMemoryBackend::new()), 512));
        let ids = Arc::new(FreeListIdProvider::create(file.clone(), 3).unwrap());
        let node = TreeNodeDynamicSize::new(512, ids.clone()).unwrap();
        let generation = Generation::initial();
        let mut root = build(&node, &file, &ids, 10, 4);
        let check = |root: Root| {
            ConsistencyChecker::new(&file, &node, &ids, compare, generation)
                .check(root)
                .unwrap()
        };

        let before = check(root);
        assert!(before.is_consistent(), "{}", before);
        assert_eq!(before.stats().tree_height(), 1);
        assert_eq!(before.stats().dead_bytes(), 0);

        let logic = TreeLogic::new(&file, &node, &*ids, compare, generation);
        assert!(logic.remove(&mut root, &3u64.to_be_bytes()).unwrap().is_some());
        let after = check(root);
        assert!(after.is_consistent(), "{}", after);
        assert_eq!(after.stats().entries(), 9);
        assert!(after.stats().dead_bytes() > 0);
        assert!(after.stats().live_bytes() < before.stats().live_bytes());
        assert_eq!(
            before.stats().live_bytes(),
            after.stats().live_bytes() + after.stats().dead_bytes() + 2
        );
    }

    #[test]
    fn offload_pages_are_accounted() {
        let file = Arc::new(PagedFile::new(Box::new(InMemoryBackend::new()), 512));
        let ids = Arc::new(FreeListIdProvider::create(file.clone(), 3).unwrap());
        let node = TreeNodeDynamicSize::new(512, ids.clone()).unwrap();
        let root = build(&node, &file, &ids, 20, 400);

        let report = ConsistencyChecker::new(&file, &node, &ids, compare, Generation::initial())
            .check(root)
            .unwrap();
        assert!(report.is_consistent(), "{}", report);
        assert!(report.stats().offload_pages() > 0);
        assert_eq!(report.stats().leaked_offload_pages(), 0);
        assert_eq!(report.stats().entries(), 20);
    }

    #[test]
    fn detects_unaccounted_and_broken_pages() {
        let file = Arc::new(PagedFile::new(Box::new(InMemoryBackend::new()), 512));
        let ids = Arc::new(FreeListIdProvider::create(file.clone(), 3).unwrap());
        let node = TreeNodeFixedSize::new(512, 8, 8).unwrap();
        let generation = Generation::initial();
        let root = build(&node, &file, &ids, 200, 8);

        // Allocated but never linked anywhere
        let orphan = ids.acquire_new_id(generation).unwrap();
        {
            let mut cursor = file.write_cursor();
            cursor.next(orphan).unwrap();
            node.initialize_leaf(&mut cursor, generation).unwrap();
        }
        let report = ConsistencyChecker::new(&file, &node, &ids, compare, generation)
            .check(root)
            .unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.problems().len(), 1);
        assert!(report.problems()[0].contains(&orphan.to_string()));

        // Released while still reachable
        ids.release_id(generation, orphan).unwrap();
        ids.release_id(generation, root.id).unwrap();
        let report = ConsistencyChecker::new(&file, &node, &ids, compare, generation)
            .check(root)
            .unwrap();
        assert_eq!(report.problems().len(), 1);
        assert!(report.problems()[0].contains("FreeId"));

        // Keys out of order in the leftmost leaf
        let mut leaf = root.id;
        {
            let mut cursor = file.read_cursor();
            loop {
                cursor.next(leaf).unwrap();
                if tree_node::tree_node_type(&mut cursor) == Some(NodeType::Leaf) {
                    break;
                }
                leaf = node.child_at(&mut cursor, 0, generation).unwrap().pointer;
            }
        }
        {
            let mut cursor = file.write_cursor();
            cursor.next(leaf).unwrap();
            let count = tree_node::key_count(&mut cursor);
            node.remove_key_value_at(&mut cursor, 0, count);
            node.insert_key_value_at(
                &mut cursor,
                &u64::MAX.to_be_bytes(),
                &[0; 8],
                0,
                count - 1,
                generation,
            )
            .unwrap();
        }
        let report = ConsistencyChecker::new(&file, &node, &ids, compare, generation)
            .check(root)
            .unwrap();
        assert!(report
            .problems()
            .iter()
            .any(|problem| problem.contains("not strictly ascending")));
    }
}
