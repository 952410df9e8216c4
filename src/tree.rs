use crate::tree_store::{
    clean_crash_generations, other_slot, ConsistencyChecker, ConsistencyReport, FreeListIdProvider,
    Generation, NodeLayout, PageId, PagedFile, Root, SeekCursor, TreeLogic, TreeMeta, TreeNode,
    TreeNodeDynamicSize, TreeNodeFixedSize, TreeRoot, TreeState, TreeStats, MIN_TREE_NODE_ID,
    STATE_PAGE_B,
};
use crate::types::{Key, Value};
use crate::{Error, FileBackend, Result, StorageBackend};
#[cfg(feature = "logging")]
use log::{info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt::{Debug, Formatter};
use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

pub(crate) const MIN_PAGE_SIZE: usize = 512;
pub(crate) const MAX_PAGE_SIZE: usize = 32768;
const DEFAULT_SEEK_RETRY_LIMIT: u64 = 1_000_000;

// Owned by whoever holds the writer lock
struct WriterState {
    root: Root,
    generation: Generation,
    // Slot holding the newest persisted state
    state_slot: PageId,
}

/// A generational B+Tree stored in a single file.
///
/// One [`Writer`] at a time may modify the tree while any number of threads read it through
/// [`GBPTree::get`] and [`GBPTree::seek`]. Changes reach the file only at a [`GBPTree::checkpoint`]
/// or at [`GBPTree::close`]; dropping the tree without closing it behaves like a crash, and the
/// next open resumes from the last checkpoint.
pub struct GBPTree<K: Key, V: Value> {
    file: Arc<PagedFile>,
    node: Box<dyn TreeNode>,
    ids: Arc<FreeListIdProvider>,
    writer: Mutex<WriterState>,
    roots: RwLock<TreeRoot>,
    seek_retry_limit: u64,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K: Key, V: Value> GBPTree<K, V> {
    /// Convenience method for [`TreeBuilder::new`]
    pub fn builder() -> TreeBuilder {
        TreeBuilder::new()
    }

    /// Creates a new tree at `path` with the default configuration, replacing whatever the file
    /// held before
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().create(path)
    }

    /// Opens an existing tree at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().open(path)
    }

    fn new_node(
        layout: NodeLayout,
        page_size: usize,
        ids: &Arc<FreeListIdProvider>,
    ) -> Result<Box<dyn TreeNode>> {
        match layout {
            NodeLayout::Fixed => match (K::fixed_width(), V::fixed_width()) {
                (Some(key_size), Some(value_size)) => Ok(Box::new(TreeNodeFixedSize::new(
                    page_size, key_size, value_size,
                )?)),
                _ => Err(Error::MetadataMismatch(format!(
                    "fixed layout needs fixed-width types, got {} and {}",
                    K::type_name().name(),
                    V::type_name().name()
                ))),
            },
            NodeLayout::Dynamic => Ok(Box::new(TreeNodeDynamicSize::new(page_size, ids.clone())?)),
        }
    }

    fn create_with(
        backend: Box<dyn StorageBackend>,
        page_size: usize,
        layout: NodeLayout,
        seek_retry_limit: u64,
    ) -> Result<Self> {
        backend.set_len(0)?;
        let file = Arc::new(PagedFile::new(backend, page_size));
        // The free list starts right after the root
        let ids = Arc::new(FreeListIdProvider::create(file.clone(), MIN_TREE_NODE_ID)?);
        let node = Self::new_node(layout, page_size, &ids)?;
        TreeMeta {
            layout,
            page_size,
            key_type: K::type_name(),
            value_type: V::type_name(),
        }
        .write(&file)?;

        let generation = Generation::initial();
        let root = TreeLogic::new(&file, node.as_ref(), ids.as_ref(), K::compare, generation)
            .initialize_root(MIN_TREE_NODE_ID)?;

        let tree = Self::assemble(file, node, ids, root, generation, STATE_PAGE_B, seek_retry_limit);
        tree.checkpoint_locked(&mut tree.writer.lock(), false)?;
        #[cfg(feature = "logging")]
        info!(
            "Created tree of {} -> {} with {:?} layout and page size {}",
            K::type_name().name(),
            V::type_name().name(),
            layout,
            page_size
        );
        Ok(tree)
    }

    fn open_with(
        backend: Box<dyn StorageBackend>,
        page_size: Option<usize>,
        layout: Option<NodeLayout>,
        seek_retry_limit: u64,
    ) -> Result<Self> {
        let stored_page_size = TreeMeta::read_page_size(backend.as_ref())?;
        if !stored_page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&stored_page_size)
        {
            return Err(Error::Corrupted(format!(
                "stored page size {} is not supported",
                stored_page_size
            )));
        }
        if let Some(page_size) = page_size {
            if page_size != stored_page_size {
                return Err(Error::MetadataMismatch(format!(
                    "tree has page size {} but {} was requested",
                    stored_page_size, page_size
                )));
            }
        }

        let file = Arc::new(PagedFile::new(backend, stored_page_size));
        let meta = TreeMeta::read(&file)?;
        if let Some(layout) = layout {
            if layout != meta.layout {
                return Err(Error::MetadataMismatch(format!(
                    "tree has {:?} layout but {:?} was requested",
                    meta.layout, layout
                )));
            }
        }
        if meta.key_type != K::type_name() || meta.value_type != V::type_name() {
            return Err(Error::TypeMismatch {
                key: meta.key_type,
                value: meta.value_type,
            });
        }

        let (state, slot) = TreeState::read_newest(&file)?;
        let ids = Arc::new(FreeListIdProvider::new(file.clone(), state.free_list));
        let node = Self::new_node(meta.layout, stored_page_size, &ids)?;
        let root = Root {
            id: state.root_id,
            generation: state.root_generation,
        };
        let mut generation = state.generation();
        if !state.clean {
            // Whatever the lost session wrote at its unstable generation must not survive
            generation = Generation::new(state.stable, state.unstable + 1);
            let cleaned = clean_crash_generations(&file, node.as_ref(), root, generation)?;
            #[cfg(feature = "logging")]
            warn!(
                "Tree was not closed cleanly, resumed from generation {} and cleaned {} pointer slot(s)",
                state.stable, cleaned
            );
            #[cfg(not(feature = "logging"))]
            let _ = cleaned;
        }

        let tree = Self::assemble(file, node, ids, root, generation, slot, seek_retry_limit);
        // Marks the file as in use, so a crash from here on is detected
        tree.checkpoint_locked(&mut tree.writer.lock(), false)?;
        #[cfg(feature = "logging")]
        info!(
            "Opened tree of {} -> {} at generation {}",
            K::type_name().name(),
            V::type_name().name(),
            tree.writer.lock().generation.stable()
        );
        Ok(tree)
    }

    fn assemble(
        file: Arc<PagedFile>,
        node: Box<dyn TreeNode>,
        ids: Arc<FreeListIdProvider>,
        root: Root,
        generation: Generation,
        state_slot: PageId,
        seek_retry_limit: u64,
    ) -> Self {
        Self {
            file,
            node,
            ids,
            writer: Mutex::new(WriterState {
                root,
                generation,
                state_slot,
            }),
            roots: RwLock::new(TreeRoot { root, generation }),
            seek_retry_limit,
            _types: Default::default(),
        }
    }

    /// Begins writing.
    ///
    /// Only one [`Writer`] exists at a time: this blocks until the previous one is dropped, and so
    /// do [`GBPTree::checkpoint`] and [`GBPTree::consistency_check`].
    pub fn writer(&self) -> Writer<'_, K, V> {
        Writer {
            tree: self,
            state: self.writer.lock(),
        }
    }

    fn logic(&self, generation: Generation) -> TreeLogic<'_> {
        TreeLogic::new(
            &self.file,
            self.node.as_ref(),
            self.ids.as_ref(),
            K::compare,
            generation,
        )
    }

    fn cursor(&self, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> SeekCursor<'_> {
        SeekCursor::new(
            &self.file,
            self.node.as_ref(),
            K::compare,
            &self.roots,
            start,
            end,
            self.seek_retry_limit,
        )
    }

    /// Returns the value stored for `key`
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key = key.as_bytes();
        let mut cursor = self.cursor(Bound::Included(key.clone()), Bound::Included(key));
        Ok(cursor
            .next_entry()?
            .map(|(_, value)| V::from_bytes(&value)))
    }

    /// Returns the entries within `range`, in ascending key order.
    ///
    /// The iterator sees a consistent ordering while a writer runs concurrently: keys are never
    /// repeated or returned out of order, but an entry changed during the seek may be seen in
    /// either its old or its new version.
    pub fn seek<KR: RangeBounds<K>>(&self, range: KR) -> SeekIter<'_, K, V> {
        SeekIter {
            cursor: self.cursor(
                encode_bound(range.start_bound()),
                encode_bound(range.end_bound()),
            ),
            done: false,
            _types: Default::default(),
        }
    }

    fn checkpoint_locked(&self, state: &mut WriterState, clean: bool) -> Result {
        // Everything the new state points to must be durable before the state itself
        self.file.flush()?;
        let next = state.generation.next();
        let slot = other_slot(state.state_slot);
        TreeState {
            clean,
            stable: next.stable(),
            unstable: next.unstable(),
            root_id: state.root.id,
            root_generation: state.root.generation,
            free_list: self.ids.meta_data(),
        }
        .write(&self.file, slot)?;
        self.file.flush()?;

        state.state_slot = slot;
        state.generation = next;
        *self.roots.write() = TreeRoot {
            root: state.root,
            generation: next,
        };
        Ok(())
    }

    /// Makes everything written so far durable.
    ///
    /// The current unstable generation becomes stable, and pages it released become reusable by
    /// the writes that follow.
    pub fn checkpoint(&self) -> Result {
        let mut state = self.writer.lock();
        self.checkpoint_locked(&mut state, false)?;
        #[cfg(feature = "logging")]
        info!("Checkpointed at generation {}", state.generation.stable());
        Ok(())
    }

    /// Walks every page of the tree and the free list, reporting anything inconsistent
    pub fn consistency_check(&self) -> Result<ConsistencyReport> {
        let state = self.writer.lock();
        ConsistencyChecker::new(
            &self.file,
            self.node.as_ref(),
            &self.ids,
            K::compare,
            state.generation,
        )
        .check(state.root)
    }

    pub fn stats(&self) -> Result<TreeStats> {
        Ok(*self.consistency_check()?.stats())
    }

    /// Checkpoints and marks the file as cleanly closed
    pub fn close(self) -> Result {
        let mut state = self.writer.lock();
        self.checkpoint_locked(&mut state, true)?;
        #[cfg(feature = "logging")]
        info!("Closed tree at generation {}", state.generation.stable());
        Ok(())
    }
}

impl<K: Key, V: Value> Debug for GBPTree<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let roots = self.roots.read();
        f.debug_struct("GBPTree")
            .field("key_type", &K::type_name().name())
            .field("value_type", &V::type_name().name())
            .field("layout", &self.node.layout())
            .field("page_size", &self.file.page_size())
            .field("root", &roots.root.id)
            .field("stable", &roots.generation.stable())
            .finish()
    }
}

fn encode_bound<K: Key>(bound: Bound<&K>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_bytes()),
        Bound::Excluded(key) => Bound::Excluded(key.as_bytes()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Exclusive write access to a [`GBPTree`]
pub struct Writer<'a, K: Key, V: Value> {
    tree: &'a GBPTree<K, V>,
    state: MutexGuard<'a, WriterState>,
}

impl<'a, K: Key, V: Value> Writer<'a, K, V> {
    /// Inserts or overwrites the value for `key`, returning the previous value
    pub fn insert(&mut self, key: &K, value: &V) -> Result<Option<V>> {
        let mut root = self.state.root;
        let previous = self
            .tree
            .logic(self.state.generation)
            .insert(&mut root, &key.as_bytes(), &value.as_bytes())?;
        self.publish(root);
        Ok(previous.map(|bytes| V::from_bytes(&bytes)))
    }

    /// Removes `key`, returning its value if it was present
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let mut root = self.state.root;
        let removed = self
            .tree
            .logic(self.state.generation)
            .remove(&mut root, &key.as_bytes())?;
        self.publish(root);
        Ok(removed.map(|bytes| V::from_bytes(&bytes)))
    }

    fn publish(&mut self, root: Root) {
        if root != self.state.root {
            self.state.root = root;
            self.tree.roots.write().root = root;
        }
    }
}

/// Iterator returned by [`GBPTree::seek`]. Stops after the first error
pub struct SeekIter<'a, K: Key, V: Value> {
    cursor: SeekCursor<'a>,
    done: bool,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: Key, V: Value> Iterator for SeekIter<'a, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next_entry() {
            Ok(Some((key, value))) => Some(Ok((K::from_bytes(&key), V::from_bytes(&value)))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Configuration for creating and opening a [`GBPTree`]
pub struct TreeBuilder {
    page_size: Option<usize>,
    layout: Option<NodeLayout>,
    seek_retry_limit: u64,
}

impl TreeBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            page_size: None,
            layout: None,
            seek_retry_limit: DEFAULT_SEEK_RETRY_LIMIT,
        }
    }

    /// Sets the page size. Must be a power of two between 512 and 32768.
    ///
    /// Defaults to the OS page size. When opening, a page size that was set explicitly must match
    /// the stored one.
    pub fn set_page_size(&mut self, size: usize) -> &mut Self {
        assert!(size.is_power_of_two());
        assert!((MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size));
        self.page_size = Some(size);
        self
    }

    /// Sets the node layout. [`NodeLayout::Fixed`] requires fixed-width key and value types.
    ///
    /// Defaults to fixed when both types are fixed-width and dynamic otherwise. When opening, a
    /// layout that was set explicitly must match the stored one.
    pub fn set_layout(&mut self, layout: NodeLayout) -> &mut Self {
        self.layout = Some(layout);
        self
    }

    /// Sets how many times in a row a seek may start over before giving up with
    /// [`Error::TreeInconsistency`]
    pub fn set_seek_retry_limit(&mut self, limit: u64) -> &mut Self {
        assert!(limit > 0);
        self.seek_retry_limit = limit;
        self
    }

    fn page_size_or_default(&self) -> usize {
        self.page_size.unwrap_or_else(|| {
            page_size::get()
                .next_power_of_two()
                .clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
        })
    }

    fn layout_or_default<K: Key, V: Value>(&self) -> NodeLayout {
        self.layout.unwrap_or_else(|| {
            if K::fixed_width().is_some() && V::fixed_width().is_some() {
                NodeLayout::Fixed
            } else {
                NodeLayout::Dynamic
            }
        })
    }

    /// Creates a new tree in the file at `path`, creating the file if needed and discarding its
    /// previous contents
    pub fn create<K: Key, V: Value>(&self, path: impl AsRef<Path>) -> Result<GBPTree<K, V>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        self.create_with_backend(FileBackend::new(file)?)
    }

    /// Opens the tree in the file at `path`
    pub fn open<K: Key, V: Value>(&self, path: impl AsRef<Path>) -> Result<GBPTree<K, V>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        self.open_with_backend(FileBackend::new(file)?)
    }

    /// Creates a new tree in the given backend, discarding its previous contents
    pub fn create_with_backend<K: Key, V: Value>(
        &self,
        backend: impl StorageBackend,
    ) -> Result<GBPTree<K, V>> {
        GBPTree::create_with(
            Box::new(backend),
            self.page_size_or_default(),
            self.layout_or_default::<K, V>(),
            self.seek_retry_limit,
        )
    }

    /// Opens the tree held by the given backend
    pub fn open_with_backend<K: Key, V: Value>(
        &self,
        backend: impl StorageBackend,
    ) -> Result<GBPTree<K, V>> {
        GBPTree::open_with(
            Box::new(backend),
            self.page_size,
            self.layout,
            self.seek_retry_limit,
        )
    }
}
