mod consistency;
mod crash_cleaner;
mod dynamic_size;
mod free_list;
mod gen_safe_pointer;
mod generation;
mod offload;
mod page_store;
mod seek_cursor;
mod tree_logic;
mod tree_node;
mod tree_node_dynamic;
mod tree_node_fixed;
mod tree_state;

pub use consistency::{ConsistencyReport, TreeStats};
pub(crate) use consistency::ConsistencyChecker;
pub(crate) use crash_cleaner::clean_crash_generations;
pub(crate) use free_list::FreeListIdProvider;
pub(crate) use generation::Generation;
pub use page_store::{FileBackend, InMemoryBackend, StorageBackend};
#[cfg(unix)]
pub use page_store::MmapBackend;
pub(crate) use page_store::{PageId, PagedFile};
pub(crate) use seek_cursor::SeekCursor;
pub(crate) use tree_logic::{Root, TreeLogic, TreeRoot};
pub use tree_node::NodeLayout;
pub(crate) use tree_node::TreeNode;
pub(crate) use tree_node_dynamic::TreeNodeDynamicSize;
pub(crate) use tree_node_fixed::TreeNodeFixedSize;
pub(crate) use tree_state::{other_slot, TreeMeta, TreeState, STATE_PAGE_B};

/// Largest key a tree accepts, bounded by the dynamic entry header
pub(crate) const MAX_KEY_SIZE: usize = dynamic_size::MAX_TWO_BYTE_KEY_SIZE;
/// Largest value a tree accepts, bounded by the dynamic entry header
pub(crate) const MAX_VALUE_SIZE: usize = dynamic_size::MAX_TWO_BYTE_VALUE_SIZE;
/// Ids below this are the meta page and the two state pages
pub(crate) const MIN_TREE_NODE_ID: PageId = 3;
