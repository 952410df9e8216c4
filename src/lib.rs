//! A generational, crash-safe B+Tree persisted on fixed-size pages.
//!
//! Every page pointer is stored twice, tagged with the generation it was written at. Writes after
//! the last checkpoint go to copies of the pages the checkpoint can reach, so the file always holds
//! a complete tree as of that checkpoint, and readers run concurrently with the single writer.

pub use error::Error;
pub use tree::{GBPTree, SeekIter, TreeBuilder, Writer};
#[cfg(unix)]
pub use tree_store::MmapBackend;
pub use tree_store::{
    ConsistencyReport, FileBackend, InMemoryBackend, NodeLayout, StorageBackend, TreeStats,
};
pub use types::{Key, TypeName, Value};

type Result<T = (), E = Error> = std::result::Result<T, E>;

mod error;
mod tree;
mod tree_store;
mod types;
