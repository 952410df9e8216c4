mod backends;
mod cursor;
mod file_backend;
#[cfg(unix)]
mod mmap;
mod paged_file;

pub use backends::{InMemoryBackend, StorageBackend};
pub(crate) use cursor::PageCursor;
pub use file_backend::FileBackend;
#[cfg(unix)]
pub use mmap::MmapBackend;
pub(crate) use paged_file::{PageId, PagedFile};
