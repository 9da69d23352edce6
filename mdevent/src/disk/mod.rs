//! Out-of-core storage for leaf events.
//!
//! - [`FileBackend`]: the paging interface the tree calls from leaf boxes
//! - [`FileEventStorage`]: a single-file backend with a write buffer and free list
//! - [`LeafCache`]: LRU accounting that decides which leaves to evict

pub mod file_backend;
pub mod file_storage;
pub mod leaf_cache;

pub use file_backend::{BoxId, EventBlock, FileBackend, FileOffset};
pub use file_storage::{FileEventStorage, StorageStats, DEFAULT_WRITE_BUFFER_BYTES};
pub use leaf_cache::LeafCache;
