//! # mdevent - Adaptive Multi-Dimensional Event Index
//!
//! This crate stores large collections of `ND`-dimensional events (a
//! coordinate vector with a signal and squared error) in an adaptive box tree
//! and answers point, region and binning queries over them.
//!
//! ## Features
//!
//! - **Adaptive Splitting**: Over-full leaves become regular grids or binary splits
//! - **Two-Phase Build**: Bulk insertion first, one explicit split pass after
//! - **Parallel Passes**: Split, refresh and bulk insert fan out over a worker pool
//! - **Cached Aggregates**: Signal, error and count summed bottom-up on refresh
//! - **Masking**: Reversible exclusion of leaves from signal queries
//! - **Paging**: Leaf events evicted to a file under an LRU memory budget
//!
//! ## Quick Start
//!
//! ```rust
//! use mdevent::{BoxControllerConfig, BoxExtents, Event, MdEventTree};
//!
//! # fn main() -> Result<(), mdevent::MdError> {
//! let extents = [BoxExtents::new(0.0, 10.0), BoxExtents::new(0.0, 10.0)];
//! let config = BoxControllerConfig::new()
//!     .split_into(vec![10])
//!     .split_thresholds(vec![5]);
//! let mut tree = MdEventTree::new(extents, config)?;
//!
//! tree.insert_batch(&[
//!     Event::new([1.5, 2.5], 2.0, 4.0),
//!     Event::new([7.0, 3.0], 1.0, 1.0),
//! ])?;
//! tree.split_all(None)?;
//! let total = tree.refresh()?;
//! assert_eq!(total.count, 2);
//!
//! let (signal, _error_squared) = tree.bin_range(&[0.0, 0.0], &[5.0, 5.0])?;
//! assert_eq!(signal, 2.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## File-Backed Trees
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mdevent::{BoxController, BoxControllerConfig, BoxExtents, FileEventStorage, MdEventTree};
//!
//! # fn main() -> Result<(), mdevent::MdError> {
//! let storage = Arc::new(FileEventStorage::create("/tmp/events.bin")?);
//! let config = BoxControllerConfig::new().leaf_cache_bytes(256 * 1024 * 1024);
//! let controller = BoxController::new(3, config)?.with_file_backend(storage);
//! let extents = [BoxExtents::new(-1.0, 1.0); 3];
//! let mut tree = MdEventTree::with_controller(extents, Arc::new(controller))?;
//! // insert, split and query as usual; cold leaves are paged out
//! tree.flush()?;
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod disk;
pub mod errors;
pub mod event;
pub mod extents;
pub mod md_box;
pub mod region;
pub mod scheduler;
pub mod workspace;

pub use controller::{
    BoxController, BoxControllerConfig, SplitPolicy, DEFAULT_LEAF_CACHE_BYTES,
    DEFAULT_MEMORY_LIMIT_BYTES, MAX_SUPPORTED_DEPTH,
};
pub use disk::{
    BoxId, EventBlock, FileBackend, FileEventStorage, FileOffset, LeafCache, StorageStats,
    DEFAULT_WRITE_BUFFER_BYTES,
};
pub use errors::{MdError, MdResult};
pub use event::Event;
pub use extents::BoxExtents;
pub use md_box::{partition_for_iterators, BoxNode, BoxSignal, NodeKind};
pub use region::{BoxContact, Plane, RegionPredicate};
pub use scheduler::{TaskScheduler, TaskScope};
pub use workspace::{MdEventTree, TreeStats};
