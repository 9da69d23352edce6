//! The adaptive box tree.
//!
//! Every node is a [`BoxNode`]: a common header plus one of three payloads.
//! - Leaf boxes hold events directly, possibly partly paged to a file backend
//! - Grid boxes subdivide every dimension into equal cells
//! - Binary split boxes cut one dimension at a single point
//!
//! Leaves are replaced by interior boxes only during an explicit split pass,
//! and cached aggregates are only brought up to date by a refresh pass.

mod box_cache;
mod box_insert;
mod box_query;
mod box_split;
pub mod box_types;

pub use box_query::partition_for_iterators;
pub use box_types::{BoxNode, BoxSignal, FileSlot, GridData, LeafData, NodeKind, SplitData};
