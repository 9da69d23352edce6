//! Core node types of the box tree.
//!
//! This module defines:
//! - `BoxNode`, the common header every box carries (id, depth, extents,
//!   cached aggregates, mask flag, parent id)
//! - `NodeKind`, the variant payload (leaf, grid interior, binary split interior)
//! - Leaf paging state and the aggregate value type

use crate::controller::BoxController;
use crate::disk::{BoxId, FileBackend, FileOffset};
use crate::errors::{MdError, MdResult};
use crate::event::{flatten_events, unflatten_events, Event};
use crate::extents::{self, BoxExtents};

// ============================================================================
// Aggregates
// ============================================================================

/// Signal, squared error and event count of a box or a query result.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoxSignal {
    pub signal: f64,
    pub error_squared: f64,
    pub count: u64,
}

impl BoxSignal {
    pub fn add_event<const ND: usize>(&mut self, event: &Event<ND>) {
        self.signal += event.signal();
        self.error_squared += event.error_squared();
        self.count += 1;
    }

    /// Adds a child's aggregate. Signal and error of a masked child are
    /// left out; its events are still counted.
    pub fn add_child(&mut self, child: &BoxSignal, masked: bool) {
        if !masked {
            self.signal += child.signal;
            self.error_squared += child.error_squared;
        }
        self.count += child.count;
    }
}

// ============================================================================
// Variant payloads
// ============================================================================

/// Location of a leaf's paged events in the file backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlot {
    pub offset: FileOffset,
    pub count: u64,
}

/// Events stored directly in a leaf. Some of them may be paged out.
#[derive(Debug, Default)]
pub struct LeafData<const ND: usize> {
    pub(crate) events: Vec<Event<ND>>,
    pub(crate) file: Option<FileSlot>,
}

/// A regular grid of `split_into[d]` cells per dimension.
///
/// Children are stored with dimension 0 varying fastest.
#[derive(Debug)]
pub struct GridData<const ND: usize> {
    pub(crate) split_into: [usize; ND],
    pub(crate) children: Vec<BoxNode<ND>>,
}

/// Two children; `left` covers `coord[split_dim] < split_point`.
#[derive(Debug)]
pub struct SplitData<const ND: usize> {
    pub(crate) split_dim: usize,
    pub(crate) split_point: f64,
    pub(crate) left: Box<BoxNode<ND>>,
    pub(crate) right: Box<BoxNode<ND>>,
}

#[derive(Debug)]
pub enum NodeKind<const ND: usize> {
    Leaf(LeafData<ND>),
    Grid(GridData<ND>),
    BinarySplit(SplitData<ND>),
}

// ============================================================================
// BoxNode
// ============================================================================

/// A node of the box tree.
///
/// Cached aggregates are only correct after a refresh; inserts and splits
/// leave them stale. `parent_id` is bookkeeping only and is never followed
/// during traversal.
#[derive(Debug)]
pub struct BoxNode<const ND: usize> {
    pub(crate) id: BoxId,
    pub(crate) depth: u32,
    pub(crate) extents: [BoxExtents; ND],
    pub(crate) cached_signal: f64,
    pub(crate) cached_error_squared: f64,
    pub(crate) cached_count: u64,
    pub(crate) masked: bool,
    pub(crate) parent_id: Option<BoxId>,
    pub(crate) kind: NodeKind<ND>,
}

impl<const ND: usize> BoxNode<ND> {
    /// An empty leaf with a fresh id, registered with the controller.
    pub(crate) fn new_leaf(
        controller: &BoxController,
        extents: [BoxExtents; ND],
        depth: u32,
        parent_id: Option<BoxId>,
    ) -> Self {
        controller.track_box_created(depth);
        Self {
            id: controller.allocate_id(),
            depth,
            extents,
            cached_signal: 0.0,
            cached_error_squared: 0.0,
            cached_count: 0,
            masked: false,
            parent_id,
            kind: NodeKind::Leaf(LeafData::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> BoxId {
        self.id
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn extents(&self) -> &[BoxExtents; ND] {
        &self.extents
    }

    pub fn parent_id(&self) -> Option<BoxId> {
        self.parent_id
    }

    pub fn kind(&self) -> &NodeKind<ND> {
        &self.kind
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn is_masked(&self) -> bool {
        self.masked
    }

    pub fn as_leaf(&self) -> Option<&LeafData<ND>> {
        match &self.kind {
            NodeKind::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn cached_signal(&self) -> f64 {
        self.cached_signal
    }

    pub fn cached_error_squared(&self) -> f64 {
        self.cached_error_squared
    }

    pub fn cached_count(&self) -> u64 {
        self.cached_count
    }

    pub fn cached(&self) -> BoxSignal {
        BoxSignal {
            signal: self.cached_signal,
            error_squared: self.cached_error_squared,
            count: self.cached_count,
        }
    }

    pub(crate) fn store_cache(&mut self, signal: &BoxSignal) {
        self.cached_signal = signal.signal;
        self.cached_error_squared = signal.error_squared;
        self.cached_count = signal.count;
    }

    pub fn volume(&self) -> f64 {
        extents::volume(&self.extents)
    }

    /// Cached signal divided by the box volume.
    pub fn normalized_signal(&self) -> f64 {
        let volume = self.volume();
        if volume > 0.0 {
            self.cached_signal / volume
        } else {
            0.0
        }
    }

    pub fn num_children(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf(_) => 0,
            NodeKind::Grid(grid) => grid.children.len(),
            NodeKind::BinarySplit(_) => 2,
        }
    }

    /// Direct children in routing order (grid order, or left then right).
    pub fn children(&self) -> Vec<&BoxNode<ND>> {
        match &self.kind {
            NodeKind::Leaf(_) => Vec::new(),
            NodeKind::Grid(grid) => grid.children.iter().collect(),
            NodeKind::BinarySplit(split) => vec![split.left.as_ref(), split.right.as_ref()],
        }
    }

    pub(crate) fn children_mut(&mut self) -> Vec<&mut BoxNode<ND>> {
        match &mut self.kind {
            NodeKind::Leaf(_) => Vec::new(),
            NodeKind::Grid(grid) => grid.children.iter_mut().collect(),
            NodeKind::BinarySplit(split) => vec![split.left.as_mut(), split.right.as_mut()],
        }
    }

    /// Events actually held by this subtree, in memory and on disk.
    /// Unlike `cached_count` this is never stale.
    pub fn event_count(&self) -> u64 {
        match &self.kind {
            NodeKind::Leaf(leaf) => leaf.event_count(),
            _ => self.children().iter().map(|c| c.event_count()).sum(),
        }
    }

    /// Number of boxes in this subtree, including this one.
    pub fn subtree_size(&self) -> u64 {
        1 + self
            .children()
            .iter()
            .map(|c| c.subtree_size())
            .sum::<u64>()
    }

    /// Finds a box of this subtree by id.
    pub fn find(&self, id: BoxId) -> Option<&BoxNode<ND>> {
        if self.id == id {
            return Some(self);
        }
        self.children().into_iter().find_map(|c| c.find(id))
    }
}

// ============================================================================
// Grid layout
// ============================================================================

impl<const ND: usize> GridData<ND> {
    pub fn split_into(&self) -> &[usize; ND] {
        &self.split_into
    }

    pub fn children(&self) -> &[BoxNode<ND>] {
        &self.children
    }

    /// Linear child index of a point inside `extents`.
    pub(crate) fn child_index(&self, extents: &[BoxExtents; ND], coords: &[f64; ND]) -> usize {
        grid_index(extents, &self.split_into, coords)
    }
}

pub(crate) fn grid_index<const ND: usize>(
    extents: &[BoxExtents; ND],
    split_into: &[usize; ND],
    coords: &[f64; ND],
) -> usize {
    let mut index = 0;
    let mut stride = 1;
    for d in 0..ND {
        index += extents[d].cell_index(coords[d], split_into[d]) * stride;
        stride *= split_into[d];
    }
    index
}

/// Extents of the grid cell with linear index `index`.
pub(crate) fn grid_cell<const ND: usize>(
    extents: &[BoxExtents; ND],
    split_into: &[usize; ND],
    index: usize,
) -> [BoxExtents; ND] {
    let mut rest = index;
    std::array::from_fn(|d| {
        let n = split_into[d];
        let i = rest % n;
        rest /= n;
        extents[d].cell(i, n)
    })
}

impl<const ND: usize> SplitData<ND> {
    pub fn split_dim(&self) -> usize {
        self.split_dim
    }

    pub fn split_point(&self) -> f64 {
        self.split_point
    }

    pub fn left(&self) -> &BoxNode<ND> {
        &self.left
    }

    pub fn right(&self) -> &BoxNode<ND> {
        &self.right
    }

    /// 0 for left, 1 for right.
    #[inline]
    pub(crate) fn side(&self, coords: &[f64; ND]) -> usize {
        if coords[self.split_dim] < self.split_point {
            0
        } else {
            1
        }
    }
}

// ============================================================================
// Leaf paging
// ============================================================================

impl<const ND: usize> LeafData<ND> {
    /// Events currently held in memory.
    pub fn in_memory(&self) -> &[Event<ND>] {
        &self.events
    }

    pub fn file_slot(&self) -> Option<FileSlot> {
        self.file
    }

    pub fn events_on_disk(&self) -> u64 {
        self.file.map_or(0, |slot| slot.count)
    }

    pub fn event_count(&self) -> u64 {
        self.events.len() as u64 + self.events_on_disk()
    }

    /// Reads the paged part of the leaf. Empty if nothing is paged.
    pub(crate) fn load_paged(
        &self,
        leaf_id: BoxId,
        controller: &BoxController,
    ) -> MdResult<Vec<Event<ND>>> {
        let Some(slot) = self.file else {
            return Ok(Vec::new());
        };
        let backend = controller.file_backend().ok_or_else(|| {
            MdError::BackendIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("box {} has paged events but no file backend is attached", leaf_id),
            ))
        })?;
        let values = backend.load(leaf_id, slot.offset)?;
        let events = unflatten_events(&values).ok_or_else(|| {
            MdError::Serialization(format!(
                "paged block of box {} is not a whole number of events",
                leaf_id
            ))
        })?;
        if events.len() as u64 != slot.count {
            return Err(MdError::Serialization(format!(
                "box {} expected {} paged events, found {}",
                leaf_id,
                slot.count,
                events.len()
            )));
        }
        Ok(events)
    }

    /// Marks the leaf most recently used if it holds events in memory.
    pub(crate) fn touch(&self, leaf_id: BoxId, controller: &BoxController) {
        if controller.is_file_backed() && !self.events.is_empty() {
            controller.leaf_cache().lock().touch(leaf_id);
        }
    }

    /// All events of the leaf, paged ones first.
    pub(crate) fn load_all(
        &self,
        leaf_id: BoxId,
        controller: &BoxController,
    ) -> MdResult<Vec<Event<ND>>> {
        let mut events = self.load_paged(leaf_id, controller)?;
        events.extend_from_slice(&self.events);
        Ok(events)
    }

    /// Writes every event of the leaf to the backend as one block and drops
    /// the in-memory copy. Returns the number of events moved out of memory.
    pub(crate) fn evict(&mut self, leaf_id: BoxId, backend: &dyn FileBackend) -> MdResult<usize> {
        if self.events.is_empty() {
            return Ok(0);
        }
        let mut values = match self.file {
            Some(slot) => backend.load(leaf_id, slot.offset)?,
            None => Vec::new(),
        };
        values.extend(flatten_events(&self.events));
        let count = self.event_count();
        let offset = backend.evict(leaf_id, &values)?;

        if let Some(old) = self.file.replace(FileSlot { offset, count }) {
            if let Err(e) = backend.release(leaf_id, old.offset) {
                log::error!("Failed to release old block of box {}: {}", leaf_id, e);
            }
        }
        let moved = self.events.len();
        self.events = Vec::new();
        Ok(moved)
    }
}
