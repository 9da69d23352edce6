//! Leaf to interior conversion and the split passes.
//!
//! A conversion replaces the node's variant in place: the leaf's events
//! (including any paged part) are redistributed into fresh child leaves
//! before the new variant is installed, so callers never observe a half
//! converted box. The interior receives a fresh id; the old leaf id's file
//! block is released to the backend.

use super::box_types::{grid_cell, grid_index, BoxNode, GridData, NodeKind, SplitData};
use crate::controller::{BoxController, SplitPolicy};
use crate::disk::BoxId;
use crate::errors::MdResult;
use crate::event::Event;
use crate::extents::BoxExtents;
use crate::scheduler::TaskScope;

impl<const ND: usize> BoxNode<ND> {
    /// Converts this leaf into an interior box if the controller says it is
    /// over its depth's threshold. Returns whether a conversion happened.
    pub(crate) fn convert_if_needed(&mut self, controller: &BoxController) -> MdResult<bool> {
        let count = match &self.kind {
            NodeKind::Leaf(leaf) => leaf.event_count(),
            _ => return Ok(false),
        };
        if !controller.should_split(count, self.depth) {
            return Ok(false);
        }
        self.convert(controller, controller.split_policy())
    }

    /// Unconditionally converts this leaf into a grid box.
    pub(crate) fn convert_to_grid(&mut self, controller: &BoxController) -> MdResult<bool> {
        self.convert(controller, SplitPolicy::Grid)
    }

    fn convert(&mut self, controller: &BoxController, policy: SplitPolicy) -> MdResult<bool> {
        let NodeKind::Leaf(leaf) = &self.kind else {
            return Ok(false);
        };
        let old_slot = leaf.file;
        let events = leaf.load_all(self.id, controller)?;

        let binary = match policy {
            SplitPolicy::Grid => None,
            SplitPolicy::BinarySplit => match choose_split(&events) {
                Some(split) => Some(split),
                None => {
                    log::trace!(
                        "Box {} has no dimension with spread; leaving it as a leaf",
                        self.id
                    );
                    return Ok(false);
                }
            },
        };

        let interior_id = controller.allocate_id();
        let kind = match binary {
            None => self.build_grid(controller, interior_id, events),
            Some((dim, point)) => self.build_split(controller, interior_id, events, dim, point),
        };

        let old_id = self.id;
        controller.track_box_destroyed(self.depth);
        controller.track_box_created(self.depth);
        self.id = interior_id;
        self.kind = kind;
        // The mask now lives on the children.
        self.masked = false;

        if controller.is_file_backed() {
            let mut cache = controller.leaf_cache().lock();
            cache.remove(old_id);
            for child in self.children() {
                if let Some(leaf) = child.as_leaf() {
                    if !leaf.events.is_empty() {
                        let bytes = leaf.events.len() * Event::<ND>::size_in_bytes();
                        cache.add_bytes(child.id, bytes as u64);
                    }
                }
            }
        }
        if let (Some(slot), Some(backend)) = (old_slot, controller.file_backend()) {
            if let Err(e) = backend.release(old_id, slot.offset) {
                log::error!("Failed to release block of split box {}: {}", old_id, e);
            }
        }
        Ok(true)
    }

    fn new_child(
        &self,
        controller: &BoxController,
        extents: [BoxExtents; ND],
        parent_id: BoxId,
    ) -> BoxNode<ND> {
        let mut child = BoxNode::new_leaf(controller, extents, self.depth + 1, Some(parent_id));
        child.masked = self.masked;
        child
    }

    fn build_grid(
        &self,
        controller: &BoxController,
        interior_id: BoxId,
        events: Vec<Event<ND>>,
    ) -> NodeKind<ND> {
        let split_into: [usize; ND] = std::array::from_fn(|d| controller.split_into(d));
        let cells: usize = split_into.iter().product();
        let mut children: Vec<BoxNode<ND>> = (0..cells)
            .map(|i| {
                let cell = grid_cell(&self.extents, &split_into, i);
                self.new_child(controller, cell, interior_id)
            })
            .collect();

        for event in events {
            let index = grid_index(&self.extents, &split_into, event.coords());
            children[index].insert_unchecked(event);
        }
        NodeKind::Grid(GridData {
            split_into,
            children,
        })
    }

    fn build_split(
        &self,
        controller: &BoxController,
        interior_id: BoxId,
        events: Vec<Event<ND>>,
        split_dim: usize,
        split_point: f64,
    ) -> NodeKind<ND> {
        let bounds = self.extents[split_dim];
        let mut left_extents = self.extents;
        left_extents[split_dim] = BoxExtents::new(bounds.min(), split_point);
        let mut right_extents = self.extents;
        right_extents[split_dim] = BoxExtents::new(split_point, bounds.max());

        let mut left = self.new_child(controller, left_extents, interior_id);
        let mut right = self.new_child(controller, right_extents, interior_id);
        for event in events {
            if event.coord(split_dim) < split_point {
                left.insert_unchecked(event);
            } else {
                right.insert_unchecked(event);
            }
        }
        NodeKind::BinarySplit(SplitData {
            split_dim,
            split_point,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// True if a split pass has anything to do in this subtree.
    fn needs_split_pass(&self, controller: &BoxController) -> bool {
        match &self.kind {
            NodeKind::Leaf(leaf) => controller.should_split(leaf.event_count(), self.depth),
            _ => true,
        }
    }

    /// Splits every over-full leaf of this subtree on the calling thread.
    pub(crate) fn split_if_needed(&mut self, controller: &BoxController) -> MdResult<()> {
        self.convert_if_needed(controller)?;
        for child in self.children_mut() {
            if child.needs_split_pass(controller) {
                child.split_if_needed(controller)?;
            }
        }
        Ok(())
    }

    /// Task version of [`BoxNode::split_if_needed`].
    ///
    /// The node is converted first; only then is one task per child that
    /// still has work submitted. Each task owns its child's subtree.
    pub(crate) fn split_if_needed_tasks<'scope>(
        &'scope mut self,
        controller: &'scope BoxController,
        scope: &TaskScope<'scope>,
    ) -> MdResult<()> {
        self.convert_if_needed(controller)?;
        for child in self.children_mut() {
            if child.needs_split_pass(controller) {
                scope.submit(move |scope| child.split_if_needed_tasks(controller, scope));
            }
        }
        Ok(())
    }

    /// Grid-splits this subtree uniformly until every leaf is at `min_depth`.
    pub(crate) fn presplit(&mut self, controller: &BoxController, min_depth: u32) -> MdResult<()> {
        if self.depth >= min_depth {
            return Ok(());
        }
        self.convert_to_grid(controller)?;
        for child in self.children_mut() {
            child.presplit(controller, min_depth)?;
        }
        Ok(())
    }
}

/// Dimension of largest variance and the mean along it, or `None` if no
/// dimension separates the events.
fn choose_split<const ND: usize>(events: &[Event<ND>]) -> Option<(usize, f64)> {
    if events.len() < 2 {
        return None;
    }
    let n = events.len() as f64;
    let mut best: Option<(usize, f64, f64)> = None;
    for dim in 0..ND {
        let mean = events.iter().map(|e| e.coord(dim)).sum::<f64>() / n;
        let variance = events
            .iter()
            .map(|e| {
                let delta = e.coord(dim) - mean;
                delta * delta
            })
            .sum::<f64>()
            / n;
        if variance > 0.0 && best.map_or(true, |(_, v, _)| variance > v) {
            best = Some((dim, variance, mean));
        }
    }
    let (dim, _, mean) = best?;
    // Rounding can put the mean on the smallest coordinate.
    events
        .iter()
        .any(|e| e.coord(dim) < mean)
        .then_some((dim, mean))
}
