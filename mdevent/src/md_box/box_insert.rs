//! Event routing and insertion.
//!
//! Inserting never splits and never touches cached aggregates; both are
//! left to the explicit split and refresh passes.

use std::collections::HashMap;

use super::box_types::{BoxNode, NodeKind};
use crate::disk::BoxId;
use crate::errors::{MdError, MdResult};
use crate::event::Event;
use crate::extents;

impl<const ND: usize> BoxNode<ND> {
    /// True if `coords` lies inside this box's half-open extents.
    #[inline]
    pub fn contains(&self, coords: &[f64; ND]) -> bool {
        extents::contains_point(&self.extents, coords)
    }

    /// Position of the child a point routes to, in [`BoxNode::children`]
    /// order. `None` for a leaf.
    pub(crate) fn child_position(&self, coords: &[f64; ND]) -> Option<usize> {
        match &self.kind {
            NodeKind::Leaf(_) => None,
            NodeKind::Grid(grid) => Some(grid.child_index(&self.extents, coords)),
            NodeKind::BinarySplit(split) => Some(split.side(coords)),
        }
    }

    /// Inserts an event that is known to lie inside this box. Returns the id
    /// of the receiving leaf.
    pub(crate) fn insert_unchecked(&mut self, event: Event<ND>) -> BoxId {
        match &mut self.kind {
            NodeKind::Leaf(leaf) => {
                leaf.events.push(event);
                self.id
            }
            NodeKind::Grid(grid) => {
                let index = grid.child_index(&self.extents, event.coords());
                grid.children[index].insert_unchecked(event)
            }
            NodeKind::BinarySplit(split) => {
                if split.side(event.coords()) == 0 {
                    split.left.insert_unchecked(event)
                } else {
                    split.right.insert_unchecked(event)
                }
            }
        }
    }

    /// Inserts an event, rejecting coordinates outside the box.
    pub fn insert(&mut self, event: Event<ND>) -> MdResult<BoxId> {
        if !self.contains(event.coords()) {
            return Err(MdError::out_of_bounds(event.coords()));
        }
        Ok(self.insert_unchecked(event))
    }

    /// Inserts pre-validated events, optionally counting how many landed in
    /// each leaf.
    pub(crate) fn insert_unchecked_batch(
        &mut self,
        events: &[Event<ND>],
        mut touched: Option<&mut HashMap<BoxId, u64>>,
    ) {
        for event in events {
            let leaf_id = self.insert_unchecked(*event);
            if let Some(touched) = touched.as_deref_mut() {
                *touched.entry(leaf_id).or_insert(0) += 1;
            }
        }
    }
}
