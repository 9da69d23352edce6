//! Cached aggregates and in-memory event budget.
//!
//! `refresh_cache` recomputes signal, error and count bottom-up. The parallel
//! variant cuts the tree at a frontier depth, refreshes every frontier subtree
//! in its own task, joins, and then aggregates the levels above the frontier
//! on the calling thread.

use std::collections::HashSet;

use super::box_types::{BoxNode, BoxSignal, NodeKind};
use crate::controller::BoxController;
use crate::disk::{BoxId, FileBackend};
use crate::errors::MdResult;
use crate::scheduler::TaskScheduler;

/// Frontier subtrees wanted per worker thread.
const TASKS_PER_THREAD: usize = 4;

impl<const ND: usize> BoxNode<ND> {
    /// Recomputes cached aggregates for this subtree and returns this node's.
    ///
    /// Paged leaf events are read for the sum but not kept in memory.
    pub(crate) fn refresh_cache(&mut self, controller: &BoxController) -> MdResult<BoxSignal> {
        let total = if let NodeKind::Leaf(leaf) = &self.kind {
            let mut total = BoxSignal::default();
            leaf.touch(self.id, controller);
            for event in leaf.load_paged(self.id, controller)?.iter() {
                total.add_event(event);
            }
            for event in &leaf.events {
                total.add_event(event);
            }
            total
        } else {
            let mut total = BoxSignal::default();
            for child in self.children_mut() {
                let child_signal = child.refresh_cache(controller)?;
                total.add_child(&child_signal, child.masked);
            }
            total
        };
        self.store_cache(&total);
        Ok(total)
    }

    /// Refreshes this subtree with frontier subtrees spread over `scheduler`.
    pub(crate) fn refresh_cache_parallel(
        &mut self,
        controller: &BoxController,
        scheduler: &TaskScheduler,
    ) -> MdResult<BoxSignal> {
        let depth = frontier_depth(
            &controller.boxes_per_depth(),
            scheduler.num_threads() * TASKS_PER_THREAD,
        )
        .max(self.depth);

        let mut frontier = Vec::new();
        self.collect_frontier(depth, &mut frontier);
        log::trace!(
            "Refreshing {} subtrees below depth {} on {} threads",
            frontier.len(),
            depth,
            scheduler.num_threads()
        );
        scheduler.run(move |scope| {
            for node in frontier {
                scope.submit(move |_| node.refresh_cache(controller).map(|_| ()));
            }
            Ok(())
        })?;
        Ok(self.aggregate_upper(depth))
    }

    /// Nodes at `depth`, plus leaves that end above it.
    fn collect_frontier<'a>(&'a mut self, depth: u32, out: &mut Vec<&'a mut BoxNode<ND>>) {
        if self.depth >= depth || self.is_leaf() {
            out.push(self);
            return;
        }
        for child in self.children_mut() {
            child.collect_frontier(depth, out);
        }
    }

    /// Sums already refreshed frontier caches into the nodes above them.
    fn aggregate_upper(&mut self, depth: u32) -> BoxSignal {
        if self.depth >= depth || self.is_leaf() {
            return self.cached();
        }
        let mut total = BoxSignal::default();
        for child in self.children_mut() {
            let child_signal = child.aggregate_upper(depth);
            total.add_child(&child_signal, child.masked);
        }
        self.store_cache(&total);
        total
    }

    /// Pages out the in-memory events of every leaf in `victims`.
    ///
    /// Evicted leaves are appended to `evicted` as `(id, events moved)` even
    /// if a later eviction fails, so the caller can settle its accounting.
    pub(crate) fn evict_leaves(
        &mut self,
        victims: &HashSet<BoxId>,
        backend: &dyn FileBackend,
        evicted: &mut Vec<(BoxId, usize)>,
    ) -> MdResult<()> {
        if evicted.len() >= victims.len() {
            return Ok(());
        }
        let id = self.id;
        if let NodeKind::Leaf(leaf) = &mut self.kind {
            if victims.contains(&id) {
                let moved = leaf.evict(id, backend)?;
                evicted.push((id, moved));
            }
            return Ok(());
        }
        for child in self.children_mut() {
            child.evict_leaves(victims, backend, evicted)?;
        }
        Ok(())
    }
}

/// Shallowest depth holding at least `target` boxes, else the deepest
/// populated depth.
fn frontier_depth(boxes_per_depth: &[u64], target: usize) -> u32 {
    let mut deepest = 0;
    for (depth, &count) in boxes_per_depth.iter().enumerate() {
        if count >= target as u64 {
            return depth as u32;
        }
        if count > 0 {
            deepest = depth as u32;
        }
    }
    deepest
}
