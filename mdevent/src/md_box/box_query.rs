//! Read-only traversals: point lookup, leaf collection, binning, masking.
//!
//! Queries that use cached aggregates (`bin_range` on fully covered boxes)
//! are only meaningful after a refresh.

use std::ops::Range;

use super::box_types::{BoxNode, BoxSignal, NodeKind};
use crate::controller::BoxController;
use crate::errors::MdResult;
use crate::event::Event;
use crate::extents::BoxExtents;
use crate::region::{BoxContact, RegionPredicate};

impl<const ND: usize> BoxNode<ND> {
    /// The leaf whose half-open extents contain `coords`, or `None` if the
    /// point lies outside this box.
    pub fn point_lookup(&self, coords: &[f64; ND]) -> Option<&BoxNode<ND>> {
        if !self.contains(coords) {
            return None;
        }
        let mut node = self;
        loop {
            node = match &node.kind {
                NodeKind::Leaf(_) => return Some(node),
                NodeKind::Grid(grid) => &grid.children[grid.child_index(&node.extents, coords)],
                NodeKind::BinarySplit(split) => {
                    if split.side(coords) == 0 {
                        split.left.as_ref()
                    } else {
                        split.right.as_ref()
                    }
                }
            };
        }
    }

    /// Pre-order collection of boxes, pruned by `predicate`.
    ///
    /// Descent stops at `max_depth`; an interior box at that depth is
    /// reported itself unless `leaves_only` is set.
    pub fn collect_leaves<'a>(
        &'a self,
        max_depth: u32,
        leaves_only: bool,
        predicate: Option<&RegionPredicate<ND>>,
        out: &mut Vec<&'a BoxNode<ND>>,
    ) {
        if let Some(predicate) = predicate {
            if predicate.classify(&self.extents) == BoxContact::Outside {
                return;
            }
        }
        if self.is_leaf() {
            out.push(self);
            return;
        }
        if self.depth >= max_depth {
            if !leaves_only {
                out.push(self);
            }
            return;
        }
        for child in self.children() {
            child.collect_leaves(max_depth, leaves_only, predicate, out);
        }
    }

    /// Sum of signal and squared error of the unmasked events inside
    /// `[min, max)`.
    pub fn bin_range(
        &self,
        min: &[f64; ND],
        max: &[f64; ND],
        controller: &BoxController,
    ) -> MdResult<(f64, f64)> {
        let mut total = BoxSignal::default();
        self.bin_node(min, max, &[false; ND], controller, &mut total)?;
        Ok((total.signal, total.error_squared))
    }

    /// `covered[d]` is set once an ancestor lies entirely inside the query
    /// along `d`; those dimensions are not tested again. The flags are copied
    /// only when this box covers a new dimension, so siblings keep their view.
    fn bin_node(
        &self,
        min: &[f64; ND],
        max: &[f64; ND],
        covered: &[bool; ND],
        controller: &BoxController,
        total: &mut BoxSignal,
    ) -> MdResult<()> {
        if self.masked {
            return Ok(());
        }
        let mut widened: Option<[bool; ND]> = None;
        for d in 0..ND {
            if covered[d] {
                continue;
            }
            let extent = &self.extents[d];
            if !extent.overlaps(min[d], max[d]) {
                return Ok(());
            }
            if extent.is_within(min[d], max[d]) {
                widened.get_or_insert(*covered)[d] = true;
            }
        }
        let flags = widened.as_ref().unwrap_or(covered);

        if flags.iter().all(|&c| c) {
            total.signal += self.cached_signal;
            total.error_squared += self.cached_error_squared;
            total.count += self.cached_count;
            return Ok(());
        }

        match &self.kind {
            NodeKind::Leaf(leaf) => {
                let inside = |event: &Event<ND>| {
                    (0..ND).all(|d| {
                        flags[d] || (min[d] <= event.coord(d) && event.coord(d) < max[d])
                    })
                };
                leaf.touch(self.id, controller);
                for event in leaf.load_paged(self.id, controller)?.iter() {
                    if inside(event) {
                        total.add_event(event);
                    }
                }
                for event in &leaf.events {
                    if inside(event) {
                        total.add_event(event);
                    }
                }
            }
            NodeKind::Grid(grid) => {
                for child in &grid.children {
                    child.bin_node(min, max, flags, controller, total)?;
                }
            }
            NodeKind::BinarySplit(split) => {
                let d = split.split_dim;
                if flags[d] || min[d] < split.split_point {
                    split.left.bin_node(min, max, flags, controller, total)?;
                }
                if flags[d] || max[d] > split.split_point {
                    split.right.bin_node(min, max, flags, controller, total)?;
                }
            }
        }
        Ok(())
    }

    /// Masks every leaf that is not outside `region`. Returns how many.
    pub(crate) fn mask(&mut self, region: &RegionPredicate<ND>) -> usize {
        if region.classify(&self.extents) == BoxContact::Outside {
            return 0;
        }
        if self.is_leaf() {
            self.masked = true;
            return 1;
        }
        self.children_mut()
            .into_iter()
            .map(|child| child.mask(region))
            .sum()
    }

    pub(crate) fn unmask_all(&mut self) {
        self.masked = false;
        for child in self.children_mut() {
            child.unmask_all();
        }
    }

    /// Appends every event of this subtree, paged ones included.
    pub(crate) fn collect_events(
        &self,
        controller: &BoxController,
        out: &mut Vec<Event<ND>>,
    ) -> MdResult<()> {
        match &self.kind {
            NodeKind::Leaf(leaf) => {
                leaf.touch(self.id, controller);
                out.extend(leaf.load_paged(self.id, controller)?);
                out.extend_from_slice(&leaf.events);
            }
            _ => {
                for child in self.children() {
                    child.collect_events(controller, out)?;
                }
            }
        }
        Ok(())
    }

    /// Grows `bounds` to contain every event of this subtree.
    pub(crate) fn expand_to_events(
        &self,
        controller: &BoxController,
        bounds: &mut [BoxExtents; ND],
    ) -> MdResult<()> {
        match &self.kind {
            NodeKind::Leaf(leaf) => {
                let paged = leaf.load_paged(self.id, controller)?;
                for event in paged.iter().chain(leaf.events.iter()) {
                    for (extent, &x) in bounds.iter_mut().zip(event.coords().iter()) {
                        extent.expand_to_contain(x);
                    }
                }
            }
            _ => {
                for child in self.children() {
                    child.expand_to_events(controller, bounds)?;
                }
            }
        }
        Ok(())
    }

    /// Lowers `widths[d]` to the narrowest leaf width found along `d`.
    pub(crate) fn finest_widths(&self, widths: &mut [f64; ND]) {
        if self.is_leaf() {
            for (width, extent) in widths.iter_mut().zip(self.extents.iter()) {
                *width = width.min(extent.width());
            }
            return;
        }
        for child in self.children() {
            child.finest_widths(widths);
        }
    }
}

/// Splits `items` into contiguous, near-equal ranges, one per worker.
///
/// The worker count is clamped to `[1, items.len()]`, so every item lands in
/// exactly one range and no range is empty unless `items` is.
pub fn partition_for_iterators<T>(items: &[T], num_workers: usize) -> Vec<Range<usize>> {
    let n = items.len();
    let workers = num_workers.min(n).max(1);
    (0..workers)
        .map(|i| (i * n / workers)..((i + 1) * n / workers))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{BoxControllerConfig, SplitPolicy};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tree(config: BoxControllerConfig, events: &[Event<2>]) -> (BoxController, BoxNode<2>) {
        let bc = BoxController::new(2, config).unwrap();
        let mut root = BoxNode::new_leaf(
            &bc,
            [BoxExtents::new(0.0, 10.0), BoxExtents::new(0.0, 10.0)],
            0,
            None,
        );
        for event in events {
            root.insert(*event).unwrap();
        }
        root.split_if_needed(&bc).unwrap();
        root.refresh_cache(&bc).unwrap();
        (bc, root)
    }

    fn random_events(n: usize, seed: u64) -> Vec<Event<2>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Event::new(
                    [rng.gen_range(0.0..10.0), rng.gen_range(0.0..10.0)],
                    rng.gen_range(0.0..5.0),
                    rng.gen_range(0.0..1.0),
                )
            })
            .collect()
    }

    fn brute_force(events: &[Event<2>], min: [f64; 2], max: [f64; 2]) -> (f64, f64) {
        events
            .iter()
            .filter(|e| (0..2).all(|d| min[d] <= e.coord(d) && e.coord(d) < max[d]))
            .fold((0.0, 0.0), |(s, e2), e| (s + e.signal(), e2 + e.error_squared()))
    }

    fn assert_close(actual: (f64, f64), expected: (f64, f64)) {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 * b.abs().max(1.0);
        assert!(close(actual.0, expected.0), "{:?} vs {:?}", actual, expected);
        assert!(close(actual.1, expected.1), "{:?} vs {:?}", actual, expected);
    }

    #[test]
    fn test_point_lookup_on_cell_boundary() {
        let config = BoxControllerConfig::new()
            .split_into(vec![10])
            .split_thresholds(vec![1])
            .max_depth(1);
        let (_bc, root) = tree(
            config,
            &[Event::new([1.0, 1.0], 1.0, 1.0), Event::new([2.0, 2.0], 1.0, 1.0)],
        );
        let leaf = root.point_lookup(&[3.0, 7.0]).unwrap();
        assert_eq!(leaf.extents()[0], BoxExtents::new(3.0, 4.0));
        assert_eq!(leaf.extents()[1], BoxExtents::new(7.0, 8.0));
        assert!(leaf.contains(&[3.0, 7.0]));

        assert!(root.point_lookup(&[10.0, 5.0]).is_none());
        assert!(root.point_lookup(&[-0.0001, 5.0]).is_none());
    }

    #[test]
    fn test_collect_leaves_with_depth_limit() {
        let config = BoxControllerConfig::new()
            .split_into(vec![2])
            .split_thresholds(vec![3])
            .max_depth(3);
        let (_bc, root) = tree(config, &random_events(200, 1));

        let mut leaves = Vec::new();
        root.collect_leaves(u32::MAX, true, None, &mut leaves);
        assert!(leaves.iter().all(|n| n.is_leaf()));
        let total: u64 = leaves.iter().map(|n| n.event_count()).sum();
        assert_eq!(total, 200);

        let mut coarse = Vec::new();
        root.collect_leaves(1, false, None, &mut coarse);
        assert_eq!(coarse.len(), 4);
        assert!(coarse.iter().all(|n| n.depth() == 1));

        let mut only_leaves = Vec::new();
        root.collect_leaves(1, true, None, &mut only_leaves);
        assert!(only_leaves.iter().all(|n| n.is_leaf() && n.depth() <= 1));
    }

    #[test]
    fn test_collect_leaves_prunes_by_region() {
        let config = BoxControllerConfig::new()
            .split_into(vec![2])
            .split_thresholds(vec![3])
            .max_depth(2);
        let (_bc, root) = tree(config, &random_events(200, 2));
        let region = RegionPredicate::from_min_max([0.0, 0.0], [5.0, 5.0]);
        let mut leaves = Vec::new();
        root.collect_leaves(u32::MAX, true, Some(&region), &mut leaves);
        assert_eq!(leaves.len(), 4);
        assert!(leaves
            .iter()
            .all(|n| n.extents()[0].max() <= 5.0 && n.extents()[1].max() <= 5.0));
    }

    #[test]
    fn test_partition_for_iterators() {
        let items = [0; 7];
        let ranges = partition_for_iterators(&items, 3);
        assert_eq!(ranges, vec![0..2, 2..4, 4..7]);

        let ranges = partition_for_iterators(&items, 20);
        assert_eq!(ranges.len(), 7);
        assert!(ranges.iter().all(|r| r.len() == 1));

        assert_eq!(partition_for_iterators(&items, 0), vec![0..7]);
        assert_eq!(partition_for_iterators::<u8>(&[], 4), vec![0..0]);
    }

    #[test]
    fn test_bin_range_matches_brute_force() {
        let events = random_events(2000, 3);
        let config = BoxControllerConfig::new()
            .split_into(vec![3])
            .split_thresholds(vec![20])
            .max_depth(4);
        let (bc, root) = tree(config, &events);

        let queries = [
            ([0.0, 0.0], [10.0, 10.0]),
            ([2.5, 1.0], [7.5, 9.0]),
            ([0.0, 3.3], [10.0, 6.7]),
            ([4.0, 4.0], [4.0, 9.0]),
        ];
        for (min, max) in queries {
            let actual = root.bin_range(&min, &max, &bc).unwrap();
            assert_close(actual, brute_force(&events, min, max));
        }
    }

    #[test]
    fn test_bin_range_on_binary_split_tree() {
        let events = random_events(2000, 4);
        let config = BoxControllerConfig::new()
            .split_thresholds(vec![30])
            .max_depth(12)
            .split_policy(SplitPolicy::BinarySplit);
        let (bc, root) = tree(config, &events);
        assert!(matches!(root.kind(), NodeKind::BinarySplit(_)));

        for (min, max) in [([1.0, 2.0], [6.0, 8.5]), ([0.0, 0.0], [10.0, 5.0])] {
            let actual = root.bin_range(&min, &max, &bc).unwrap();
            assert_close(actual, brute_force(&events, min, max));
        }
    }

    #[test]
    fn test_masked_leaves_are_skipped_by_bin_range() {
        let events = random_events(500, 5);
        let config = BoxControllerConfig::new()
            .split_into(vec![2])
            .split_thresholds(vec![50])
            .max_depth(3);
        let (bc, mut root) = tree(config, &events);

        let left_half = RegionPredicate::from_min_max([0.0, 0.0], [5.0, 10.0]);
        assert!(root.mask(&left_half) > 0);
        root.refresh_cache(&bc).unwrap();
        let everything = ([0.0, 0.0], [10.0, 10.0]);
        let actual = root.bin_range(&everything.0, &everything.1, &bc).unwrap();
        assert_close(actual, brute_force(&events, [5.0, 0.0], [10.0, 10.0]));

        root.unmask_all();
        root.refresh_cache(&bc).unwrap();
        let actual = root.bin_range(&everything.0, &everything.1, &bc).unwrap();
        assert_close(actual, brute_force(&events, everything.0, everything.1));
    }

    #[test]
    fn test_finest_widths() {
        let config = BoxControllerConfig::new()
            .split_into(vec![2])
            .split_thresholds(vec![1])
            .max_depth(3);
        let (_bc, root) = tree(
            config,
            &[Event::new([1.0, 1.0], 1.0, 1.0), Event::new([1.1, 1.1], 1.0, 1.0)],
        );
        let mut widths = [f64::INFINITY; 2];
        root.finest_widths(&mut widths);
        assert_eq!(widths, [1.25, 1.25]);
    }
}
