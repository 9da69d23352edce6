//! The event tree: a root box plus the controller shared by every box.
//!
//! Building a tree is two-phase. Events are routed into leaves by the
//! `insert*` operations, which never split; [`MdEventTree::split_all`] then
//! converts over-full leaves in one pass and [`MdEventTree::refresh`] brings
//! the cached aggregates up to date. Queries that read aggregates assume a
//! refresh since the last mutation.
//!
//! The tree has no internal lock. Mutating passes take `&mut self`, so
//! readers cannot overlap a split or insert on the same tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::controller::{BoxController, BoxControllerConfig};
use crate::disk::{BoxId, FileBackend};
use crate::errors::{MdError, MdResult};
use crate::event::Event;
use crate::extents::BoxExtents;
use crate::md_box::{BoxNode, BoxSignal};
use crate::region::RegionPredicate;
use crate::scheduler::TaskScheduler;

/// Events inserted between eviction passes on file-backed trees.
const INSERT_CHUNK: usize = 10_000;

/// Snapshot of the tree's shape and memory use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub total_boxes: u64,
    pub leaf_boxes: u64,
    pub masked_leaves: u64,
    /// Live boxes per depth, as tracked by the controller
    pub boxes_per_depth: Vec<u64>,
    pub max_depth_reached: u32,
    pub events_in_memory: u64,
    pub events_on_disk: u64,
    /// Bytes of in-memory events tracked by the leaf cache
    pub leaf_cache_bytes: u64,
    pub write_buffer_used: u64,
    pub write_buffer_capacity: u64,
}

/// An adaptive `ND`-dimensional event index.
pub struct MdEventTree<const ND: usize> {
    controller: Arc<BoxController>,
    root: BoxNode<ND>,
}

impl<const ND: usize> MdEventTree<ND> {
    /// Creates an empty tree over `extents` with a controller built from
    /// `config`.
    pub fn new(extents: [BoxExtents; ND], config: BoxControllerConfig) -> MdResult<Self> {
        let controller = BoxController::new(ND, config)?;
        Self::with_controller(extents, Arc::new(controller))
    }

    /// Creates an empty tree around an existing controller, for example one
    /// with a file backend attached.
    pub fn with_controller(
        extents: [BoxExtents; ND],
        controller: Arc<BoxController>,
    ) -> MdResult<Self> {
        if controller.nd() != ND {
            return Err(MdError::InvalidConfiguration(format!(
                "controller is configured for {} dimensions, tree has {}",
                controller.nd(),
                ND
            )));
        }
        if let Some(bad) = extents.iter().find(|e| !e.is_valid() || e.width() <= 0.0) {
            return Err(MdError::InvalidConfiguration(format!(
                "tree extents must be finite and non-empty (got {})",
                bad
            )));
        }
        let root = BoxNode::new_leaf(&controller, extents, 0, None);
        Ok(Self { controller, root })
    }

    pub fn controller(&self) -> &Arc<BoxController> {
        &self.controller
    }

    pub fn root(&self) -> &BoxNode<ND> {
        &self.root
    }

    pub fn extents(&self) -> &[BoxExtents; ND] {
        self.root.extents()
    }

    /// Events currently stored, counted directly rather than from the cache.
    pub fn total_events(&self) -> u64 {
        self.root.event_count()
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts one event, rejecting coordinates outside the tree extents.
    pub fn insert(&mut self, event: Event<ND>) -> MdResult<()> {
        if !self.root.contains(event.coords()) {
            return Err(MdError::out_of_bounds(event.coords()));
        }
        self.insert_validated(std::slice::from_ref(&event))
    }

    /// Inserts a batch of events without splitting.
    ///
    /// The whole batch is checked first: if any event lies outside the tree
    /// extents nothing is inserted and `OutOfBounds` names the first one.
    pub fn insert_batch(&mut self, events: &[Event<ND>]) -> MdResult<()> {
        self.check_bounds(events)?;
        self.insert_validated(events)
    }

    /// Inserts the events inside the tree extents and drops the rest.
    /// Returns the number of dropped events.
    pub fn insert_batch_ignoring_bounds(&mut self, events: &[Event<ND>]) -> MdResult<usize> {
        let inside: Vec<Event<ND>> = events
            .iter()
            .filter(|e| self.root.contains(e.coords()))
            .copied()
            .collect();
        let dropped = events.len() - inside.len();
        if dropped > 0 {
            log::warn!(
                "Dropped {} of {} events outside the tree extents",
                dropped,
                events.len()
            );
        }
        self.insert_validated(&inside)?;
        Ok(dropped)
    }

    /// Inserts a batch with one task per child of the root.
    ///
    /// Events are bucketed by the root child they route to, and every bucket
    /// is inserted into its own subtree. A leaf root is filled sequentially.
    pub fn insert_batch_parallel(
        &mut self,
        events: &[Event<ND>],
        scheduler: &TaskScheduler,
    ) -> MdResult<()> {
        self.check_bounds(events)?;
        if self.root.is_leaf() {
            return self.insert_validated(events);
        }

        let mut buckets: Vec<Vec<Event<ND>>> = vec![Vec::new(); self.root.num_children()];
        for event in events {
            if let Some(position) = self.root.child_position(event.coords()) {
                buckets[position].push(*event);
            }
        }

        let controller = &*self.controller;
        let children = self.root.children_mut();
        scheduler.run(move |scope| {
            for (child, bucket) in children.into_iter().zip(buckets) {
                if bucket.is_empty() {
                    continue;
                }
                scope.submit(move |_| {
                    if controller.is_file_backed() {
                        let mut touched = HashMap::new();
                        child.insert_unchecked_batch(&bucket, Some(&mut touched));
                        record_inserted::<ND>(controller, &touched, false);
                    } else {
                        child.insert_unchecked_batch(&bucket, None);
                    }
                    Ok(())
                });
            }
            Ok(())
        })?;
        self.evict_overflow()?;
        Ok(())
    }

    fn check_bounds(&self, events: &[Event<ND>]) -> MdResult<()> {
        match events.iter().find(|e| !self.root.contains(e.coords())) {
            Some(outside) => Err(MdError::out_of_bounds(outside.coords())),
            None => Ok(()),
        }
    }

    /// Routes events that are known to be inside the extents. On file-backed
    /// trees, leaves touched by the current chunk are pinned while the
    /// eviction pass for that chunk runs.
    fn insert_validated(&mut self, events: &[Event<ND>]) -> MdResult<()> {
        if !self.controller.is_file_backed() {
            self.root.insert_unchecked_batch(events, None);
            return Ok(());
        }
        for chunk in events.chunks(INSERT_CHUNK) {
            let mut touched = HashMap::new();
            self.root.insert_unchecked_batch(chunk, Some(&mut touched));
            record_inserted::<ND>(&self.controller, &touched, true);

            let evicted = self.evict_overflow();
            let mut cache = self.controller.leaf_cache().lock();
            for &leaf_id in touched.keys() {
                cache.unpin(leaf_id);
            }
            drop(cache);
            evicted?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Split and refresh
    // ------------------------------------------------------------------

    /// Splits every over-full leaf, using `scheduler` for child subtrees when
    /// given.
    ///
    /// Safe to re-run after a failure: boxes converted before the failing
    /// subtree stay converted and the rest are retried.
    pub fn split_all(&mut self, scheduler: Option<&TaskScheduler>) -> MdResult<()> {
        if self.controller.max_depth() == 0 {
            let events = self.root.event_count();
            if events > 0 {
                return Err(MdError::InvalidConfiguration(format!(
                    "max depth is 0 but the tree holds {} events",
                    events
                )));
            }
        }

        let was_leaf = self.root.is_leaf();
        let controller = &*self.controller;
        match scheduler {
            Some(scheduler) => {
                let root = &mut self.root;
                scheduler.run(move |scope| root.split_if_needed_tasks(controller, scope))?;
            }
            None => self.root.split_if_needed(controller)?,
        }
        if was_leaf && !self.root.is_leaf() {
            log::debug!(
                "Root box split into {} children",
                self.root.num_children()
            );
        }
        log::debug!("Split pass finished: {}", self.controller.stats_string());

        self.evict_overflow()?;
        Ok(())
    }

    /// Recomputes every cached aggregate and returns the root's.
    pub fn refresh(&mut self) -> MdResult<BoxSignal> {
        self.root.refresh_cache(&self.controller)
    }

    /// Like [`MdEventTree::refresh`], with subtrees refreshed in parallel.
    pub fn refresh_with(&mut self, scheduler: &TaskScheduler) -> MdResult<BoxSignal> {
        self.root.refresh_cache_parallel(&self.controller, scheduler)
    }

    /// Uniformly grid-splits an empty tree down to `depth`.
    ///
    /// The projected box count is checked against the controller's memory
    /// limit first; on failure the tree is left as a single empty leaf.
    pub fn set_min_recursion_depth(&mut self, depth: u32) -> MdResult<()> {
        let empty_leaf = matches!(self.root.as_leaf(), Some(leaf) if leaf.event_count() == 0);
        if !empty_leaf {
            return Err(MdError::InvalidConfiguration(
                "minimum recursion depth can only be set on an empty, unsplit tree".into(),
            ));
        }
        if depth == 0 {
            return Ok(());
        }
        let box_size = std::mem::size_of::<BoxNode<ND>>() as u64;
        let boxes = self.controller.check_presplit(depth, box_size)?;
        self.root.presplit(&self.controller, depth)?;
        log::debug!("Pre-split tree to depth {} ({} boxes)", depth, boxes);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Masking and queries
    // ------------------------------------------------------------------

    /// Masks every leaf touching `region`. Returns how many leaves.
    pub fn mask(&mut self, region: &RegionPredicate<ND>) -> usize {
        self.root.mask(region)
    }

    pub fn unmask_all(&mut self) {
        self.root.unmask_all();
    }

    pub fn point_lookup(&self, coords: &[f64; ND]) -> Option<&BoxNode<ND>> {
        self.root.point_lookup(coords)
    }

    /// Boxes in pre-order; see [`BoxNode::collect_leaves`]. Pass `u32::MAX`
    /// as `max_depth` for no limit.
    pub fn collect_leaves(
        &self,
        max_depth: u32,
        leaves_only: bool,
        predicate: Option<&RegionPredicate<ND>>,
    ) -> Vec<&BoxNode<ND>> {
        let mut out = Vec::new();
        self.root
            .collect_leaves(max_depth, leaves_only, predicate, &mut out);
        out
    }

    /// Signal and squared error of the unmasked events in `[min, max)`.
    pub fn bin_range(&self, min: &[f64; ND], max: &[f64; ND]) -> MdResult<(f64, f64)> {
        self.root.bin_range(min, max, &self.controller)
    }

    /// Every event of `node`'s subtree, paged events included.
    pub fn leaf_events(&self, node: &BoxNode<ND>) -> MdResult<Vec<Event<ND>>> {
        let mut events = Vec::new();
        node.collect_events(&self.controller, &mut events)?;
        Ok(events)
    }

    pub fn all_events(&self) -> MdResult<Vec<Event<ND>>> {
        self.leaf_events(&self.root)
    }

    pub fn find_box(&self, id: BoxId) -> Option<&BoxNode<ND>> {
        self.root.find(id)
    }

    /// The parent of box `id`, looked up from the root by the stored parent id.
    pub fn parent_of(&self, id: BoxId) -> Option<&BoxNode<ND>> {
        let parent_id = self.find_box(id)?.parent_id()?;
        self.find_box(parent_id)
    }

    /// Tight bounding box of the stored events; undefined in every dimension
    /// when the tree is empty.
    pub fn minimum_extents(&self) -> MdResult<[BoxExtents; ND]> {
        let mut bounds = [BoxExtents::undefined(); ND];
        self.root.expand_to_events(&self.controller, &mut bounds)?;
        Ok(bounds)
    }

    /// Narrowest leaf width reached in each dimension.
    pub fn estimate_resolution(&self) -> [f64; ND] {
        let mut widths = [f64::INFINITY; ND];
        self.root.finest_widths(&mut widths);
        widths
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            boxes_per_depth: self.controller.boxes_per_depth(),
            leaf_cache_bytes: self.controller.leaf_cache().lock().used_bytes(),
            ..TreeStats::default()
        };
        if let Some(backend) = self.controller.file_backend() {
            stats.write_buffer_used = backend.buffer_used();
            stats.write_buffer_capacity = backend.buffer_capacity();
        }

        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            stats.total_boxes += 1;
            stats.max_depth_reached = stats.max_depth_reached.max(node.depth());
            if let Some(leaf) = node.as_leaf() {
                stats.leaf_boxes += 1;
                stats.events_in_memory += leaf.in_memory().len() as u64;
                stats.events_on_disk += leaf.events_on_disk();
                if node.is_masked() {
                    stats.masked_leaves += 1;
                }
            }
            stack.extend(node.children());
        }
        stats
    }

    // ------------------------------------------------------------------
    // Paging
    // ------------------------------------------------------------------

    /// Pages out least recently used leaves until in-memory events fit the
    /// leaf cache budget. Returns the number of leaves evicted.
    pub fn evict_overflow(&mut self) -> MdResult<usize> {
        let Some(backend) = self.controller.file_backend().cloned() else {
            return Ok(0);
        };
        let victims: HashSet<BoxId> = {
            let cache = self.controller.leaf_cache().lock();
            if !cache.needs_eviction() {
                return Ok(0);
            }
            cache.select_victims().into_iter().collect()
        };
        self.evict_leaves(&victims, backend.as_ref())
    }

    /// Pages out every unpinned leaf and flushes the file backend.
    pub fn flush(&mut self) -> MdResult<()> {
        let Some(backend) = self.controller.file_backend().cloned() else {
            return Ok(());
        };
        let victims: HashSet<BoxId> = self
            .controller
            .leaf_cache()
            .lock()
            .all_unpinned()
            .into_iter()
            .collect();
        self.evict_leaves(&victims, backend.as_ref())?;
        backend.flush()
    }

    fn evict_leaves(
        &mut self,
        victims: &HashSet<BoxId>,
        backend: &dyn FileBackend,
    ) -> MdResult<usize> {
        if victims.is_empty() {
            return Ok(0);
        }
        let mut evicted = Vec::new();
        let result = self.root.evict_leaves(victims, backend, &mut evicted);

        let mut cache = self.controller.leaf_cache().lock();
        for &(leaf_id, _) in &evicted {
            cache.remove(leaf_id);
        }
        drop(cache);

        log::debug!(
            "Evicted {} leaves ({} events) to the file backend",
            evicted.len(),
            evicted.iter().map(|&(_, n)| n).sum::<usize>()
        );
        result.map(|_| evicted.len())
    }
}

/// Adds freshly inserted events to the leaf cache, optionally pinning the
/// receiving leaves.
fn record_inserted<const ND: usize>(
    controller: &BoxController,
    touched: &HashMap<BoxId, u64>,
    pin: bool,
) {
    let event_size = Event::<ND>::size_in_bytes() as u64;
    let mut cache = controller.leaf_cache().lock();
    for (&leaf_id, &count) in touched {
        cache.add_bytes(leaf_id, count * event_size);
        if pin {
            cache.pin(leaf_id);
        }
    }
}

impl<const ND: usize> std::fmt::Debug for MdEventTree<ND> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdEventTree")
            .field("nd", &ND)
            .field("extents", self.root.extents())
            .field("root_id", &self.root.id())
            .field("controller", &self.controller)
            .finish()
    }
}
