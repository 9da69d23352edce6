//! Splitting policy and shared bookkeeping for one tree.
//!
//! A [`BoxController`] is created once per tree and shared (`Arc`) by every
//! split and refresh task. Policy fields are immutable after construction; the
//! id allocator and per-depth box counts are atomics, and the leaf cache sits
//! behind a mutex. The controller never references boxes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::disk::{BoxId, FileBackend, LeafCache};
use crate::errors::{MdError, MdResult};

/// Default in-memory event budget for file-backed trees (64MB)
pub const DEFAULT_LEAF_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// Default cap on the memory a uniform pre-split may allocate (4GB)
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Deepest `max_depth` accepted. Past it, per-depth fan-out no longer fits
/// a `u64` box count and cell widths fall below `f64` resolution.
pub const MAX_SUPPORTED_DEPTH: u32 = 64;

/// How an over-full leaf is turned into an interior box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitPolicy {
    /// Regular grid of `split_into[d]` cells per dimension.
    #[default]
    Grid,
    /// Two children split at the mean of the highest-variance dimension.
    BinarySplit,
}

/// Construction parameters for a [`BoxController`].
///
/// ```rust
/// use mdevent::{BoxControllerConfig, SplitPolicy};
///
/// let config = BoxControllerConfig::new()
///     .split_into(vec![10])
///     .split_thresholds(vec![5])
///     .max_depth(4)
///     .split_policy(SplitPolicy::Grid);
/// assert_eq!(config.get_max_depth(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct BoxControllerConfig {
    split_into: Vec<u32>,
    split_thresholds: Vec<u64>,
    max_depth: u32,
    split_policy: SplitPolicy,
    memory_limit_bytes: u64,
    leaf_cache_bytes: u64,
    num_threads: usize,
}

impl Default for BoxControllerConfig {
    fn default() -> Self {
        Self {
            split_into: vec![2],
            split_thresholds: vec![1000],
            max_depth: 5,
            split_policy: SplitPolicy::Grid,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            leaf_cache_bytes: DEFAULT_LEAF_CACHE_BYTES,
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl BoxControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan-out per dimension. A single value applies to every dimension.
    #[inline]
    pub fn split_into(mut self, split_into: Vec<u32>) -> Self {
        self.split_into = split_into;
        self
    }

    /// Split threshold per depth. Depths past the end reuse the last value.
    #[inline]
    pub fn split_thresholds(mut self, split_thresholds: Vec<u64>) -> Self {
        self.split_thresholds = split_thresholds;
        self
    }

    #[inline]
    pub fn max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[inline]
    pub fn split_policy(mut self, split_policy: SplitPolicy) -> Self {
        self.split_policy = split_policy;
        self
    }

    /// Upper bound on the memory a pre-split may allocate. Defaults to
    /// [`DEFAULT_MEMORY_LIMIT_BYTES`].
    #[inline]
    pub fn memory_limit_bytes(mut self, memory_limit_bytes: u64) -> Self {
        self.memory_limit_bytes = memory_limit_bytes;
        self
    }

    /// In-memory event budget before leaves are evicted to the file backend.
    #[inline]
    pub fn leaf_cache_bytes(mut self, leaf_cache_bytes: u64) -> Self {
        self.leaf_cache_bytes = leaf_cache_bytes;
        self
    }

    #[inline]
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn get_split_into(&self) -> &[u32] {
        &self.split_into
    }

    pub fn get_split_thresholds(&self) -> &[u64] {
        &self.split_thresholds
    }

    pub fn get_max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn get_split_policy(&self) -> SplitPolicy {
        self.split_policy
    }

    pub fn get_memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn get_leaf_cache_bytes(&self) -> u64 {
        self.leaf_cache_bytes
    }

    pub fn get_num_threads(&self) -> usize {
        self.num_threads
    }
}

/// Shared splitting policy and box bookkeeping for one tree.
pub struct BoxController {
    nd: usize,
    split_into: Vec<usize>,
    split_thresholds: Vec<u64>,
    max_depth: u32,
    split_policy: SplitPolicy,
    memory_limit_bytes: u64,
    num_threads: usize,
    next_id: AtomicU64,
    boxes_per_depth: Vec<AtomicU64>,
    file_backend: Option<Arc<dyn FileBackend>>,
    leaf_cache: Mutex<LeafCache>,
}

impl BoxController {
    /// Validates `config` for an `nd`-dimensional tree.
    pub fn new(nd: usize, config: BoxControllerConfig) -> MdResult<Self> {
        if nd == 0 {
            return Err(MdError::InvalidConfiguration(
                "number of dimensions must be at least 1".into(),
            ));
        }
        if config.split_into.is_empty() {
            return Err(MdError::InvalidConfiguration(
                "split_into must not be empty".into(),
            ));
        }
        if config.split_into.len() != 1 && config.split_into.len() != nd {
            return Err(MdError::InvalidConfiguration(format!(
                "split_into has {} entries; expected 1 or {}",
                config.split_into.len(),
                nd
            )));
        }
        if let Some(bad) = config.split_into.iter().find(|&&n| n < 2) {
            return Err(MdError::InvalidConfiguration(format!(
                "fan-out must be at least 2 (got {})",
                bad
            )));
        }
        if config.max_depth > MAX_SUPPORTED_DEPTH {
            return Err(MdError::InvalidConfiguration(format!(
                "max depth {} exceeds the supported maximum of {}",
                config.max_depth, MAX_SUPPORTED_DEPTH
            )));
        }
        if config.split_thresholds.is_empty() {
            return Err(MdError::InvalidConfiguration(
                "split_thresholds must not be empty".into(),
            ));
        }
        if config.split_thresholds.contains(&0) {
            return Err(MdError::InvalidConfiguration(
                "split thresholds must be positive".into(),
            ));
        }

        let split_into = if config.split_into.len() == 1 {
            vec![config.split_into[0] as usize; nd]
        } else {
            config.split_into.iter().map(|&n| n as usize).collect()
        };

        Ok(Self {
            nd,
            split_into,
            split_thresholds: config.split_thresholds,
            max_depth: config.max_depth,
            split_policy: config.split_policy,
            memory_limit_bytes: config.memory_limit_bytes,
            num_threads: config.num_threads.max(1),
            next_id: AtomicU64::new(0),
            boxes_per_depth: (0..=config.max_depth).map(|_| AtomicU64::new(0)).collect(),
            file_backend: None,
            leaf_cache: Mutex::new(LeafCache::new(config.leaf_cache_bytes)),
        })
    }

    /// Attaches a paging backend. Must happen before the controller is shared.
    pub fn with_file_backend(mut self, backend: Arc<dyn FileBackend>) -> Self {
        self.file_backend = Some(backend);
        self
    }

    #[inline]
    pub fn nd(&self) -> usize {
        self.nd
    }

    #[inline]
    pub fn split_into(&self, dim: usize) -> usize {
        self.split_into[dim]
    }

    /// Number of children of a grid box.
    pub fn grid_children(&self) -> usize {
        self.split_into.iter().product()
    }

    pub fn split_threshold(&self, depth: u32) -> u64 {
        let index = (depth as usize).min(self.split_thresholds.len() - 1);
        self.split_thresholds[index]
    }

    #[inline]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    #[inline]
    pub fn split_policy(&self) -> SplitPolicy {
        self.split_policy
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    /// True iff a box at `depth` holding `count` events must be split.
    #[inline]
    pub fn should_split(&self, count: u64, depth: u32) -> bool {
        count > self.split_threshold(depth) && depth < self.max_depth
    }

    /// Next unused box id. Ids are never reused.
    #[inline]
    pub fn allocate_id(&self) -> BoxId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of ids handed out so far.
    pub fn ids_allocated(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    pub fn track_box_created(&self, depth: u32) {
        if let Some(counter) = self.boxes_per_depth.get(depth as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn track_box_destroyed(&self, depth: u32) {
        if let Some(counter) = self.boxes_per_depth.get(depth as usize) {
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        }
    }

    /// Snapshot of live boxes at each depth `0..=max_depth`.
    pub fn boxes_per_depth(&self) -> Vec<u64> {
        self.boxes_per_depth
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    pub fn total_boxes(&self) -> u64 {
        self.boxes_per_depth().iter().sum()
    }

    /// Projected box count of a tree uniformly split down to `depth`, or
    /// `None` if it does not fit in a `u64`.
    pub fn projected_boxes(&self, depth: u32) -> Option<u64> {
        let per_level = self.grid_children() as u64;
        let mut level = 1u64;
        let mut total = 1u64;
        for _ in 0..depth {
            level = level.checked_mul(per_level)?;
            total = total.checked_add(level)?;
        }
        Some(total)
    }

    /// Pre-flight check for a uniform pre-split to `depth` with boxes of
    /// `box_size_bytes`. Returns the projected box count.
    pub fn check_presplit(&self, depth: u32, box_size_bytes: u64) -> MdResult<u64> {
        if depth > self.max_depth {
            return Err(MdError::InvalidConfiguration(format!(
                "minimum recursion depth {} exceeds max depth {}",
                depth, self.max_depth
            )));
        }
        let boxes = self.projected_boxes(depth).ok_or_else(|| {
            MdError::Resource(format!("box count for depth {} overflows", depth))
        })?;
        let bytes = boxes.checked_mul(box_size_bytes).ok_or_else(|| {
            MdError::Resource(format!("memory for {} boxes overflows", boxes))
        })?;
        if bytes > self.memory_limit_bytes {
            return Err(MdError::Resource(format!(
                "splitting to depth {} needs {} boxes ({} bytes), limit is {} bytes",
                depth, boxes, bytes, self.memory_limit_bytes
            )));
        }
        Ok(boxes)
    }

    pub fn file_backend(&self) -> Option<&Arc<dyn FileBackend>> {
        self.file_backend.as_ref()
    }

    #[inline]
    pub fn is_file_backed(&self) -> bool {
        self.file_backend.is_some()
    }

    pub fn leaf_cache(&self) -> &Mutex<LeafCache> {
        &self.leaf_cache
    }

    /// Human readable summary of the per-depth box counts.
    pub fn stats_string(&self) -> String {
        let counts = self.boxes_per_depth();
        let mut out = format!("{} boxes:", counts.iter().sum::<u64>());
        for (depth, count) in counts.iter().enumerate().filter(|&(_, &c)| c > 0) {
            out.push_str(&format!(" d{}={}", depth, count));
        }
        out
    }
}

impl std::fmt::Debug for BoxController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxController")
            .field("nd", &self.nd)
            .field("split_into", &self.split_into)
            .field("split_thresholds", &self.split_thresholds)
            .field("max_depth", &self.max_depth)
            .field("split_policy", &self.split_policy)
            .field("file_backed", &self.is_file_backed())
            .finish()
    }
}
