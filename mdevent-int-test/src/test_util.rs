use mdevent::{
    BoxController, BoxControllerConfig, BoxExtents, BoxId, BoxNode, Event, FileBackend,
    FileEventStorage, FileOffset, MdError, MdEventTree, MdResult, NodeKind,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Installs a test logger once per process.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn unit_square(size: f64) -> [BoxExtents; 2] {
    [BoxExtents::new(0.0, size), BoxExtents::new(0.0, size)]
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `n` events drawn uniformly inside `extents`, with signal 1 and error 1.
pub fn random_events<const ND: usize>(
    rng: &mut StdRng,
    extents: &[BoxExtents; ND],
    n: usize,
) -> Vec<Event<ND>> {
    (0..n)
        .map(|_| {
            let coords = std::array::from_fn(|d| rng.gen_range(extents[d].min()..extents[d].max()));
            Event::new(coords, 1.0, 1.0)
        })
        .collect()
}

/// Events on a lattice with `nx * ny` points spaced `step` apart from `origin`.
pub fn lattice_events(origin: [f64; 2], nx: usize, ny: usize, step: f64, signal: f64) -> Vec<Event<2>> {
    let mut events = Vec::with_capacity(nx * ny);
    for j in 0..ny {
        for i in 0..nx {
            let x = origin[0] + i as f64 * step;
            let y = origin[1] + j as f64 * step;
            events.push(Event::new([x, y], signal, signal));
        }
    }
    events
}

/// A tree whose controller pages leaves to `path` once more than
/// `cache_events` events are held in memory.
pub fn create_file_backed_tree<const ND: usize>(
    path: &Path,
    extents: [BoxExtents; ND],
    config: BoxControllerConfig,
    cache_events: u64,
) -> MdResult<MdEventTree<ND>> {
    let storage = Arc::new(FileEventStorage::create(path)?);
    let config = config.leaf_cache_bytes(cache_events * Event::<ND>::size_in_bytes() as u64);
    let controller = BoxController::new(ND, config)?.with_file_backend(storage);
    MdEventTree::with_controller(extents, Arc::new(controller))
}

/// Sort key giving a total order over events, for order-insensitive comparison.
pub fn sorted_events<const ND: usize>(mut events: Vec<Event<ND>>) -> Vec<Event<ND>> {
    events.sort_by(|a, b| {
        a.coords()
            .iter()
            .zip(b.coords().iter())
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.signal().total_cmp(&b.signal()))
            .then(a.error_squared().total_cmp(&b.error_squared()))
    });
    events
}

/// Asserts that every grid node's children tile it exactly.
pub fn assert_grid_tiling<const ND: usize>(node: &BoxNode<ND>) {
    if let NodeKind::Grid(grid) = node.kind() {
        let split_into = grid.split_into();
        let expected: usize = split_into.iter().product();
        assert_eq!(grid.children().len(), expected);

        for (index, child) in grid.children().iter().enumerate() {
            let mut rest = index;
            for d in 0..ND {
                let n = split_into[d];
                let cell = rest % n;
                rest /= n;
                let parent = node.extents()[d];
                let extent = child.extents()[d];
                assert_eq!(extent, parent.cell(cell, n), "child {} dim {}", index, d);
                if cell == 0 {
                    assert_eq!(extent.min(), parent.min());
                }
                if cell + 1 == n {
                    assert_eq!(extent.max(), parent.max());
                } else {
                    assert_eq!(extent.max(), parent.cell(cell + 1, n).min());
                }
            }
        }
    }
    for child in node.children() {
        assert_grid_tiling(child);
    }
}

/// `(id, depth, extents, children)` of every box in pre-order.
pub fn structure<const ND: usize>(node: &BoxNode<ND>) -> Vec<(u64, u32, Vec<(f64, f64)>, usize)> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(next) = stack.pop() {
        let extents = next.extents().iter().map(|e| (e.min(), e.max())).collect();
        out.push((next.id(), next.depth(), extents, next.num_children()));
        let mut children = next.children();
        children.reverse();
        stack.extend(children);
    }
    out
}

const NO_LEAF: BoxId = BoxId::MAX;

/// File backend that fails loads or evictions on demand.
pub struct FailingBackend {
    inner: FileEventStorage,
    failing_leaf: AtomicU64,
    fail_all_loads: AtomicBool,
    fail_evicts: AtomicBool,
}

impl FailingBackend {
    pub fn create(path: &Path) -> MdResult<Self> {
        Ok(Self {
            inner: FileEventStorage::create(path)?,
            failing_leaf: AtomicU64::new(NO_LEAF),
            fail_all_loads: AtomicBool::new(false),
            fail_evicts: AtomicBool::new(false),
        })
    }

    /// Fails every load of `leaf_id`, or none with `None`.
    pub fn fail_loads_of(&self, leaf_id: Option<BoxId>) {
        self.failing_leaf
            .store(leaf_id.unwrap_or(NO_LEAF), Ordering::SeqCst);
    }

    pub fn fail_all_loads(&self, fail: bool) {
        self.fail_all_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_evicts(&self, fail: bool) {
        self.fail_evicts.store(fail, Ordering::SeqCst);
    }

    fn injected(what: &str, leaf_id: BoxId) -> MdError {
        MdError::BackendIo(io::Error::new(
            io::ErrorKind::Other,
            format!("injected {} failure for box {}", what, leaf_id),
        ))
    }
}

impl FileBackend for FailingBackend {
    fn evict(&self, leaf_id: BoxId, records: &[f64]) -> MdResult<FileOffset> {
        if self.fail_evicts.load(Ordering::SeqCst) {
            return Err(Self::injected("evict", leaf_id));
        }
        self.inner.evict(leaf_id, records)
    }

    fn load(&self, leaf_id: BoxId, offset: FileOffset) -> MdResult<Vec<f64>> {
        if self.fail_all_loads.load(Ordering::SeqCst)
            || self.failing_leaf.load(Ordering::SeqCst) == leaf_id
        {
            return Err(Self::injected("load", leaf_id));
        }
        self.inner.load(leaf_id, offset)
    }

    fn release(&self, leaf_id: BoxId, offset: FileOffset) -> MdResult<()> {
        self.inner.release(leaf_id, offset)
    }

    fn buffer_used(&self) -> u64 {
        self.inner.buffer_used()
    }

    fn buffer_capacity(&self) -> u64 {
        self.inner.buffer_capacity()
    }

    fn flush(&self) -> MdResult<()> {
        self.inner.flush()
    }
}
