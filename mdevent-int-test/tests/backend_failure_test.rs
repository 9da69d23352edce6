//! Backend failures surface as errors and never lose events.

use mdevent::{BoxController, BoxControllerConfig, Event, MdError, MdEventTree, TaskScheduler};
use mdevent_int_test::test_util::{init_logger, lattice_events, sorted_events, unit_square, FailingBackend};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn config() -> BoxControllerConfig {
    BoxControllerConfig::new()
        .split_into(vec![2])
        .split_thresholds(vec![20])
        .max_depth(4)
        .leaf_cache_bytes(1_000 * Event::<2>::size_in_bytes() as u64)
}

/// Four quadrant leaves holding 100 paged events each.
fn paged_quadrants() -> (TempDir, Arc<FailingBackend>, MdEventTree<2>) {
    let dir = tempdir().unwrap();
    let backend = Arc::new(FailingBackend::create(&dir.path().join("failing.bin")).unwrap());
    let controller = BoxController::new(2, config())
        .unwrap()
        .with_file_backend(backend.clone());
    let mut tree = MdEventTree::with_controller(unit_square(10.0), Arc::new(controller)).unwrap();
    tree.set_min_recursion_depth(1).unwrap();
    tree.insert_batch(&lattice_events([0.25, 0.25], 20, 20, 0.5, 1.0))
        .unwrap();
    tree.flush().unwrap();
    assert_eq!(tree.stats().events_on_disk, 400);
    (dir, backend, tree)
}

#[test]
fn test_failed_split_keeps_progress_and_can_rerun() {
    init_logger();
    let (_dir, backend, mut tree) = paged_quadrants();
    let ids: Vec<u64> = tree.root().children().iter().map(|c| c.id()).collect();
    backend.fail_loads_of(Some(ids[2]));

    let err = tree.split_all(None).unwrap_err();
    assert!(matches!(err, MdError::BackendIo(_)), "{err}");

    let children = tree.root().children();
    assert!(!children[0].is_leaf());
    assert!(!children[1].is_leaf());
    assert!(children[2].is_leaf());
    assert_eq!(children[2].id(), ids[2]);
    assert_eq!(children[2].as_leaf().unwrap().events_on_disk(), 100);
    assert_eq!(tree.total_events(), 400);

    backend.fail_loads_of(None);
    tree.split_all(None).unwrap();
    assert!(tree.root().children().iter().all(|c| !c.is_leaf()));
    assert_eq!(tree.refresh().unwrap().count, 400);
    assert_eq!(
        sorted_events(tree.all_events().unwrap()),
        sorted_events(lattice_events([0.25, 0.25], 20, 20, 0.5, 1.0))
    );
}

#[test]
fn test_load_failure_is_reported_by_reads() {
    init_logger();
    let (_dir, backend, mut tree) = paged_quadrants();
    assert_eq!(tree.refresh().unwrap().count, 400);

    backend.fail_all_loads(true);
    assert!(matches!(tree.refresh(), Err(MdError::BackendIo(_))));
    let scheduler = TaskScheduler::new(2);
    assert!(matches!(
        tree.refresh_with(&scheduler),
        Err(MdError::BackendIo(_))
    ));
    assert!(matches!(
        tree.bin_range(&[0.3, 0.3], &[7.7, 7.7]),
        Err(MdError::BackendIo(_))
    ));
    assert!(tree.all_events().is_err());

    backend.fail_all_loads(false);
    assert_eq!(tree.refresh().unwrap().count, 400);
    let expected = lattice_events([0.25, 0.25], 20, 20, 0.5, 1.0)
        .iter()
        .filter(|e| (0..2).all(|d| 0.3 <= e.coord(d) && e.coord(d) < 7.7))
        .count() as f64;
    assert_eq!(tree.bin_range(&[0.3, 0.3], &[7.7, 7.7]).unwrap().0, expected);
}

#[test]
fn test_evict_failure_keeps_events_in_memory() {
    init_logger();
    let dir = tempdir().unwrap();
    let backend = Arc::new(FailingBackend::create(&dir.path().join("evict.bin")).unwrap());
    let controller = BoxController::new(2, config().leaf_cache_bytes(0))
        .unwrap()
        .with_file_backend(backend.clone());
    let mut tree = MdEventTree::with_controller(unit_square(10.0), Arc::new(controller)).unwrap();
    tree.set_min_recursion_depth(1).unwrap();
    tree.insert_batch(&lattice_events([0.25, 0.25], 4, 4, 0.5, 1.0))
        .unwrap();
    assert_eq!(tree.stats().events_on_disk, 16);

    backend.fail_evicts(true);
    let err = tree
        .insert_batch(&lattice_events([5.25, 5.25], 4, 4, 0.5, 1.0))
        .unwrap_err();
    assert!(matches!(err, MdError::BackendIo(_)), "{err}");
    let stats = tree.stats();
    assert_eq!(stats.events_in_memory, 16);
    assert_eq!(stats.events_in_memory + stats.events_on_disk, 32);

    backend.fail_evicts(false);
    tree.flush().unwrap();
    let stats = tree.stats();
    assert_eq!(stats.events_on_disk, 32);
    assert_eq!(tree.refresh().unwrap().count, 32);
}
