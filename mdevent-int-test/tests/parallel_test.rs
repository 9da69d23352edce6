//! Task-parallel passes agree with their sequential counterparts.

use mdevent::{BoxControllerConfig, BoxExtents, MdEventTree, TaskScheduler};
use mdevent_int_test::test_util::{init_logger, random_events, seeded_rng, structure};

fn config() -> BoxControllerConfig {
    BoxControllerConfig::new()
        .split_into(vec![2])
        .split_thresholds(vec![40])
        .max_depth(6)
        .num_threads(4)
}

#[test]
fn test_parallel_build_matches_sequential() {
    init_logger();
    let extents = [BoxExtents::new(0.0, 1.0); 3];
    let events = random_events(&mut seeded_rng(3), &extents, 20_000);

    let mut sequential = MdEventTree::new(extents, config()).unwrap();
    sequential.insert_batch(&events).unwrap();
    sequential.split_all(None).unwrap();
    let expected = sequential.refresh().unwrap();

    let mut tree = MdEventTree::new(extents, config()).unwrap();
    let scheduler = TaskScheduler::from_controller(tree.controller());
    assert_eq!(scheduler.num_threads(), 4);
    tree.insert_batch(&events).unwrap();
    tree.split_all(Some(&scheduler)).unwrap();
    let actual = tree.refresh_with(&scheduler).unwrap();

    assert_eq!(actual.count, expected.count);
    assert!((actual.signal - expected.signal).abs() < 1e-6);
    assert_eq!(tree.stats(), sequential.stats());
    // Ids are handed out in task order, so compare shapes only.
    let shape = |t: &MdEventTree<3>| {
        structure(t.root())
            .into_iter()
            .map(|(_, depth, extents, children)| (depth, extents, children))
            .collect::<Vec<_>>()
    };
    assert_eq!(shape(&tree), shape(&sequential));
}

#[test]
fn test_parallel_insert_into_presplit_tree() {
    init_logger();
    let extents = [BoxExtents::new(0.0, 1.0); 3];
    let scheduler = TaskScheduler::new(3);
    let mut tree = MdEventTree::new(extents, config()).unwrap();
    tree.set_min_recursion_depth(2).unwrap();
    assert_eq!(tree.stats().leaf_boxes, 64);

    let mut rng = seeded_rng(17);
    for _ in 0..4 {
        let batch = random_events(&mut rng, &extents, 5_000);
        tree.insert_batch_parallel(&batch, &scheduler).unwrap();
        tree.split_all(Some(&scheduler)).unwrap();
    }
    assert_eq!(tree.refresh_with(&scheduler).unwrap().count, 20_000);
    assert_eq!(tree.total_events(), 20_000);
}
