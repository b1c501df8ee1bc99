use std::io::Cursor;
use std::sync::Arc;

use rand::prelude::*;

use crate::config::{BuildParams, QueryParams};
use crate::metric::{Euclidean, Manhattan, Metric};
use crate::node::{Node, PointId};
use crate::persist::TreeDocument;
use crate::search::{CancelFlag, Neighbour};
use crate::store::PointStore;
use crate::trace::{TraceAction, TraceEvent};
use crate::tree::SgTree;
use crate::SgTreeError;

fn random_vector(dim: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..dim).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect()
}

fn random_store(count: usize, dim: usize, seed: u64) -> Arc<PointStore> {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows: Vec<Vec<f32>> = (0..count).map(|_| random_vector(dim, &mut rng)).collect();
    Arc::new(PointStore::from_rows(&rows).expect("store"))
}

fn build(store: &Arc<PointStore>, base: f64, parallelism: usize) -> SgTree {
    SgTree::build(
        Arc::clone(store),
        Euclidean,
        &BuildParams::new(base, parallelism),
    )
    .expect("build tree")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Distances must agree; ids must agree wherever the distance is not tied.
fn assert_same_neighbours<M: Metric>(
    tree: &SgTree<M>,
    query: &[f32],
    got: &[Neighbour],
    expected: &[Neighbour],
) {
    assert_eq!(got.len(), expected.len(), "result length");
    for (g, e) in got.iter().zip(expected) {
        let tolerance = 1e-5 * e.distance.max(1.0);
        assert!(
            (g.distance - e.distance).abs() <= tolerance,
            "distance {} vs brute force {}",
            g.distance,
            e.distance
        );
        let actual = tree
            .metric()
            .distance(query, tree.store().vector(g.id));
        assert!((actual - g.distance).abs() <= tolerance, "reported distance is not the real one");
    }
}

#[test]
fn covering_and_separation_hold_for_random_datasets() {
    init_tracing();
    let mut rng = StdRng::seed_from_u64(17);
    for round in 0..6 {
        let count = rng.gen_range(2..400);
        let dim = rng.gen_range(1..12);
        let base = rng.gen_range(1.1..2.5);
        let store = random_store(count, dim, 1000 + round);
        let tree = build(&store, base, 2);
        tree.check_invariants().unwrap_or_else(|violation| {
            panic!("round {round} (n={count}, d={dim}, base={base}): {violation}")
        });
    }
}

#[test]
fn separation_is_strict_between_siblings() {
    let store = random_store(300, 4, 5);
    let tree = build(&store, 1.3, 3);
    for node in tree.nodes() {
        for (i, &a) in node.children.iter().enumerate() {
            for &b in &node.children[i + 1..] {
                let na = &tree.nodes()[a as usize];
                let nb = &tree.nodes()[b as usize];
                assert_eq!(na.level, nb.level);
                let d = Euclidean.distance(store.vector(na.center), store.vector(nb.center));
                assert!(f64::from(d) > tree.level_radius(na.level));
            }
        }
    }
}

#[test]
fn nearest_matches_brute_force() {
    let store = random_store(800, 10, 42);
    let tree = build(&store, 1.3, 4);
    let mut rng = StdRng::seed_from_u64(43);
    for _ in 0..100 {
        let query = random_vector(10, &mut rng);
        let got = tree.nearest(&query, 1).expect("search");
        let expected = tree.brute_force_nearest(&query, 1).expect("brute force");
        assert_same_neighbours(&tree, &query, &got, &expected);
    }
}

#[test]
fn knn_is_ordered_and_complete() {
    let store = random_store(250, 6, 8);
    let tree = build(&store, 1.5, 2);
    let mut rng = StdRng::seed_from_u64(9);
    for k in [1usize, 5, 17, 250] {
        let query = random_vector(6, &mut rng);
        let got = tree.nearest(&query, k).expect("search");
        assert_eq!(got.len(), k);
        assert!(got.windows(2).all(|w| w[0].distance <= w[1].distance));

        let expected = tree.brute_force_nearest(&query, k).expect("brute force");
        assert_same_neighbours(&tree, &query, &got, &expected);

        // No point closer than the k-th distance may be missing.
        let kth = got[k - 1].distance;
        let returned: Vec<PointId> = got.iter().map(|n| n.id).collect();
        for (id, vector) in store.iter() {
            if Euclidean.distance(&query, vector) < kth * (1.0 - 1e-5) {
                assert!(returned.contains(&id), "point {id} closer than k-th result was excluded");
            }
        }
    }
}

#[test]
fn self_queries_return_themselves() {
    init_tracing();
    let store = random_store(1000, 8, 2024);
    let tree = build(&store, 1.3, 4);
    let results = tree
        .nearest_batch(&store, &QueryParams::new(1, 4))
        .expect("batch search");
    assert_eq!(results.len(), 1000);
    for (row, hit) in results.iter().enumerate() {
        assert_eq!(hit.ids, vec![row as PointId]);
        assert_eq!(hit.distances, vec![0.0]);
    }
}

#[test]
fn single_point_tree() {
    let store = Arc::new(PointStore::from_rows(&[vec![1.0, 2.0, 3.0]]).expect("store"));
    let tree = build(&store, 1.3, 1);
    assert_eq!(tree.node_count(), 1);
    let query = [4.0, 6.0, 3.0];
    let hits = tree.nearest(&query, 1).expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 0);
    assert!((hits[0].distance - 5.0).abs() < 1e-6);

    match tree.nearest(&query, 2) {
        Err(SgTreeError::InsufficientPoints {
            requested,
            available,
        }) => {
            assert_eq!(requested, 2);
            assert_eq!(available, 1);
        }
        other => panic!("expected InsufficientPoints, got {other:?}"),
    }
}

#[test]
fn zero_k_returns_nothing() {
    let store = random_store(10, 3, 1);
    let tree = build(&store, 1.3, 1);
    assert!(tree.nearest(&[0.0, 0.0, 0.0], 0).expect("search").is_empty());
}

#[test]
fn dimension_mismatch_is_reported_once_per_batch() {
    let store = random_store(50, 4, 3);
    let tree = build(&store, 1.3, 2);
    assert!(matches!(
        tree.nearest(&[0.0; 3], 1),
        Err(SgTreeError::DimensionMismatch {
            expected: 4,
            got: 3
        })
    ));
    let queries = random_store(5, 5, 4);
    assert!(matches!(
        tree.nearest_batch(&queries, &QueryParams::new(1, 2)),
        Err(SgTreeError::DimensionMismatch {
            expected: 4,
            got: 5
        })
    ));
    let queries = random_store(5, 4, 4);
    assert!(matches!(
        tree.nearest_batch(&queries, &QueryParams::new(51, 2)),
        Err(SgTreeError::InsufficientPoints { .. })
    ));
}

#[test]
fn duplicates_are_kept_and_tied() {
    let mut rows = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![3.0, -2.0]];
    rows.push(vec![1.0, 1.0]);
    rows.push(vec![1.0, 1.0]);
    rows.push(vec![-4.0, 0.5]);
    let store = Arc::new(PointStore::from_rows(&rows).expect("store"));
    let tree = build(&store, 1.3, 2);
    tree.check_invariants().expect("invariants");

    let hits = tree.nearest(&[1.0, 1.0], 3).expect("search");
    let ids: Vec<PointId> = hits.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![1, 3, 4]);
    assert!(hits.iter().all(|n| n.distance == 0.0));

    let hits = tree.nearest(&[1.1, 1.0], 1).expect("search");
    assert_eq!(hits[0].id, 1, "ties resolve to the lowest id");
}

#[test]
fn all_identical_points() {
    let rows = vec![vec![2.5, 2.5]; 20];
    let store = Arc::new(PointStore::from_rows(&rows).expect("store"));
    let tree = build(&store, 1.3, 2);
    assert_eq!(tree.node_count(), 1);
    tree.check_invariants().expect("invariants");
    let hits = tree.nearest(&[0.0, 0.0], 20).expect("search");
    let mut ids: Vec<PointId> = hits.iter().map(|n| n.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..20).collect::<Vec<PointId>>());
}

#[test]
fn build_is_independent_of_parallelism() {
    let store = random_store(1500, 12, 77);
    let serial = build(&store, 1.3, 1);
    let parallel = build(&store, 1.3, 4);
    assert_eq!(serial.nodes(), parallel.nodes());
    assert_eq!(serial.root(), parallel.root());

    let queries = random_store(50, 12, 78);
    let params = QueryParams::new(3, 1);
    let a = serial.nearest_batch(&queries, &params).expect("serial");
    let b = parallel
        .nearest_batch(&queries, &params.with_parallelism(4))
        .expect("parallel");
    assert_eq!(a, b);
}

#[test]
fn parallel_sweeps_match_serial_build() {
    // Enough candidates under the root for the parallel sweep and subtree paths.
    let store = random_store(6000, 6, 4242);
    let serial = build(&store, 1.3, 1);
    let parallel = build(&store, 1.3, 4);
    assert_eq!(serial.nodes(), parallel.nodes());
    parallel.check_invariants().expect("invariants");

    let mut rng = StdRng::seed_from_u64(4243);
    for _ in 0..50 {
        let query = random_vector(6, &mut rng);
        let got = parallel.nearest(&query, 10).expect("search");
        let expected = parallel.brute_force_nearest(&query, 10).expect("brute force");
        assert_same_neighbours(&parallel, &query, &got, &expected);
    }
}

#[test]
fn spread_points_come_from_the_top_of_the_tree() {
    let store = random_store(400, 3, 606);
    let tree = build(&store, 1.3, 2);

    let points = tree.spread_points(25);
    assert_eq!(points.len(), 25);
    assert_eq!(points[0], tree.nodes()[tree.root() as usize].center);
    let mut distinct = points.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), points.len());

    // Returned points introduced under one parent are separated at their level.
    for node in tree.nodes() {
        let chosen: Vec<&Node> = node
            .children
            .iter()
            .map(|&c| &tree.nodes()[c as usize])
            .filter(|child| points.contains(&child.center))
            .collect();
        for (i, a) in chosen.iter().enumerate() {
            for b in &chosen[i + 1..] {
                let d = Euclidean.distance(store.vector(a.center), store.vector(b.center));
                assert!(f64::from(d) > tree.level_radius(a.level));
            }
        }
    }

    assert!(tree.spread_points(0).is_empty());
    let mut all = tree.spread_points(10_000);
    assert_eq!(all.len(), 400);
    all.sort_unstable();
    assert_eq!(all, (0..400).collect::<Vec<PointId>>());
}

#[test]
fn json_round_trip_preserves_structure_and_answers() {
    let store = random_store(1000, 16, 123);
    let tree = build(&store, 1.3, 4);

    let mut buffer = Vec::new();
    tree.dump_json(&mut buffer).expect("dump");
    let loaded = SgTree::load_json(Cursor::new(buffer), Arc::clone(&store), Euclidean)
        .expect("load");

    assert_eq!(loaded.nodes(), tree.nodes());
    assert_eq!(loaded.root(), tree.root());
    assert_eq!(loaded.base(), tree.base());

    let queries = random_store(100, 16, 124);
    let params = QueryParams::new(1, 2);
    assert_eq!(
        loaded.nearest_batch(&queries, &params).expect("loaded"),
        tree.nearest_batch(&queries, &params).expect("built tree")
    );
}

#[test]
fn binary_round_trip_through_file() {
    let store = random_store(600, 16, 321);
    let tree = build(&store, 1.3, 2);
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tree.sgt");
    tree.save_to_path(&path).expect("save");

    let loaded = SgTree::load_from_path(&path, Arc::clone(&store), Euclidean).expect("load");
    assert_eq!(loaded.nodes(), tree.nodes());

    let mut rng = StdRng::seed_from_u64(322);
    for _ in 0..25 {
        let query = random_vector(16, &mut rng);
        assert_eq!(
            loaded.nearest(&query, 4).expect("loaded"),
            tree.nearest(&query, 4).expect("built tree")
        );
    }
}

#[test]
fn binary_persistence_detects_corruption() {
    let store = random_store(64, 3, 11);
    let tree = build(&store, 1.3, 1);
    let mut bytes = Vec::new();
    tree.save_to_writer(&mut bytes).expect("save");

    let mut corrupted = bytes.clone();
    let mid = corrupted.len() / 2;
    corrupted[mid] ^= 0xFF;
    let err = SgTree::load_from_reader(Cursor::new(corrupted), Arc::clone(&store), Euclidean)
        .expect_err("corrupted load");
    assert!(matches!(
        err,
        SgTreeError::InvalidPersistence(_) | SgTreeError::Io(_)
    ));

    let mut bad_magic = bytes;
    bad_magic[0] = b'X';
    let err = SgTree::load_from_reader(Cursor::new(bad_magic), store, Euclidean)
        .expect_err("bad magic");
    assert!(matches!(err, SgTreeError::InvalidPersistence(_)));
}

fn malformed_after(tree: &SgTree, store: &Arc<PointStore>, edit: impl FnOnce(&mut TreeDocument)) {
    let mut document = tree.to_document();
    edit(&mut document);
    match SgTree::from_document(document, Arc::clone(store), Euclidean) {
        Err(SgTreeError::MalformedTree(_)) => {}
        other => panic!("expected MalformedTree, got {:?}", other.map(|t| t.node_count())),
    }
}

#[test]
fn malformed_documents_are_rejected() {
    let store = random_store(120, 4, 99);
    let tree = build(&store, 1.3, 2);
    let parent = tree
        .nodes()
        .iter()
        .position(|n| n.children.len() >= 2)
        .expect("internal node");

    malformed_after(&tree, &store, |doc| {
        doc.nodes[parent].children.push(10_000);
    });
    malformed_after(&tree, &store, |doc| {
        doc.nodes[parent].center = 5_000;
    });
    malformed_after(&tree, &store, |doc| {
        let child = doc.nodes[parent].children[1] as usize;
        doc.nodes[child].level = doc.nodes[parent].level;
    });
    malformed_after(&tree, &store, |doc| {
        doc.nodes[parent].children.swap(0, 1);
    });
    malformed_after(&tree, &store, |doc| {
        let child = doc.nodes[parent].children[1];
        doc.nodes[parent].children.push(child);
    });
    malformed_after(&tree, &store, |doc| {
        doc.nodes[parent].children.pop();
    });
    malformed_after(&tree, &store, |doc| {
        doc.nodes[parent].max_child_distance = -1.0;
    });
    malformed_after(&tree, &store, |doc| {
        doc.base = 1.0;
    });
    malformed_after(&tree, &store, |doc| {
        doc.metric = "manhattan".to_string();
    });

    let other = random_store(119, 4, 99);
    match SgTree::from_document(tree.to_document(), other, Euclidean) {
        Err(SgTreeError::MalformedTree(_)) => {}
        other => panic!("expected MalformedTree, got {:?}", other.map(|t| t.node_count())),
    }
}

#[test]
fn understated_radii_are_caught_by_verified_load() {
    let store = random_store(200, 4, 515);
    let tree = build(&store, 1.3, 2);
    let mut document = tree.to_document();
    let root = document.root as usize;
    document.nodes[root].max_child_distance *= 0.5;

    assert!(SgTree::from_document(document.clone(), Arc::clone(&store), Euclidean).is_ok());
    match SgTree::from_document_verified(document, Arc::clone(&store), Euclidean) {
        Err(SgTreeError::MalformedTree(reason)) => assert!(reason.contains("max child distance")),
        other => panic!("expected MalformedTree, got {:?}", other.map(|t| t.node_count())),
    }
    assert!(SgTree::from_document_verified(tree.to_document(), store, Euclidean).is_ok());
}

#[test]
fn tracing_records_the_path_without_changing_results() {
    let store = random_store(400, 6, 55);
    let tree = build(&store, 1.3, 2);
    let mut rng = StdRng::seed_from_u64(56);
    for _ in 0..10 {
        let query = random_vector(6, &mut rng);
        let mut events: Vec<TraceEvent> = Vec::new();
        let traced = tree.nearest_traced(&query, 3, &mut events).expect("traced");
        assert_eq!(traced, tree.nearest(&query, 3).expect("plain"));

        assert_eq!(events[0].node, tree.root());
        assert_eq!(events[0].action, TraceAction::Expanded);
        for event in &events {
            let node = tree.node(event.node).expect("traced node exists");
            assert_eq!(event.center, node.center);
            assert_eq!(event.level, node.level);
            let d = Euclidean.distance(&query, store.vector(node.center));
            assert!((d - event.distance).abs() <= 1e-6 * d.max(1.0));
        }
        // Every expanded node's children are visited afterwards.
        let expanded: usize = events
            .iter()
            .filter(|e| e.action == TraceAction::Expanded)
            .map(|e| tree.nodes()[e.node as usize].children.len())
            .sum();
        assert_eq!(events.len(), expanded + 1);
    }
}

#[test]
fn batch_traces_are_written_to_file() {
    let store = random_store(200, 5, 66);
    let tree = build(&store, 1.3, 2);
    let queries = random_store(7, 5, 67);
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("queries.trace");

    let params = QueryParams::new(2, 2);
    let results = tree
        .nearest_batch_to_trace_file(&queries, &params, &path)
        .expect("traced batch");
    assert_eq!(results, tree.nearest_batch(&queries, &params).expect("plain"));

    let (_, traces) = tree.nearest_batch_traced(&queries, &params).expect("traces");
    let text = std::fs::read_to_string(&path).expect("read trace");
    let total: usize = traces.iter().map(Vec::len).sum();
    assert_eq!(text.lines().count(), total);
    let first: serde_json::Value =
        serde_json::from_str(text.lines().next().expect("first line")).expect("json");
    assert_eq!(first["query"], 0);
}

#[test]
fn cancelled_queries_stop() {
    let store = random_store(300, 4, 12);
    let tree = build(&store, 1.3, 2);
    let flag = CancelFlag::new();
    assert!(tree.nearest_with(&[0.0; 4], 1, None, Some(&flag)).is_ok());
    flag.cancel();
    assert!(matches!(
        tree.nearest_with(&[0.0; 4], 1, None, Some(&flag)),
        Err(SgTreeError::Cancelled)
    ));
    assert!(matches!(
        tree.nearest_batch_cancellable(&store, &QueryParams::new(1, 2), Some(&flag)),
        Err(SgTreeError::Cancelled)
    ));
}

#[test]
fn range_matches_brute_force() {
    let store = random_store(500, 5, 31);
    let tree = build(&store, 1.3, 2);
    let mut rng = StdRng::seed_from_u64(32);
    for radius in [0.0f32, 0.3, 0.8, 1.5] {
        let query = random_vector(5, &mut rng);
        let got: Vec<PointId> = tree
            .range(&query, radius)
            .expect("range")
            .iter()
            .map(|n| n.id)
            .collect();
        let mut expected: Vec<(f32, PointId)> = store
            .iter()
            .map(|(id, v)| (Euclidean.distance(&query, v), id))
            .filter(|(d, _)| *d <= radius)
            .collect();
        expected.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let expected: Vec<PointId> = expected.into_iter().map(|(_, id)| id).collect();
        assert_eq!(got, expected, "radius {radius}");
    }
    assert!(matches!(
        tree.range(&[0.0; 5], -1.0),
        Err(SgTreeError::InvalidConfig(_))
    ));
}

#[test]
fn furthest_matches_brute_force() {
    let store = random_store(400, 7, 71);
    let tree = build(&store, 1.3, 2);
    let mut rng = StdRng::seed_from_u64(72);
    for _ in 0..20 {
        let query = random_vector(7, &mut rng);
        let got = tree.furthest(&query).expect("furthest");
        let expected = store
            .iter()
            .map(|(id, v)| (Euclidean.distance(&query, v), id))
            .max_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)))
            .expect("non-empty");
        assert_eq!(got.id, expected.1);
        assert_eq!(got.distance, expected.0);
    }
}

#[test]
fn manhattan_metric_is_exact() {
    let store = random_store(300, 6, 88);
    let tree = SgTree::build(Arc::clone(&store), Manhattan, &BuildParams::new(1.4, 2))
        .expect("build");
    tree.check_invariants().expect("invariants");
    let mut rng = StdRng::seed_from_u64(89);
    for _ in 0..30 {
        let query = random_vector(6, &mut rng);
        let got = tree.nearest(&query, 3).expect("search");
        let expected = tree.brute_force_nearest(&query, 3).expect("brute force");
        assert_same_neighbours(&tree, &query, &got, &expected);
    }

    let mut buffer = Vec::new();
    tree.dump_json(&mut buffer).expect("dump");
    assert!(SgTree::load_json(Cursor::new(buffer.clone()), Arc::clone(&store), Manhattan).is_ok());
    assert!(matches!(
        SgTree::load_json(Cursor::new(buffer), store, Euclidean),
        Err(SgTreeError::MalformedTree(_))
    ));
}

#[test]
fn stats_describe_the_tree() {
    let store = random_store(500, 4, 14);
    let tree = build(&store, 1.3, 2);
    let stats = tree.stats();
    assert_eq!(stats.nodes, tree.node_count());
    assert_eq!(stats.points, 500);
    assert_eq!(stats.nodes_per_level.values().sum::<usize>(), stats.nodes);
    assert_eq!(stats.max_level, tree.nodes()[tree.root() as usize].level);
    assert!(stats.depth >= 2);
    assert!(stats.leaves >= 1 && stats.leaves < stats.nodes);
    assert!(stats.mean_fanout >= 2.0);
    assert_eq!(tree.subtree_points(tree.root()).len(), 500);

    assert_eq!(
        stats.distances_per_level.keys().collect::<Vec<_>>(),
        stats.nodes_per_level.keys().collect::<Vec<_>>()
    );
    let root = &tree.nodes()[tree.root() as usize];
    assert_eq!(stats.distances_per_level[&root.level].max, root.max_child_distance);
    for (&level, summary) in &stats.distances_per_level {
        assert!(summary.mean <= f64::from(summary.max) + 1e-9);
        assert!(f64::from(summary.max) <= tree.level_radius(level));
    }
}
