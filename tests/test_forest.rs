// tests/test_forest.rs — Integration tests for the descriptor forest layout.

use hips_forest::forest::{ForestConfig, ForestError, HipsForest};
use hips_forest::tree_shape::TreeShape;

/// Deterministic pseudo-random descriptors (LCG, no external RNG).
fn random_leaves(n: usize, words: usize, seed: u32) -> Vec<u32> {
    let mut rng = seed;
    (0..n * words)
        .map(|_| {
            rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
            // Sparse bits so that unions stay informative.
            rng & (rng >> 7) & (rng >> 13)
        })
        .collect()
}

#[test]
fn every_node_is_union_of_children() {
    let shape = TreeShape::new(64, 3).unwrap();
    let leaves = random_leaves(64, 4, 7);
    let forest = HipsForest::from_leaves(shape, 4, &leaves).unwrap();

    for k in 0..shape.i_keep_leaf0() {
        let (l, r) = shape.keep_children(k).unwrap();
        let expect: Vec<u32> = forest
            .node(l)
            .unwrap()
            .iter()
            .zip(forest.node(r).unwrap())
            .map(|(a, b)| a | b)
            .collect();
        assert_eq!(forest.node(k).unwrap(), &expect[..], "node {k}");
    }
}

#[test]
fn roots_cover_their_leaves() {
    let shape = TreeShape::new(128, 2).unwrap();
    let leaves = random_leaves(128, 2, 11);
    let forest = HipsForest::from_leaves(shape, 2, &leaves).unwrap();
    let roots: Vec<&[u32]> = forest.roots().collect();
    assert_eq!(roots.len() as u32, shape.n_tree_roots());

    for leaf in 0..128 {
        let root = roots[shape.root_of_leaf(leaf).unwrap() as usize];
        let d = forest.leaf(leaf).unwrap();
        for (rw, lw) in root.iter().zip(d) {
            assert_eq!(rw & lw, *lw, "leaf {leaf} has bits its root lacks");
        }
    }
}

#[test]
fn forest_size_matches_shape() {
    let cfg = ForestConfig::default();
    let shape = cfg.shape().unwrap();
    let leaves = random_leaves(shape.n_leaves() as usize, cfg.words_per_node as usize, 3);
    let forest = HipsForest::from_leaves(shape, cfg.words_per_node, &leaves).unwrap();
    assert_eq!(
        forest.as_words().len(),
        (shape.n_keep_nodes() * cfg.words_per_node) as usize
    );
}

#[test]
fn bad_config_reports_shape_error() {
    let cfg = ForestConfig { n_leaves: 100, ..ForestConfig::default() };
    assert!(matches!(cfg.shape(), Err(ForestError::Shape(_))));
    let cfg = ForestConfig { words_per_node: 0, ..ForestConfig::default() };
    assert_eq!(cfg.shape().unwrap_err(), ForestError::ZeroWords);
}
