// forest.rs — host-side HIPS descriptor forest builder.
//
// Takes a flat population of leaf descriptors (each `words_per_node` u32
// words of bits) and lays them out in the pointerless forest described by a
// `TreeShape`:
//
//   1. Leaves go to the leaf level, in order.
//   2. Each internal node is the bitwise OR of its two children. A HIPS
//      node descriptor is the union of every bit set anywhere below it.
//   3. The top `n_drop_levels` levels are discarded; the remaining
//      `n_keep_nodes` nodes are stored level-major.
//
// The result is the exact byte image a forest State holds on the device.
// The reduction runs bottom-up over forest indices only, so dropped nodes
// are never materialized.

use crate::tree_shape::{TreeShape, TreeShapeError};

use thiserror::Error;

/// Errors from forest construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForestError {
    #[error(transparent)]
    Shape(#[from] TreeShapeError),

    #[error("descriptors must have at least one word")]
    ZeroWords,

    #[error("leaf data has {len} words, not a multiple of {words_per_node}")]
    RaggedLeaves { len: usize, words_per_node: u32 },

    #[error("{given} leaves supplied but the tree holds only {n_leaves}")]
    TooManyLeaves { given: usize, n_leaves: u32 },
}

/// Configuration for a descriptor forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestConfig {
    /// Leaves in the tree. Power of two in [8, 2048].
    pub n_leaves: u32,
    /// Levels kept above the leaves.
    pub n_keep_levels: u32,
    /// u32 words per descriptor.
    pub words_per_node: u32,
}

impl Default for ForestConfig {
    fn default() -> Self {
        ForestConfig {
            n_leaves: 512,
            n_keep_levels: 4,
            // 256-bit HIPS descriptor.
            words_per_node: 8,
        }
    }
}

impl ForestConfig {
    /// Validate and compute the tree shape.
    pub fn shape(&self) -> Result<TreeShape, ForestError> {
        if self.words_per_node == 0 {
            return Err(ForestError::ZeroWords);
        }
        Ok(TreeShape::new(self.n_leaves, self.n_keep_levels)?)
    }
}

/// A descriptor forest laid out in flat, level-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HipsForest {
    shape: TreeShape,
    words_per_node: u32,
    nodes: Vec<u32>,
}

impl HipsForest {
    /// Build the forest from leaf descriptors.
    ///
    /// `leaves` holds `count * words_per_node` words, `count <= n_leaves`.
    /// Missing trailing leaves are all-zero.
    pub fn from_leaves(
        shape: TreeShape,
        words_per_node: u32,
        leaves: &[u32],
    ) -> Result<Self, ForestError> {
        if words_per_node == 0 {
            return Err(ForestError::ZeroWords);
        }
        let w = words_per_node as usize;
        if leaves.len() % w != 0 {
            return Err(ForestError::RaggedLeaves { len: leaves.len(), words_per_node });
        }
        let given = leaves.len() / w;
        if given > shape.n_leaves() as usize {
            return Err(ForestError::TooManyLeaves { given, n_leaves: shape.n_leaves() });
        }

        let mut nodes = vec![0u32; shape.n_keep_nodes() as usize * w];
        let leaf0 = shape.i_keep_leaf0() as usize * w;
        nodes[leaf0..leaf0 + leaves.len()].copy_from_slice(leaves);

        // Internal nodes in descending index order: children always come
        // after their parent in level-major order.
        for k in (0..shape.i_keep_leaf0()).rev() {
            let Some((left, right)) = shape.keep_children(k) else { continue };
            let (head, tail) = nodes.split_at_mut(left as usize * w);
            let parent = &mut head[k as usize * w..(k as usize + 1) * w];
            let l = &tail[..w];
            let r = &tail[(right - left) as usize * w..(right - left + 1) as usize * w];
            for ((p, a), b) in parent.iter_mut().zip(l).zip(r) {
                *p = a | b;
            }
        }

        log::debug!(
            "built HIPS forest: {shape}, {given} leaves supplied, {words_per_node} words/node"
        );
        Ok(HipsForest { shape, words_per_node, nodes })
    }

    pub fn shape(&self) -> &TreeShape {
        &self.shape
    }

    pub fn words_per_node(&self) -> u32 {
        self.words_per_node
    }

    /// Descriptor of forest node `keep`.
    pub fn node(&self, keep: u32) -> Option<&[u32]> {
        if keep >= self.shape.n_keep_nodes() {
            return None;
        }
        let w = self.words_per_node as usize;
        let start = keep as usize * w;
        Some(&self.nodes[start..start + w])
    }

    /// Descriptor of leaf `leaf`.
    pub fn leaf(&self, leaf: u32) -> Option<&[u32]> {
        self.node(self.shape.keep_leaf_index(leaf)?)
    }

    /// Forest root descriptors, in root order.
    pub fn roots(&self) -> impl Iterator<Item = &[u32]> + '_ {
        let w = self.words_per_node as usize;
        self.nodes[..self.shape.n_tree_roots() as usize * w].chunks_exact(w)
    }

    /// The whole forest as one flat word buffer (upload image).
    pub fn as_words(&self) -> &[u32] {
        &self.nodes
    }
}
