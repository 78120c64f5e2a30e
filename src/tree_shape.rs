// tree_shape.rs — HIPS tree and forest shape calculator.
//
// A HIPS tree over `n_leaves` binary descriptors is a complete binary tree
// stored level-major in a flat array ("heap" numbering):
//
//   level 0           [0]
//   level 1         [1] [2]
//   level 2       [3] [4] [5] [6]
//   ...
//   level L   starts at 2^L - 1, holds 2^L nodes
//
// Children of node i are 2i+1 and 2i+2, parent is (i-1)/2. No pointers.
//
// DROPPING LEVELS
// ───────────────
// Near the root, descriptors from unrelated leaves have not diverged enough
// for a per-node comparison to pay off. The top `n_drop_levels` levels are
// therefore removed. What remains is a forest of `n_tree_roots` subtrees,
// each `n_keep_levels` levels deep above the leaves:
//
//   full tree (16 leaves)          forest (keep 2 levels)
//             0
//         1       2                    (dropped)
//       3   4   5   6               r0  r1  r2  r3      <- forest roots
//      .. .. .. .. ..              ..  ..  ..  ..
//      15 ......... 30              12 ........ 27      <- leaves
//
// The forest uses the same level-major order, shifted down by the number of
// dropped nodes. Within each kept level the descendants of one root occupy
// a contiguous, power-of-two-aligned span, so kernels compute every offset
// from the constants below with integer arithmetic alone.
//
// NEW RUST CONCEPTS:
// - Private fields + getters — the Rust way to say "computed once at
//   construction, read-only afterwards". `Copy` is fine: it's 11 integers.
// - `#[repr(C)]` + `bytemuck::Pod` — lets `TreeShapeUniform` be uploaded
//   verbatim as a WGSL uniform struct.

use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// Smallest legal leaf count.
pub const MIN_LEAVES: u32 = 8;
/// Largest legal leaf count.
pub const MAX_LEAVES: u32 = 2048;
/// Smallest legal number of kept levels.
pub const MIN_KEEP_LEVELS: u32 = 2;

/// Number of `u32` words produced by [`TreeShape::to_words`].
pub const SHAPE_WORDS: usize = 8;

/// Precondition violations when constructing a [`TreeShape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeShapeError {
    #[error("leaf count {0} is not a power of two")]
    LeavesNotPowerOfTwo(u32),

    #[error("leaf count {n_leaves} outside [8, 2048]")]
    LeavesOutOfRange { n_leaves: u32 },

    #[error("kept levels {n_keep_levels} outside [2, {n_tree_levels})")]
    KeepLevelsOutOfRange { n_keep_levels: u32, n_tree_levels: u32 },

    #[error("serialized shape words do not match a shape built from ({n_leaves}, {n_keep_levels})")]
    WordsMismatch { n_leaves: u32, n_keep_levels: u32 },
}

/// Geometry of a HIPS tree and of the forest kept after dropping its top
/// levels. Immutable once built; every field is a pure function of
/// `(n_leaves, n_keep_levels)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeShape {
    n_leaves: u32,
    n_keep_levels: u32,
    n_tree_levels: u32,
    n_full_nodes: u32,
    n_tree_nodes: u32,
    n_drop_levels: u32,
    n_tree_roots: u32,
    n_drop_nodes: u32,
    n_keep_nodes: u32,
    i_tree_leaf0: u32,
    i_keep_leaf0: u32,
}

impl TreeShape {
    /// Calculate the shape for `n_leaves` leaves keeping `n_keep_levels`
    /// levels above the leaves.
    ///
    /// Preconditions: `n_leaves` is a power of two in `[8, 2048]` and
    /// `2 <= n_keep_levels < log2(n_leaves)`.
    pub fn new(n_leaves: u32, n_keep_levels: u32) -> Result<Self, TreeShapeError> {
        if !n_leaves.is_power_of_two() {
            return Err(TreeShapeError::LeavesNotPowerOfTwo(n_leaves));
        }
        if !(MIN_LEAVES..=MAX_LEAVES).contains(&n_leaves) {
            return Err(TreeShapeError::LeavesOutOfRange { n_leaves });
        }

        let n_tree_levels = n_leaves.trailing_zeros();
        if n_keep_levels < MIN_KEEP_LEVELS || n_keep_levels >= n_tree_levels {
            return Err(TreeShapeError::KeepLevelsOutOfRange { n_keep_levels, n_tree_levels });
        }

        let n_tree_nodes = 2 * n_leaves - 1;
        let n_full_nodes = n_tree_nodes.next_power_of_two();
        let n_drop_levels = n_tree_levels - n_keep_levels;
        let n_tree_roots = 1u32 << n_drop_levels;
        // Levels 0..n_drop_levels hold 1 + 2 + ... + 2^(n_drop_levels-1) nodes.
        let n_drop_nodes = n_tree_roots - 1;
        let n_keep_nodes = n_tree_nodes - n_drop_nodes;
        let i_tree_leaf0 = n_tree_nodes - n_leaves;
        let i_keep_leaf0 = i_tree_leaf0 - n_drop_nodes;

        Ok(TreeShape {
            n_leaves,
            n_keep_levels,
            n_tree_levels,
            n_full_nodes,
            n_tree_nodes,
            n_drop_levels,
            n_tree_roots,
            n_drop_nodes,
            n_keep_nodes,
            i_tree_leaf0,
            i_keep_leaf0,
        })
    }

    /// Leaves in the HIPS tree.
    pub fn n_leaves(&self) -> u32 { self.n_leaves }
    /// Levels kept above the leaves.
    pub fn n_keep_levels(&self) -> u32 { self.n_keep_levels }
    /// Levels in the full tree, `log2(n_leaves)`. The leaf level is
    /// numbered `n_tree_levels`, the root level 0.
    pub fn n_tree_levels(&self) -> u32 { self.n_tree_levels }
    /// Full-tree node count rounded up to a power of two (allocation unit).
    pub fn n_full_nodes(&self) -> u32 { self.n_full_nodes }
    /// Exact node count of the full tree, `2 * n_leaves - 1`.
    pub fn n_tree_nodes(&self) -> u32 { self.n_tree_nodes }
    /// Levels dropped from the root side.
    pub fn n_drop_levels(&self) -> u32 { self.n_drop_levels }
    /// Forest roots, `2^n_drop_levels`.
    pub fn n_tree_roots(&self) -> u32 { self.n_tree_roots }
    /// Nodes in the dropped levels.
    pub fn n_drop_nodes(&self) -> u32 { self.n_drop_nodes }
    /// Nodes stored in the forest.
    pub fn n_keep_nodes(&self) -> u32 { self.n_keep_nodes }
    /// Flat index of the first leaf in the full tree.
    pub fn i_tree_leaf0(&self) -> u32 { self.i_tree_leaf0 }
    /// Flat index of the first leaf in the forest.
    pub fn i_keep_leaf0(&self) -> u32 { self.i_keep_leaf0 }

    // -----------------------------------------------------------------------
    // Flat-offset arithmetic
    // -----------------------------------------------------------------------

    /// Nodes at `level` of the full tree.
    pub fn level_width(&self, level: u32) -> Option<u32> {
        (level <= self.n_tree_levels).then(|| 1 << level)
    }

    /// Full-tree index of the first node at `level`.
    pub fn level_offset(&self, level: u32) -> Option<u32> {
        (level <= self.n_tree_levels).then(|| (1 << level) - 1)
    }

    /// Forest index of the first node at `level`. `None` for dropped levels.
    pub fn keep_level_offset(&self, level: u32) -> Option<u32> {
        if level < self.n_drop_levels {
            return None;
        }
        self.level_offset(level).map(|i| i - self.n_drop_nodes)
    }

    /// Full-tree index of leaf `leaf`.
    pub fn leaf_index(&self, leaf: u32) -> Option<u32> {
        (leaf < self.n_leaves).then(|| self.i_tree_leaf0 + leaf)
    }

    /// Forest index of leaf `leaf`.
    pub fn keep_leaf_index(&self, leaf: u32) -> Option<u32> {
        (leaf < self.n_leaves).then(|| self.i_keep_leaf0 + leaf)
    }

    /// Translate a full-tree index to a forest index. `None` if the node
    /// was dropped or is out of range.
    pub fn full_to_keep(&self, full: u32) -> Option<u32> {
        (full >= self.n_drop_nodes && full < self.n_tree_nodes).then(|| full - self.n_drop_nodes)
    }

    /// Translate a forest index back to the full-tree index.
    pub fn keep_to_full(&self, keep: u32) -> Option<u32> {
        (keep < self.n_keep_nodes).then(|| keep + self.n_drop_nodes)
    }

    /// Parent of forest node `keep`. `None` for forest roots.
    pub fn keep_parent(&self, keep: u32) -> Option<u32> {
        if keep < self.n_tree_roots {
            return None;
        }
        let full = self.keep_to_full(keep)?;
        self.full_to_keep((full - 1) / 2)
    }

    /// Children of forest node `keep`. `None` for leaves.
    pub fn keep_children(&self, keep: u32) -> Option<(u32, u32)> {
        if keep >= self.i_keep_leaf0 {
            return None;
        }
        let full = self.keep_to_full(keep)?;
        Some((2 * full + 1 - self.n_drop_nodes, 2 * full + 2 - self.n_drop_nodes))
    }

    /// Forest root (0-based, `< n_tree_roots`) whose subtree holds `leaf`.
    pub fn root_of_leaf(&self, leaf: u32) -> Option<u32> {
        (leaf < self.n_leaves).then(|| leaf >> self.n_keep_levels)
    }

    /// Forest indices at `level` that belong to the subtree of `root`.
    pub fn subtree_span(&self, root: u32, level: u32) -> Option<Range<u32>> {
        if root >= self.n_tree_roots || level < self.n_drop_levels {
            return None;
        }
        let offset = self.keep_level_offset(level)?;
        let width = 1u32 << (level - self.n_drop_levels);
        let start = offset + root * width;
        Some(start..start + width)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Serialize as eight words:
    /// `[n_leaves, n_keep_levels, n_tree_levels, n_full_nodes,
    ///   n_tree_roots, n_keep_nodes, i_tree_leaf0, i_keep_leaf0]`.
    pub fn to_words(&self) -> [u32; SHAPE_WORDS] {
        [
            self.n_leaves,
            self.n_keep_levels,
            self.n_tree_levels,
            self.n_full_nodes,
            self.n_tree_roots,
            self.n_keep_nodes,
            self.i_tree_leaf0,
            self.i_keep_leaf0,
        ]
    }

    /// Rebuild a shape from [`to_words`](Self::to_words) output. The first
    /// two words are the inputs; the rest must agree with the recomputation.
    pub fn from_words(words: &[u32; SHAPE_WORDS]) -> Result<Self, TreeShapeError> {
        let shape = TreeShape::new(words[0], words[1])?;
        if shape.to_words() != *words {
            return Err(TreeShapeError::WordsMismatch {
                n_leaves: words[0],
                n_keep_levels: words[1],
            });
        }
        Ok(shape)
    }

    /// Uniform block for kernels that walk the forest.
    pub fn uniform(&self) -> TreeShapeUniform {
        let w = self.to_words();
        TreeShapeUniform {
            n_leaves: w[0],
            n_keep_levels: w[1],
            n_tree_levels: w[2],
            n_full_nodes: w[3],
            n_tree_roots: w[4],
            n_keep_nodes: w[5],
            i_tree_leaf0: w[6],
            i_keep_leaf0: w[7],
        }
    }
}

impl fmt::Display for TreeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} leaves, {} levels ({} dropped, {} kept), {} roots, {}/{} nodes kept",
            self.n_leaves,
            self.n_tree_levels,
            self.n_drop_levels,
            self.n_keep_levels,
            self.n_tree_roots,
            self.n_keep_nodes,
            self.n_tree_nodes,
        )
    }
}

/// Shape constants as a WGSL-compatible uniform (32 bytes, must match
/// `struct TreeShape` in any forest shader field-for-field).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TreeShapeUniform {
    pub n_leaves: u32,
    pub n_keep_levels: u32,
    pub n_tree_levels: u32,
    pub n_full_nodes: u32,
    pub n_tree_roots: u32,
    pub n_keep_nodes: u32,
    pub i_tree_leaf0: u32,
    pub i_keep_leaf0: u32,
}
