// hips-forest: pointerless HIPS descriptor forests and a dependency-ordered
// GPU step pipeline.
//
// Binary HIPS descriptors are laid out as a flat binary forest whose every
// offset is computed from a `TreeShape`. Device-resident `State`s hold the
// forest and matrices; `Step`s bind them and dispatch one kernel each,
// issued in order by a `Pipeline` against an injected `ComputeContext`.

pub mod tree_shape;
pub mod forest;
pub mod context;
pub mod host;
pub mod state;
pub mod step;
pub mod pipeline;
pub mod matmul;
pub mod gpu;
