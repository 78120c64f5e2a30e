// step.rs — the unit of GPU work and the pipeline error type.
//
// A step declares which states it only reads and which it reads and writes
// in place, and performs exactly one kernel dispatch per `execute()`. It
// holds no data of its own beyond lazily built device handles (kernel,
// scratch buffers), which it creates on first use and reuses afterwards.
//
// Steps are open-ended: anything implementing `Step` can be pushed into a
// `Pipeline` as a `Box<dyn Step>`.

use thiserror::Error;

use crate::context::DeviceError;
use crate::forest::ForestError;
use crate::state::{StateId, StateStatus, StateTable};
use crate::tree_shape::TreeShapeError;

/// An executable unit with declared state dependencies.
pub trait Step {
    /// Name for logs and errors.
    fn name(&self) -> &str;

    /// States read but never modified.
    fn inputs(&self) -> &[StateId];

    /// States read and overwritten in place.
    fn input_outputs(&self) -> &[StateId];

    /// Bind the declared states and enqueue one dispatch. Read-write
    /// states hold the result once this returns.
    fn execute(&mut self, states: &mut StateTable) -> Result<(), PipelineError>;
}

/// Everything that can go wrong building or running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Shape(#[from] TreeShapeError),

    #[error(transparent)]
    Forest(#[from] ForestError),

    #[error("{step}: incompatible shapes: {detail}")]
    ShapeMismatch { step: &'static str, detail: String },

    #[error("{step}: state `{label}` passed as both a read-only input and a read-write output")]
    AliasedState { step: &'static str, label: String },

    #[error("state `{label}` is a {found}, expected a {expected}")]
    KindMismatch { label: String, expected: &'static str, found: &'static str },

    #[error("unknown {0}")]
    UnknownState(StateId),

    #[error("state `{label}` is {status} and cannot be read")]
    StateNotReady { label: String, status: StateStatus },

    #[error("state `{label}` holds {expected} elements, got {got}")]
    DataLength { label: String, expected: u64, got: u64 },

    #[error("state `{label}` has no elements")]
    EmptyState { label: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl PipelineError {
    /// `true` for usage errors caught before anything was enqueued; `false`
    /// for device and dispatch failures.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, PipelineError::Device(_))
    }
}
