// state.rs — device-resident states and the table that owns them.
//
// A State is a device buffer tagged with what it holds:
//
//   Matrix      rows × cols f32, row-major
//   Descriptors count × words u32 (flat leaf population)
//   Forest      n_keep_nodes × words u32, laid out by a TreeShape
//
// The kind carries enough shape metadata for a step to validate its
// arguments before anything is dispatched.
//
// LIFECYCLE
// ─────────
//   Uninitialized ──write──▶ Populated ──invalidate──▶ Invalid
//                               ▲                        │
//                               └─────────write──────────┘
//
// Only the owner (via `StateTable`) writes or invalidates. A step moves a
// read-write state to Populated after its dispatch and never invalidates.
//
// The `StateTable` owns every buffer and releases them on drop. Steps name
// states by `StateId` and borrow the table mutably only for the duration of
// `execute()`, which is what lets several steps share one state.

use std::fmt;
use std::rc::Rc;

use crate::context::{bytes_to_words, words_as_bytes, BufferHandle, ComputeContext};
use crate::forest::HipsForest;
use crate::step::PipelineError;
use crate::tree_shape::TreeShape;

/// Index of a state within its `StateTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) usize);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// What a state holds, with its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Matrix { rows: u32, cols: u32 },
    Descriptors { count: u32, words: u32 },
    Forest { shape: TreeShape, words: u32 },
}

impl StateKind {
    /// Number of 4-byte elements.
    pub fn elements(&self) -> u64 {
        match *self {
            StateKind::Matrix { rows, cols } => rows as u64 * cols as u64,
            StateKind::Descriptors { count, words } => count as u64 * words as u64,
            StateKind::Forest { shape, words } => shape.n_keep_nodes() as u64 * words as u64,
        }
    }

    /// Buffer size in bytes.
    pub fn byte_size(&self) -> u64 {
        self.elements() * 4
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StateKind::Matrix { .. } => "matrix",
            StateKind::Descriptors { .. } => "descriptor buffer",
            StateKind::Forest { .. } => "descriptor forest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateStatus {
    Uninitialized,
    Populated,
    Invalid,
}

impl fmt::Display for StateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateStatus::Uninitialized => write!(f, "uninitialized"),
            StateStatus::Populated => write!(f, "populated"),
            StateStatus::Invalid => write!(f, "invalid"),
        }
    }
}

/// One device-resident state.
#[derive(Debug)]
pub struct State {
    label: String,
    kind: StateKind,
    buffer: BufferHandle,
    status: StateStatus,
}

impl State {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn status(&self) -> StateStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == StateStatus::Populated
    }
}

/// Owner of all states in a pipeline.
pub struct StateTable {
    ctx: Rc<dyn ComputeContext>,
    states: Vec<State>,
}

impl StateTable {
    pub fn new(ctx: Rc<dyn ComputeContext>) -> Self {
        StateTable { ctx, states: Vec::new() }
    }

    pub fn context(&self) -> &Rc<dyn ComputeContext> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Allocate a zeroed, uninitialized state.
    pub fn add(&mut self, label: &str, kind: StateKind) -> Result<StateId, PipelineError> {
        if kind.elements() == 0 {
            return Err(PipelineError::EmptyState { label: label.to_string() });
        }
        let buffer = self.ctx.create_buffer(label, kind.byte_size())?;
        let id = StateId(self.states.len());
        log::debug!("{id} `{label}`: {} ({} bytes) on {}", kind.kind_name(), kind.byte_size(), self.ctx.name());
        self.states.push(State {
            label: label.to_string(),
            kind,
            buffer,
            status: StateStatus::Uninitialized,
        });
        Ok(id)
    }

    pub fn add_matrix(&mut self, label: &str, rows: u32, cols: u32) -> Result<StateId, PipelineError> {
        self.add(label, StateKind::Matrix { rows, cols })
    }

    pub fn add_descriptors(&mut self, label: &str, count: u32, words: u32) -> Result<StateId, PipelineError> {
        self.add(label, StateKind::Descriptors { count, words })
    }

    /// Allocate a forest state and upload `forest` into it.
    pub fn add_forest(&mut self, label: &str, forest: &HipsForest) -> Result<StateId, PipelineError> {
        let id = self.add(label, StateKind::Forest {
            shape: *forest.shape(),
            words: forest.words_per_node(),
        })?;
        self.write_words(id, forest.as_words())?;
        Ok(id)
    }

    pub fn get(&self, id: StateId) -> Result<&State, PipelineError> {
        self.states.get(id.0).ok_or(PipelineError::UnknownState(id))
    }

    fn get_mut(&mut self, id: StateId) -> Result<&mut State, PipelineError> {
        self.states.get_mut(id.0).ok_or(PipelineError::UnknownState(id))
    }

    pub fn kind(&self, id: StateId) -> Result<StateKind, PipelineError> {
        Ok(self.get(id)?.kind)
    }

    pub fn status(&self, id: StateId) -> Result<StateStatus, PipelineError> {
        Ok(self.get(id)?.status)
    }

    /// `(rows, cols)` of a matrix state.
    pub fn matrix_dims(&self, id: StateId) -> Result<(u32, u32), PipelineError> {
        let state = self.get(id)?;
        match state.kind {
            StateKind::Matrix { rows, cols } => Ok((rows, cols)),
            other => Err(PipelineError::KindMismatch {
                label: state.label.clone(),
                expected: "matrix",
                found: other.kind_name(),
            }),
        }
    }

    /// The state, provided it holds readable data.
    pub fn require_ready(&self, id: StateId) -> Result<&State, PipelineError> {
        let state = self.get(id)?;
        if !state.is_ready() {
            return Err(PipelineError::StateNotReady {
                label: state.label.clone(),
                status: state.status,
            });
        }
        Ok(state)
    }

    /// Upload a row-major matrix.
    pub fn write_matrix(&mut self, id: StateId, data: &[f32]) -> Result<(), PipelineError> {
        self.matrix_dims(id)?;
        self.write_elements(id, data)
    }

    /// Upload descriptor or forest words.
    pub fn write_words(&mut self, id: StateId, data: &[u32]) -> Result<(), PipelineError> {
        self.require_word_kind(id)?;
        self.write_elements(id, data)
    }

    pub fn read_matrix(&self, id: StateId) -> Result<Vec<f32>, PipelineError> {
        self.matrix_dims(id)?;
        let state = self.require_ready(id)?;
        Ok(bytes_to_words(&self.ctx.read_buffer(state.buffer)?))
    }

    pub fn read_words(&self, id: StateId) -> Result<Vec<u32>, PipelineError> {
        self.require_word_kind(id)?;
        let state = self.require_ready(id)?;
        Ok(bytes_to_words(&self.ctx.read_buffer(state.buffer)?))
    }

    /// Mark a state stale. Reads fail until it is written again.
    pub fn invalidate(&mut self, id: StateId) -> Result<(), PipelineError> {
        let state = self.get_mut(id)?;
        log::debug!("{id} `{}` invalidated", state.label);
        state.status = StateStatus::Invalid;
        Ok(())
    }

    /// Record that a step has written `id`.
    pub(crate) fn mark_written(&mut self, id: StateId) -> Result<(), PipelineError> {
        self.get_mut(id)?.status = StateStatus::Populated;
        Ok(())
    }

    fn require_word_kind(&self, id: StateId) -> Result<(), PipelineError> {
        let state = self.get(id)?;
        match state.kind {
            StateKind::Descriptors { .. } | StateKind::Forest { .. } => Ok(()),
            StateKind::Matrix { .. } => Err(PipelineError::KindMismatch {
                label: state.label.clone(),
                expected: "descriptor buffer or forest",
                found: "matrix",
            }),
        }
    }

    fn write_elements<T: bytemuck::Pod>(&mut self, id: StateId, data: &[T]) -> Result<(), PipelineError> {
        let state = self.get(id)?;
        let expected = state.kind.elements();
        if data.len() as u64 != expected {
            return Err(PipelineError::DataLength {
                label: state.label.clone(),
                expected,
                got: data.len() as u64,
            });
        }
        self.ctx.write_buffer(state.buffer, words_as_bytes(data))?;
        self.mark_written(id)
    }
}

impl Drop for StateTable {
    fn drop(&mut self) {
        for state in &self.states {
            self.ctx.release_buffer(state.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;

    fn table() -> (Rc<HostContext>, StateTable) {
        let host = Rc::new(HostContext::new());
        let ctx: Rc<dyn ComputeContext> = host.clone();
        (host, StateTable::new(ctx))
    }

    #[test]
    fn test_lifecycle() {
        let (_host, mut states) = table();
        let m = states.add_matrix("M", 2, 2).unwrap();
        assert_eq!(states.status(m).unwrap(), StateStatus::Uninitialized);
        assert!(matches!(states.read_matrix(m), Err(PipelineError::StateNotReady { .. })));

        states.write_matrix(m, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(states.status(m).unwrap(), StateStatus::Populated);
        assert_eq!(states.read_matrix(m).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

        states.invalidate(m).unwrap();
        assert!(matches!(
            states.read_matrix(m),
            Err(PipelineError::StateNotReady { status: StateStatus::Invalid, .. })
        ));

        states.write_matrix(m, &[0.0; 4]).unwrap();
        assert_eq!(states.status(m).unwrap(), StateStatus::Populated);
    }

    #[test]
    fn test_write_checks_length_and_kind() {
        let (_host, mut states) = table();
        let m = states.add_matrix("M", 2, 3).unwrap();
        let d = states.add_descriptors("D", 4, 2).unwrap();

        assert!(matches!(
            states.write_matrix(m, &[0.0; 5]),
            Err(PipelineError::DataLength { expected: 6, got: 5, .. })
        ));
        assert!(matches!(states.write_words(m, &[0; 6]), Err(PipelineError::KindMismatch { .. })));
        assert!(matches!(states.write_matrix(d, &[0.0; 8]), Err(PipelineError::KindMismatch { .. })));

        states.write_words(d, &[7; 8]).unwrap();
        assert_eq!(states.read_words(d).unwrap(), vec![7; 8]);
    }

    #[test]
    fn test_empty_state_rejected() {
        let (host, mut states) = table();
        assert!(matches!(states.add_matrix("E", 0, 4), Err(PipelineError::EmptyState { .. })));
        assert_eq!(host.live_buffers(), 0);
    }

    #[test]
    fn test_forest_state_sized_by_shape() {
        let (_host, mut states) = table();
        let shape = TreeShape::new(16, 2).unwrap();
        let forest = HipsForest::from_leaves(shape, 2, &[0xff; 32]).unwrap();
        let f = states.add_forest("forest", &forest).unwrap();
        assert_eq!(states.kind(f).unwrap().elements(), 28 * 2);
        assert_eq!(states.read_words(f).unwrap(), forest.as_words());
    }

    #[test]
    fn test_drop_releases_buffers() {
        let (host, mut states) = table();
        states.add_matrix("A", 4, 4).unwrap();
        states.add_descriptors("D", 8, 8).unwrap();
        assert_eq!(host.live_buffers(), 2);
        drop(states);
        assert_eq!(host.live_buffers(), 0);
    }

    #[test]
    fn test_unknown_state() {
        let (_host, states) = table();
        assert!(matches!(states.get(StateId(3)), Err(PipelineError::UnknownState(StateId(3)))));
    }
}
