// pipeline.rs — issue-ordered execution of steps against shared states.
//
// The controlling thread calls `run()`, which executes every step in the
// order it was pushed. Each step enqueues onto the context's in-order
// queue, so a step that reads a state written by an earlier step always
// observes the finished write. There is no reordering and no controller-side
// concurrency; the only overlap is controller vs device.
//
// Before anything is enqueued, `run()` walks the steps once and checks that
// every state a step reads is either populated by its owner or written by an
// earlier step. A pipeline that would read garbage fails with
// `StateNotReady` without touching the device.
//
// Errors abort the run. Nothing is retried and nothing falls back.

use std::collections::HashSet;
use std::rc::Rc;

use crate::context::ComputeContext;
use crate::state::{StateId, StateTable};
use crate::step::{PipelineError, Step};

/// "Step `step` depends on step `on`": `step` reads or writes a state
/// that `on` wrote, and `on` was issued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub step: usize,
    pub on: usize,
    pub state: StateId,
}

/// A state table plus the steps that run against it.
pub struct Pipeline {
    // Steps hold scratch buffers; drop them before the states' context.
    steps: Vec<Box<dyn Step>>,
    states: StateTable,
}

impl Pipeline {
    pub fn new(ctx: Rc<dyn ComputeContext>) -> Self {
        Pipeline { steps: Vec::new(), states: StateTable::new(ctx) }
    }

    pub fn context(&self) -> Rc<dyn ComputeContext> {
        self.states.context().clone()
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    pub fn states_mut(&mut self) -> &mut StateTable {
        &mut self.states
    }

    /// Append a step. Returns its issue index.
    pub fn push(&mut self, step: impl Step + 'static) -> usize {
        self.push_boxed(Box::new(step))
    }

    pub fn push_boxed(&mut self, step: Box<dyn Step>) -> usize {
        log::debug!("pipeline: step {} = {}", self.steps.len(), step.name());
        self.steps.push(step);
        self.steps.len() - 1
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Data dependencies between steps, in issue order.
    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = Vec::new();
        for (j, later) in self.steps.iter().enumerate() {
            let touched: Vec<StateId> = later
                .inputs()
                .iter()
                .chain(later.input_outputs())
                .copied()
                .collect();
            for (i, earlier) in self.steps[..j].iter().enumerate() {
                for &state in &touched {
                    if earlier.input_outputs().contains(&state) {
                        deps.push(Dependency { step: j, on: i, state });
                    }
                }
            }
        }
        deps
    }

    /// Check that no step reads a state nobody has written.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut written: HashSet<StateId> = HashSet::new();
        for step in &self.steps {
            for &id in step.inputs().iter().chain(step.input_outputs()) {
                let state = self.states.get(id)?;
                if !state.is_ready() && !written.contains(&id) {
                    return Err(PipelineError::StateNotReady {
                        label: state.label().to_string(),
                        status: state.status(),
                    });
                }
            }
            written.extend(step.input_outputs().iter().copied());
        }
        Ok(())
    }

    /// Execute every step in issue order, then wait for the device.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        self.validate()?;
        for (i, step) in self.steps.iter_mut().enumerate() {
            log::trace!("pipeline: executing step {i} ({})", step.name());
            step.execute(&mut self.states)?;
        }
        self.states.context().finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;
    use crate::matmul::MatMulStep;

    fn host_pipeline() -> (Rc<HostContext>, Pipeline) {
        let host = Rc::new(HostContext::new());
        let ctx: Rc<dyn ComputeContext> = host.clone();
        (host, Pipeline::new(ctx))
    }

    #[test]
    fn test_dependencies_follow_writes() {
        let (_host, mut p) = host_pipeline();
        let s = p.states_mut();
        let a = s.add_matrix("A", 2, 2).unwrap();
        let b = s.add_matrix("B", 2, 2).unwrap();
        let c = s.add_matrix("C", 2, 2).unwrap();

        let ctx = p.context();
        let s0 = MatMulStep::new(ctx.clone(), p.states(), a, b).unwrap(); // writes B
        let s1 = MatMulStep::new(ctx.clone(), p.states(), b, c).unwrap(); // reads B, writes C
        let s2 = MatMulStep::new(ctx, p.states(), a, c).unwrap(); // writes C
        p.push(s0);
        p.push(s1);
        p.push(s2);

        let deps = p.dependencies();
        assert_eq!(
            deps,
            vec![
                Dependency { step: 1, on: 0, state: b },
                Dependency { step: 2, on: 1, state: c },
            ]
        );
    }

    #[test]
    fn test_validate_catches_unwritten_input() {
        let (host, mut p) = host_pipeline();
        let a = p.states_mut().add_matrix("A", 2, 2).unwrap();
        let b = p.states_mut().add_matrix("B", 2, 2).unwrap();
        p.states_mut().write_matrix(a, &[1.0; 4]).unwrap();
        // B never written.
        let step = MatMulStep::new(p.context(), p.states(), a, b).unwrap();
        p.push(step);

        let err = p.run().unwrap_err();
        assert!(matches!(err, PipelineError::StateNotReady { .. }));
        assert_eq!(host.builds(), 0);
        assert_eq!(host.dispatches(), 0);
    }

    #[test]
    fn test_empty_pipeline_runs() {
        let (_host, mut p) = host_pipeline();
        assert!(p.is_empty());
        p.run().unwrap();
    }
}
