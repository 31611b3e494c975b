//! One node of the executable DAG.

use crate::stage::PipelineStage;

/// A stage plus its successor edges. Pipelines are addressed by their index
/// in the owning plan's pipeline table; dispatch is a table lookup, never a
/// symbol lookup.
pub struct Pipeline {
    id: usize,
    stage: Box<dyn PipelineStage>,
    successors: Vec<usize>,
}

impl Pipeline {
    pub(crate) fn new(id: usize, stage: Box<dyn PipelineStage>) -> Self {
        Pipeline {
            id,
            stage,
            successors: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stage(&self) -> &dyn PipelineStage {
        self.stage.as_ref()
    }

    pub fn successors(&self) -> &[usize] {
        &self.successors
    }

    pub(crate) fn add_successor(&mut self, to: usize) {
        self.successors.push(to);
    }
}
