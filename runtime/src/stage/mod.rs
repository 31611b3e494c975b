//! The pipeline stage ABI and the built-in monomorphic stages.
//!
//! Every compiled operator implements [`PipelineStage`]: consume one input
//! buffer, emit zero or more output buffers through the context. Stages
//! must not retain the input buffer past return.

mod filter;
mod map;
mod projection;
mod window;

pub use filter::FilterStage;
pub use map::MapStage;
pub use projection::ProjectionStage;
pub use window::{Aggregation, KeyedWindowStage, WindowType};

use rill_buffer::TupleBuffer;

use crate::error::StageError;
use crate::worker::WorkerContext;

/// Outcome of one `execute` invocation.
#[derive(Debug)]
pub enum ExecutionResult {
    /// Input consumed, stage ready for more.
    Ok,
    /// Stage will not accept further input.
    Finished,
    /// Stage failure; fails the owning subplan.
    Error(StageError),
}

/// Emission surface handed to a stage. Every emitted buffer becomes a task
/// for each successor pipeline.
pub trait PipelineContext {
    fn emit_buffer(&mut self, buffer: TupleBuffer);
}

/// One compiled operator unit.
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str {
        "stage"
    }

    /// Called once when the owning plan is deployed.
    fn setup(&self) -> Result<(), StageError> {
        Ok(())
    }

    /// Process one input buffer. `buffer.tuple_count() > 0` unless the
    /// stage opts into empty buffers via
    /// [`PipelineStage::accepts_empty_buffers`].
    fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut dyn PipelineContext,
        worker: &mut WorkerContext,
    ) -> ExecutionResult;

    /// Drain residual operator state at end of stream, after all input has
    /// been processed.
    fn flush(&self, ctx: &mut dyn PipelineContext, worker: &mut WorkerContext) -> ExecutionResult {
        let _ = (ctx, worker);
        ExecutionResult::Ok
    }

    /// Called once when the owning plan is destroyed.
    fn shutdown(&self) -> Result<(), StageError> {
        Ok(())
    }

    /// Opt in to watermark-only buffers with a zero tuple count.
    fn accepts_empty_buffers(&self) -> bool {
        false
    }
}

/// Propagate stream metadata from an input buffer onto a derived output.
pub(crate) fn carry_metadata(input: &TupleBuffer, output: &TupleBuffer) {
    output.set_watermark_ms(input.watermark_ms());
    output.set_sequence_number(input.sequence_number());
    output.set_origin_id(input.origin_id());
}

macro_rules! try_stage {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return $crate::stage::ExecutionResult::Error(err.into()),
        }
    };
}
pub(crate) use try_stage;

#[cfg(test)]
pub(crate) mod test_support {
    use rill_buffer::TupleBuffer;

    use super::PipelineContext;

    /// Context stub collecting emitted buffers.
    #[derive(Default)]
    pub(crate) struct Collector {
        emitted: Vec<TupleBuffer>,
    }

    impl Collector {
        pub(crate) fn take_one(&mut self) -> TupleBuffer {
            assert_eq!(self.emitted.len(), 1, "expected exactly one emitted buffer");
            self.emitted.pop().unwrap()
        }

        pub(crate) fn take_all(&mut self) -> Vec<TupleBuffer> {
            core::mem::take(&mut self.emitted)
        }

        pub(crate) fn is_empty(&self) -> bool {
            self.emitted.is_empty()
        }
    }

    impl PipelineContext for Collector {
        fn emit_buffer(&mut self, buffer: TupleBuffer) {
            self.emitted.push(buffer);
        }
    }
}
