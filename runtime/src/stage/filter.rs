//! Row filtering stage.

use rill_buffer::layout::{BoundLayout, BoundRowLayout, RowLayout};
use rill_buffer::{BufferError, BufferProvider, Schema, TupleBuffer};

use crate::worker::WorkerContext;

use super::{ExecutionResult, PipelineContext, PipelineStage, carry_metadata, try_stage};

/// Keeps the rows the predicate selects. Monomorphic over the predicate, so
/// the row loop compiles without dynamic dispatch.
pub struct FilterStage<F> {
    layout: RowLayout,
    predicate: F,
}

impl<F> FilterStage<F>
where
    F: Fn(&BoundRowLayout, usize) -> Result<bool, BufferError> + Send + Sync,
{
    pub fn new(schema: Schema, predicate: F) -> Self {
        FilterStage {
            layout: RowLayout::new(schema),
            predicate,
        }
    }
}

impl<F> PipelineStage for FilterStage<F>
where
    F: Fn(&BoundRowLayout, usize) -> Result<bool, BufferError> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "filter"
    }

    fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut dyn PipelineContext,
        worker: &mut WorkerContext,
    ) -> ExecutionResult {
        let input = try_stage!(self.layout.bind(buffer));
        let out_buffer = worker.buffer_provider().get_buffer_blocking();
        carry_metadata(input.buffer(), &out_buffer);
        let mut output = try_stage!(self.layout.bind(out_buffer));

        for row in 0..input.tuple_count() {
            if try_stage!((self.predicate)(&input, row)) {
                try_stage!(output.append_row_from(&input, row));
            }
        }
        if output.tuple_count() > 0 {
            ctx.emit_buffer(output.into_buffer());
        }
        ExecutionResult::Ok
    }
}
