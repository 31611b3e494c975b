//! Field projection stage.

use rill_buffer::layout::{BoundLayout, RowLayout};
use rill_buffer::{BufferProvider, Schema, TupleBuffer};

use crate::worker::WorkerContext;

use super::{ExecutionResult, PipelineContext, PipelineStage, carry_metadata, try_stage};

/// Copies a subset of the input fields into a narrower output schema.
pub struct ProjectionStage {
    input: RowLayout,
    output: RowLayout,
    fields: Vec<usize>,
}

impl ProjectionStage {
    /// `fields[i]` is the input field index feeding output field `i`.
    ///
    /// # Panics
    /// When the field lists disagree in arity or type.
    pub fn new(input: Schema, output: Schema, fields: Vec<usize>) -> Self {
        assert_eq!(
            fields.len(),
            output.len(),
            "projection must map every output field"
        );
        for (out_field, &in_field) in fields.iter().enumerate() {
            assert_eq!(
                input.fields()[in_field].data_type(),
                output.fields()[out_field].data_type(),
                "projected field type must match"
            );
        }
        ProjectionStage {
            input: RowLayout::new(input),
            output: RowLayout::new(output),
            fields,
        }
    }
}

impl PipelineStage for ProjectionStage {
    fn name(&self) -> &'static str {
        "projection"
    }

    fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut dyn PipelineContext,
        worker: &mut WorkerContext,
    ) -> ExecutionResult {
        let input = try_stage!(self.input.bind(buffer));
        let count = input.tuple_count();

        let mut row = 0;
        while row < count {
            let out_buffer = worker.buffer_provider().get_buffer_blocking();
            carry_metadata(input.buffer(), &out_buffer);
            let mut output = try_stage!(self.output.bind(out_buffer));
            let chunk = output.capacity().min(count - row);
            for out_row in 0..chunk {
                for (out_field, &in_field) in self.fields.iter().enumerate() {
                    let value = try_stage!(input.read_value(row + out_row, in_field));
                    try_stage!(output.write_value(out_row, out_field, value));
                }
            }
            output.buffer().set_number_of_tuples(chunk as u64);
            ctx.emit_buffer(output.into_buffer());
            row += chunk;
        }
        ExecutionResult::Ok
    }
}
