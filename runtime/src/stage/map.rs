//! Row mapping stage.

use rill_buffer::layout::{BoundLayout, BoundRowLayout, RowLayout};
use rill_buffer::{BufferError, BufferProvider, Schema, TupleBuffer};

use crate::worker::WorkerContext;

use super::{ExecutionResult, PipelineContext, PipelineStage, carry_metadata, try_stage};

/// Applies a row function, producing exactly one output row per input row.
/// Input and output schemas may differ; output buffers are chunked when the
/// output rows are wider than the input rows.
pub struct MapStage<F> {
    input: RowLayout,
    output: RowLayout,
    map: F,
}

impl<F> MapStage<F>
where
    F: Fn(&BoundRowLayout, usize, &mut BoundRowLayout, usize) -> Result<(), BufferError>
        + Send
        + Sync,
{
    /// `map` reads row `in_row` of the bound input and writes the fields of
    /// row `out_row` of the bound output.
    pub fn new(input: Schema, output: Schema, map: F) -> Self {
        MapStage {
            input: RowLayout::new(input),
            output: RowLayout::new(output),
            map,
        }
    }
}

impl<F> PipelineStage for MapStage<F>
where
    F: Fn(&BoundRowLayout, usize, &mut BoundRowLayout, usize) -> Result<(), BufferError>
        + Send
        + Sync,
{
    fn name(&self) -> &'static str {
        "map"
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
                try_stage!((self.map)(&input, row + out_row, &mut output, out_row));
            }
            output.buffer().set_number_of_tuples(chunk as u64);
            ctx.emit_buffer(output.into_buffer());
            row += chunk;
        }
        ExecutionResult::Ok
    }
}

#[cfg(test)]
mod test {
    use rill_buffer::{BufferManager, DataType};

    use crate::stage::test_support::Collector;
    use crate::worker::WorkerContext;

    use super::*;

    #[test]
    fn power_arithmetic() {
        let manager = BufferManager::new(256, 4);
        let input_schema = Schema::builder()
            .field("id", DataType::Int64)
            .field("one", DataType::Int64)
            .build();
        let output_schema = Schema::builder()
            .field("id", DataType::Int64)
            .field("result_pow_int", DataType::Int64)
            .build();

        let input_layout = RowLayout::new(input_schema.clone());
        let mut input = input_layout.bind(manager.get_buffer_blocking()).unwrap();
        for i in 0..6i64 {
            input.push_record(&[i.into(), 1i64.into()]).unwrap();
        }

        let stage = MapStage::new(input_schema, output_schema.clone(), |src, row, dst, out| {
            let id = src.read::<i64>(row, 0)?;
            let one = src.read::<i64>(row, 1)?;
            dst.write(out, 0, id)?;
            dst.write(out, 1, 1i64 << (id + one))?;
            Ok(())
        });

        let mut ctx = Collector::default();
        let mut worker = WorkerContext::new(0, std::sync::Arc::new(manager));
        let result = stage.execute(input.into_buffer(), &mut ctx, &mut worker);
        assert!(matches!(result, ExecutionResult::Ok));

        let out = RowLayout::new(output_schema).bind(ctx.take_one()).unwrap();
        let expected = [2i64, 4, 8, 16, 32, 64];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(out.read::<i64>(i, 0).unwrap(), i as i64);
            assert_eq!(out.read::<i64>(i, 1).unwrap(), *want);
        }
    }
}
