//! Sink media terminating a pipeline.

mod network;
mod print;

pub use network::NetworkSink;
pub use print::{NullSink, PrintSink};

use std::sync::Arc;

use rill_buffer::TupleBuffer;

use crate::error::{RuntimeError, StageError};
use crate::stage::{ExecutionResult, PipelineContext, PipelineStage};
use crate::worker::WorkerContext;

/// A terminal consumer of tuple buffers.
pub trait Sink: Send + Sync {
    fn setup(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Consume one buffer. The sink must not retain the handle past return.
    fn write_data(&self, buffer: &TupleBuffer, worker: &mut WorkerContext)
    -> Result<(), RuntimeError>;

    /// All upstream pipelines flushed; convert end of stream into the
    /// sink's own completion signal.
    fn on_end_of_stream(&self, worker: &mut WorkerContext) -> Result<(), RuntimeError> {
        let _ = worker;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Adapter placing a sink at the end of the pipeline DAG under the common
/// stage ABI.
pub struct SinkStage {
    sink: Arc<dyn Sink>,
}

impl SinkStage {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        SinkStage { sink }
    }
}

impl PipelineStage for SinkStage {
    fn name(&self) -> &'static str {
        "sink"
    }

    fn setup(&self) -> Result<(), StageError> {
        self.sink.setup().map_err(|e| StageError::new(4, e.to_string()))
    }

    fn execute(
        &self,
        buffer: TupleBuffer,
        _ctx: &mut dyn PipelineContext,
        worker: &mut WorkerContext,
    ) -> ExecutionResult {
        match self.sink.write_data(&buffer, worker) {
            Ok(()) => ExecutionResult::Ok,
            Err(err) => ExecutionResult::Error(StageError::new(4, err.to_string())),
        }
    }

    fn flush(&self, _ctx: &mut dyn PipelineContext, worker: &mut WorkerContext) -> ExecutionResult {
        match self.sink.on_end_of_stream(worker) {
            Ok(()) => ExecutionResult::Finished,
            Err(err) => ExecutionResult::Error(StageError::new(4, err.to_string())),
        }
    }

    fn shutdown(&self) -> Result<(), StageError> {
        self.sink.shutdown().map_err(|e| StageError::new(4, e.to_string()))
    }
}
