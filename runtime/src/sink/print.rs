//! Diagnostic sinks.

use std::io::Write;

use parking_lot::Mutex;
use rill_buffer::layout::{BoundLayout, RowLayout};
use rill_buffer::{Schema, TupleBuffer};

use crate::error::RuntimeError;
use crate::worker::WorkerContext;

use super::Sink;

/// Writes every record as one formatted line.
pub struct PrintSink {
    layout: RowLayout,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl PrintSink {
    pub fn new(schema: Schema, writer: Box<dyn Write + Send>) -> Self {
        PrintSink {
            layout: RowLayout::new(schema),
            writer: Mutex::new(writer),
        }
    }

    /// Print to standard output.
    pub fn stdout(schema: Schema) -> Self {
        Self::new(schema, Box::new(std::io::stdout()))
    }
}

impl Sink for PrintSink {
    fn write_data(
        &self,
        buffer: &TupleBuffer,
        _worker: &mut WorkerContext,
    ) -> Result<(), RuntimeError> {
        let bound = self.layout.bind(buffer.clone())?;
        let mut writer = self.writer.lock();
        for row in 0..bound.tuple_count() {
            let record = bound.read_record(row)?;
            let mut line = String::new();
            for (field, value) in self.layout.schema().fields().iter().zip(&record) {
                if !line.is_empty() {
                    line.push('|');
                }
                line.push_str(&format!("{}={value:?}", field.name()));
            }
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }
}

/// Swallows everything; useful for load generation.
pub struct NullSink;

impl Sink for NullSink {
    fn write_data(
        &self,
        _buffer: &TupleBuffer,
        _worker: &mut WorkerContext,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }
}
