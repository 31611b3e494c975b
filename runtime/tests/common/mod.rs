//! Shared helpers for the end to end scenarios.
#![allow(dead_code)]

use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rill_buffer::layout::{BoundLayout, RecordValue, RowLayout};
use rill_buffer::{Schema, TupleBuffer};
use rill_runtime::sink::Sink;
use rill_runtime::{RuntimeError, WorkerContext};

/// Sink collecting every record and buffer it receives.
pub struct CollectSink {
    layout: RowLayout,
    state: Mutex<CollectState>,
    arrived: Condvar,
}

#[derive(Default)]
struct CollectState {
    records: Vec<Vec<RecordValue>>,
    buffers: usize,
    end_of_stream: bool,
}

impl CollectSink {
    pub fn new(schema: Schema) -> Arc<Self> {
        Arc::new(CollectSink {
            layout: RowLayout::new(schema),
            state: Mutex::new(CollectState::default()),
            arrived: Condvar::new(),
        })
    }

    pub fn records(&self) -> Vec<Vec<RecordValue>> {
        self.state.lock().records.clone()
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers
    }

    pub fn saw_end_of_stream(&self) -> bool {
        self.state.lock().end_of_stream
    }

    /// Block until `count` records arrived; panics on timeout.
    pub fn wait_for_records(&self, count: usize, timeout: Duration) -> Vec<Vec<RecordValue>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.records.len() < count {
            assert!(
                !self.arrived.wait_until(&mut state, deadline).timed_out(),
                "timed out: {} of {count} records arrived",
                state.records.len()
            );
        }
        state.records.clone()
    }

    /// Block until the sink saw end of stream.
    pub fn wait_for_end_of_stream(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.end_of_stream {
            assert!(
                !self.arrived.wait_until(&mut state, deadline).timed_out(),
                "timed out waiting for end of stream"
            );
        }
    }
}

impl Sink for CollectSink {
    fn write_data(
        &self,
        buffer: &TupleBuffer,
        _worker: &mut WorkerContext,
    ) -> Result<(), RuntimeError> {
        let bound = self.layout.bind(buffer.clone())?;
        let mut state = self.state.lock();
        state.buffers += 1;
        for row in 0..bound.tuple_count() {
            let record = bound.read_record(row)?;
            state.records.push(record);
        }
        drop(state);
        self.arrived.notify_all();
        Ok(())
    }

    fn on_end_of_stream(&self, _worker: &mut WorkerContext) -> Result<(), RuntimeError> {
        self.state.lock().end_of_stream = true;
        self.arrived.notify_all();
        Ok(())
    }
}

/// Unwrap an i64 record value.
pub fn as_i64(value: &RecordValue) -> i64 {
    match value {
        RecordValue::Int64(v) => *v,
        other => panic!("expected i64, got {other:?}"),
    }
}

/// Unwrap a u64 record value.
pub fn as_u64(value: &RecordValue) -> u64 {
    match value {
        RecordValue::UInt64(v) => *v,
        other => panic!("expected u64, got {other:?}"),
    }
}
