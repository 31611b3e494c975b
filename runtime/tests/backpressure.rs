//! A bounded source pool against a deliberately slow sink: the source must
//! stall instead of dropping buffers.

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread;

use rill_buffer::layout::BoundLayout;
use rill_buffer::{BufferProvider, DataType, Schema, TupleBuffer};
use rill_runtime::sink::Sink;
use rill_runtime::source::{GatheringMode, GeneratorSource, WatermarkStrategy};
use rill_runtime::{
    ExecutableQueryPlan, NodeEngine, QueryId, RuntimeError, SubPlanId, WorkerContext,
};

const SOURCE_POOL: usize = 4;
const TOTAL_BUFFERS: usize = 32;

/// Sleeps on every buffer and records arrival order by sequence number.
#[derive(Default)]
struct SlowSink {
    received: AtomicUsize,
    sequences: parking_lot::Mutex<Vec<u64>>,
}

impl Sink for SlowSink {
    fn write_data(
        &self,
        buffer: &TupleBuffer,
        _worker: &mut WorkerContext,
    ) -> Result<(), RuntimeError> {
        thread::sleep(Duration::from_millis(5));
        self.received.fetch_add(1, Ordering::Relaxed);
        self.sequences.lock().push(buffer.sequence_number());
        Ok(())
    }
}

#[test]
fn bounded_pool_stalls_the_source_without_loss() {
    let engine = NodeEngine::builder()
        .worker_threads(1)
        .buffers_in_global_pool(64)
        .buffers_per_worker(8)
        .buffers_per_source(SOURCE_POOL)
        .buffer_size_bytes(1024)
        .build()
        .unwrap();

    let schema = Schema::builder().field("id", DataType::Int64).build();
    let sink = Arc::new(SlowSink::default());
    let pool = engine.create_source_pool();
    assert_eq!(pool.capacity(), SOURCE_POOL);

    let query = QueryId::new(6);
    let mut builder = ExecutableQueryPlan::builder(query, SubPlanId::new(0));
    let sink_pipeline = builder.add_sink(sink.clone());
    builder.add_source(
        GeneratorSource::new(
            schema,
            pool.clone(),
            TOTAL_BUFFERS,
            GatheringMode::Interval(Duration::ZERO),
            WatermarkStrategy::IngestionTime,
            1,
            |bound, index| {
                bound.push_record(&[(index as i64).into()])?;
                Ok(())
            },
        ),
        sink_pipeline,
    );
    let plan = builder.build();

    engine.register_query(plan.clone()).unwrap();
    engine.start_query(query).unwrap();

    assert!(plan.wait_completed(Duration::from_secs(30)));

    // Every produced buffer arrived, none was dropped, and with a single
    // worker the per-channel order is intact.
    assert_eq!(sink.received.load(Ordering::Relaxed), TOTAL_BUFFERS);
    let sequences = sink.sequences.lock().clone();
    assert_eq!(sequences, (1..=TOTAL_BUFFERS as u64).collect::<Vec<_>>());

    // The fixed pool bounds the tuples in flight; once the query stopped
    // every buffer has recycled into it.
    assert_eq!(pool.available_buffers(), SOURCE_POOL);

    let stats = engine.query_statistics(query).unwrap();
    assert_eq!(stats[0].processed_buffers, TOTAL_BUFFERS as u64);
    assert!(stats[0].available_fixed_buffer_sum <= (SOURCE_POOL * TOTAL_BUFFERS) as u64);

    engine.stop();
}
