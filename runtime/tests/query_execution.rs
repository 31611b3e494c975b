//! In-process query execution scenarios: filter, map arithmetic and the
//! windowed aggregations, each against a concrete oracle.

mod common;

use core::time::Duration;

use rill_buffer::layout::BoundLayout;
use rill_buffer::{DataType, Schema};
use rill_runtime::source::{GatheringMode, GeneratorSource, WatermarkStrategy};
use rill_runtime::stage::{Aggregation, FilterStage, KeyedWindowStage, MapStage, WindowType};
use rill_runtime::{
    ExecutableQueryPlan, ExecutionStatus, NodeEngine, QueryId, QueryPlanBuilder, SubPlanId,
};

use common::{CollectSink, as_i64, as_u64};

const WAIT: Duration = Duration::from_secs(10);

fn engine_with_workers(worker_threads: usize) -> NodeEngine {
    NodeEngine::builder()
        .worker_threads(worker_threads)
        .buffers_in_global_pool(128)
        .buffers_per_worker(16)
        .buffers_per_source(8)
        .buffer_size_bytes(4096)
        .build()
        .unwrap()
}

fn engine() -> NodeEngine {
    engine_with_workers(2)
}

fn test_schema() -> Schema {
    Schema::builder().field("id", DataType::Int64).build()
}

#[test]
fn filter_query_keeps_half_the_records() {
    let engine = engine();
    let schema = test_schema();
    let sink = CollectSink::new(schema.clone());

    let query = QueryId::new(1);
    let mut builder = ExecutableQueryPlan::builder(query, SubPlanId::new(0));
    let filter = builder.add_pipeline(FilterStage::new(schema.clone(), |rows, i| {
        Ok(rows.read::<i64>(i, 0)? < 5)
    }));
    let sink_pipeline = builder.add_sink(sink.clone());
    builder.connect(filter, sink_pipeline);

    builder.add_source(
        GeneratorSource::new(
            schema,
            engine.create_source_pool(),
            1,
            GatheringMode::Interval(Duration::ZERO),
            WatermarkStrategy::IngestionTime,
            1,
            |bound, _| {
                for i in 0..10i64 {
                    bound.push_record(&[i.into()])?;
                }
                Ok(())
            },
        ),
        filter,
    );
    let plan = builder.build();

    engine.register_query(plan.clone()).unwrap();
    engine.start_query(query).unwrap();

    let records = sink.wait_for_records(5, WAIT);
    assert_eq!(sink.buffer_count(), 1);
    assert_eq!(
        records.iter().map(|r| as_i64(&r[0])).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );

    assert!(plan.wait_completed(WAIT), "plan must stop after source EOS");
    sink.wait_for_end_of_stream(WAIT);
    assert_eq!(plan.status(), ExecutionStatus::Stopped);

    let stats = engine.query_statistics(query).unwrap();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].processed_buffers >= 1);
    assert!(stats[0].processed_tuples >= 10);

    engine.stop_query(query, false).unwrap();
    engine.undeploy_query(query).unwrap();
    assert!(engine.query_statistics(query).is_err());
    engine.stop();
}

#[test]
fn map_query_computes_powers() {
    let engine = engine();
    let input_schema = Schema::builder()
        .field("id", DataType::Int64)
        .field("one", DataType::Int64)
        .field("value", DataType::Int64)
        .build();
    let output_schema = Schema::builder()
        .field("id", DataType::Int64)
        .field("result_pow_int", DataType::Int64)
        .build();
    let sink = CollectSink::new(output_schema.clone());

    let query = QueryId::new(2);
    let mut builder = ExecutableQueryPlan::builder(query, SubPlanId::new(0));
    let map = builder.add_pipeline(MapStage::new(
        input_schema.clone(),
        output_schema,
        |src, row, dst, out| {
            let id = src.read::<i64>(row, 0)?;
            let one = src.read::<i64>(row, 1)?;
            dst.write(out, 0, id)?;
            dst.write(out, 1, 1i64 << (id + one))?;
            Ok(())
        },
    ));
    let sink_pipeline = builder.add_sink(sink.clone());
    builder.connect(map, sink_pipeline);

    builder.add_source(
        GeneratorSource::new(
            input_schema,
            engine.create_source_pool(),
            1,
            GatheringMode::Interval(Duration::ZERO),
            WatermarkStrategy::IngestionTime,
            1,
            |bound, _| {
                for i in 0..10i64 {
                    bound.push_record(&[i.into(), 1i64.into(), (i % 2).into()])?;
                }
                Ok(())
            },
        ),
        map,
    );
    let plan = builder.build();

    engine.register_query(plan.clone()).unwrap();
    engine.start_query(query).unwrap();

    let records = sink.wait_for_records(10, WAIT);
    let expected = [2i64, 4, 8, 16, 32, 64];
    for (i, want) in expected.iter().enumerate() {
        assert_eq!(as_i64(&records[i][0]), i as i64);
        assert_eq!(as_i64(&records[i][1]), *want, "2^(id+one) for id={i}");
    }
    assert!(plan.wait_completed(WAIT));
    engine.stop();
}

fn window_input_schema() -> Schema {
    Schema::builder()
        .field("key", DataType::Int64)
        .field("value", DataType::Int64)
        .field("ts", DataType::UInt64)
        .build()
}

fn window_result_schema() -> Schema {
    Schema::builder()
        .field("start", DataType::UInt64)
        .field("end", DataType::UInt64)
        .field("key", DataType::Int64)
        .field("value", DataType::Int64)
        .build()
}

/// Two buffers of ten `(key=1, value=1)` records with timestamps running on
/// across buffers, watermark assigned from the `ts` field.
fn add_window_source(engine: &NodeEngine, builder: &mut QueryPlanBuilder, target: usize) {
    builder.add_source(
        GeneratorSource::new(
            window_input_schema(),
            engine.create_source_pool(),
            2,
            GatheringMode::Interval(Duration::ZERO),
            WatermarkStrategy::EventTime {
                field: 2,
                allowed_lateness_ms: 0,
            },
            7,
            |bound, index| {
                for i in 0..10u64 {
                    let ts = index as u64 * 10 + i;
                    bound.push_record(&[1i64.into(), 1i64.into(), ts.into()])?;
                }
                Ok(())
            },
        ),
        target,
    );
}

#[test]
fn tumbling_window_sums_one_window() {
    // One worker keeps the two source buffers in event time order; the
    // watermark of the second fires the first window.
    let engine = engine_with_workers(1);
    let sink = CollectSink::new(window_result_schema());

    let query = QueryId::new(3);
    let mut builder = ExecutableQueryPlan::builder(query, SubPlanId::new(0));
    let window = builder.add_pipeline(KeyedWindowStage::new(
        window_input_schema(),
        window_result_schema(),
        vec![0],
        2,
        1,
        WindowType::Tumbling { size_ms: 10 },
        Aggregation::Sum,
    ));
    let sink_pipeline = builder.add_sink(sink.clone());
    builder.connect(window, sink_pipeline);
    add_window_source(&engine, &mut builder, window);
    let plan = builder.build();

    engine.register_query(plan.clone()).unwrap();
    engine.start_query(query).unwrap();

    let records = sink.wait_for_records(1, WAIT);
    assert!(plan.wait_completed(WAIT));
    // Only [0, 10) is covered by the final watermark of 19.
    assert_eq!(records.len(), 1);
    assert_eq!(as_u64(&records[0][0]), 0);
    assert_eq!(as_u64(&records[0][1]), 10);
    assert_eq!(as_i64(&records[0][2]), 1);
    assert_eq!(as_i64(&records[0][3]), 10);
    engine.stop();
}

#[test]
fn sliding_window_sums_two_windows() {
    let engine = engine_with_workers(1);
    let sink = CollectSink::new(window_result_schema());

    let query = QueryId::new(4);
    let mut builder = ExecutableQueryPlan::builder(query, SubPlanId::new(0));
    let window = builder.add_pipeline(KeyedWindowStage::new(
        window_input_schema(),
        window_result_schema(),
        vec![0],
        2,
        1,
        WindowType::Sliding {
            size_ms: 10,
            slide_ms: 5,
        },
        Aggregation::Sum,
    ));
    let sink_pipeline = builder.add_sink(sink.clone());
    builder.connect(window, sink_pipeline);
    add_window_source(&engine, &mut builder, window);
    let plan = builder.build();

    engine.register_query(plan.clone()).unwrap();
    engine.start_query(query).unwrap();

    let records = sink.wait_for_records(2, WAIT);
    assert!(plan.wait_completed(WAIT));
    assert_eq!(records.len(), 2);
    let rows: Vec<(u64, u64, i64, i64)> = records
        .iter()
        .map(|r| (as_u64(&r[0]), as_u64(&r[1]), as_i64(&r[2]), as_i64(&r[3])))
        .collect();
    assert_eq!(rows, vec![(0, 10, 1, 10), (5, 15, 1, 10)]);
    engine.stop();
}

#[test]
fn failing_stage_isolates_its_query() {
    let engine = engine();
    let schema = test_schema();

    let failing_query = QueryId::new(7);
    let mut builder = ExecutableQueryPlan::builder(failing_query, SubPlanId::new(0));
    let failing = builder.add_pipeline(FilterStage::new(schema.clone(), |_, _| {
        Err(rill_buffer::BufferError::RecordMismatch("induced failure"))
    }));
    builder.add_source(
        GeneratorSource::new(
            schema.clone(),
            engine.create_source_pool(),
            1,
            GatheringMode::Interval(Duration::ZERO),
            WatermarkStrategy::IngestionTime,
            1,
            |bound, _| {
                bound.push_record(&[1i64.into()])?;
                Ok(())
            },
        ),
        failing,
    );
    let failing_plan = builder.build();
    engine.register_query(failing_plan.clone()).unwrap();
    engine.start_query(failing_query).unwrap();

    assert!(failing_plan.wait_completed(WAIT));
    assert_eq!(failing_plan.status(), ExecutionStatus::ErrorState);
    assert!(engine.first_error(failing_query).unwrap().is_some());

    // A healthy query on the same engine is unaffected.
    let healthy_query = QueryId::new(8);
    let sink = CollectSink::new(schema.clone());
    let mut builder = ExecutableQueryPlan::builder(healthy_query, SubPlanId::new(0));
    let sink_pipeline = builder.add_sink(sink.clone());
    builder.add_source(
        GeneratorSource::new(
            schema,
            engine.create_source_pool(),
            1,
            GatheringMode::Interval(Duration::ZERO),
            WatermarkStrategy::IngestionTime,
            2,
            |bound, _| {
                for i in 0..10i64 {
                    bound.push_record(&[i.into()])?;
                }
                Ok(())
            },
        ),
        sink_pipeline,
    );
    let healthy_plan = builder.build();
    engine.register_query(healthy_plan.clone()).unwrap();
    engine.start_query(healthy_query).unwrap();
    sink.wait_for_records(10, WAIT);
    assert!(healthy_plan.wait_completed(WAIT));
    assert_eq!(healthy_plan.status(), ExecutionStatus::Stopped);

    engine.undeploy_query(failing_query).unwrap();
    engine.stop();
}

#[test]
fn engine_stop_is_idempotent() {
    let engine = engine();
    engine.stop();
    engine.stop();
}
