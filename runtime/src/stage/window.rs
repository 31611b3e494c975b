//! Keyed window aggregation over event time.
//!
//! One implementation serves every key arity: keys are a list of input
//! fields, windows are tumbling or sliding, and state is kept as slices of
//! `gcd(size, slide)` width so sliding windows share partial aggregates.
//! Windows fire when the watermark passes their end; lateness handling
//! lives entirely in the watermark a source assigns, not here.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use rill_buffer::layout::{BoundLayout, RecordValue, RowLayout};
use rill_buffer::{BufferProvider, DataType, Schema, TupleBuffer};
use tracing::trace;

use crate::error::StageError;
use crate::worker::WorkerContext;

use super::{ExecutionResult, PipelineContext, PipelineStage, try_stage};

/// Window shape. A tumbling window is a sliding window whose slide equals
/// its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Tumbling { size_ms: u64 },
    Sliding { size_ms: u64, slide_ms: u64 },
}

impl WindowType {
    fn size(self) -> u64 {
        match self {
            WindowType::Tumbling { size_ms } => size_ms,
            WindowType::Sliding { size_ms, .. } => size_ms,
        }
    }

    fn slide(self) -> u64 {
        match self {
            WindowType::Tumbling { size_ms } => size_ms,
            WindowType::Sliding { slide_ms, .. } => slide_ms,
        }
    }

    fn slice_width(self) -> u64 {
        gcd(self.size(), self.slide())
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Count,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy)]
enum AggValue {
    I64(i64),
    U64(u64),
    F64(f64),
}

impl AggValue {
    fn from_record(value: RecordValue) -> Option<AggValue> {
        match value {
            RecordValue::Int64(v) => Some(AggValue::I64(v)),
            RecordValue::UInt64(v) => Some(AggValue::U64(v)),
            RecordValue::Float64(v) => Some(AggValue::F64(v)),
            _ => None,
        }
    }

    fn combine(self, other: AggValue, aggregation: Aggregation) -> AggValue {
        match (self, other) {
            (AggValue::I64(a), AggValue::I64(b)) => AggValue::I64(match aggregation {
                Aggregation::Sum => a + b,
                Aggregation::Min => a.min(b),
                Aggregation::Max => a.max(b),
                Aggregation::Count => a + b,
            }),
            (AggValue::U64(a), AggValue::U64(b)) => AggValue::U64(match aggregation {
                Aggregation::Sum => a + b,
                Aggregation::Min => a.min(b),
                Aggregation::Max => a.max(b),
                Aggregation::Count => a + b,
            }),
            (AggValue::F64(a), AggValue::F64(b)) => AggValue::F64(match aggregation {
                Aggregation::Sum => a + b,
                Aggregation::Min => a.min(b),
                Aggregation::Max => a.max(b),
                Aggregation::Count => a + b,
            }),
            _ => unreachable!("aggregate type is fixed by the schema"),
        }
    }

    fn into_record(self) -> RecordValue {
        match self {
            AggValue::I64(v) => RecordValue::Int64(v),
            AggValue::U64(v) => RecordValue::UInt64(v),
            AggValue::F64(v) => RecordValue::Float64(v),
        }
    }
}

fn value_bits(value: RecordValue) -> u64 {
    match value {
        RecordValue::Int8(v) => v as u64,
        RecordValue::Int16(v) => v as u64,
        RecordValue::Int32(v) => v as u64,
        RecordValue::Int64(v) => v as u64,
        RecordValue::UInt8(v) => v as u64,
        RecordValue::UInt16(v) => v as u64,
        RecordValue::UInt32(v) => v as u64,
        RecordValue::UInt64(v) => v,
        RecordValue::Float32(v) => v.to_bits() as u64,
        RecordValue::Float64(v) => v.to_bits(),
        RecordValue::Bool(v) => v as u64,
    }
}

struct SliceEntry {
    display: Vec<RecordValue>,
    agg: AggValue,
    count: u64,
}

struct WindowState {
    /// Partial aggregates per slice start, keyed by the raw bits of the
    /// key fields.
    slices: BTreeMap<u64, HashMap<Vec<u64>, SliceEntry>>,
    /// Monotone maximum watermark observed; regressions are ignored.
    watermark: u64,
    /// Start of the oldest window that has not fired yet. Anchored to the
    /// first observed timestamp aligned down to the slide, so streams with
    /// wall clock event times do not step through every window since epoch.
    next_window_start: Option<u64>,
}

struct OutputRow {
    start: u64,
    end: u64,
    key: Vec<RecordValue>,
    value: RecordValue,
}

/// The shared keyed aggregation stage behind tumbling and sliding windows
/// of any key arity.
pub struct KeyedWindowStage {
    input: RowLayout,
    output: RowLayout,
    key_fields: Vec<usize>,
    ts_field: usize,
    value_field: usize,
    window: WindowType,
    aggregation: Aggregation,
    state: Mutex<WindowState>,
}

impl KeyedWindowStage {
    /// Output schema is `start: u64, end: u64, <key fields>, <aggregate>`.
    ///
    /// # Panics
    /// When the schemas do not line up with the window shape.
    pub fn new(
        input: Schema,
        output: Schema,
        key_fields: Vec<usize>,
        ts_field: usize,
        value_field: usize,
        window: WindowType,
        aggregation: Aggregation,
    ) -> Self {
        assert!(window.size() > 0 && window.slide() > 0, "degenerate window");
        assert_eq!(
            input.fields()[ts_field].data_type(),
            DataType::UInt64,
            "event time field must be u64 milliseconds"
        );
        assert_eq!(
            output.len(),
            2 + key_fields.len() + 1,
            "output schema must be start, end, keys, aggregate"
        );
        assert_eq!(output.fields()[0].data_type(), DataType::UInt64);
        assert_eq!(output.fields()[1].data_type(), DataType::UInt64);
        for (i, &key_field) in key_fields.iter().enumerate() {
            assert_eq!(
                output.fields()[2 + i].data_type(),
                input.fields()[key_field].data_type(),
                "output key field must match input key field"
            );
        }
        let value_type = input.fields()[value_field].data_type();
        let aggregate_type = match aggregation {
            Aggregation::Count => DataType::UInt64,
            _ => value_type,
        };
        assert!(
            matches!(value_type, DataType::Int64 | DataType::UInt64 | DataType::Float64),
            "aggregate value field must be a 64 bit scalar"
        );
        assert_eq!(
            output.fields()[output.len() - 1].data_type(),
            aggregate_type,
            "output aggregate field must match the aggregation"
        );
        KeyedWindowStage {
            input: RowLayout::new(input),
            output: RowLayout::new(output),
            key_fields,
            ts_field,
            value_field,
            window,
            aggregation,
            state: Mutex::new(WindowState {
                slices: BTreeMap::new(),
                watermark: 0,
                next_window_start: None,
            }),
        }
    }

    /// Fire every window whose end the watermark passed, oldest first, and
    /// evict slices no future window can reference.
    fn trigger(&self, state: &mut WindowState) -> Vec<OutputRow> {
        let Some(mut next_start) = state.next_window_start else {
            return Vec::new();
        };
        let size = self.window.size();
        let slide = self.window.slide();
        let mut out = Vec::new();
        while next_start + size <= state.watermark {
            let start = next_start;
            let end = start + size;
            let mut merged: HashMap<Vec<u64>, SliceEntry> = HashMap::new();
            for (_, slice) in state.slices.range(start..end) {
                for (key, entry) in slice {
                    merged
                        .entry(key.clone())
                        .and_modify(|acc| {
                            acc.agg = acc.agg.combine(entry.agg, self.aggregation);
                            acc.count += entry.count;
                        })
                        .or_insert_with(|| SliceEntry {
                            display: entry.display.clone(),
                            agg: entry.agg,
                            count: entry.count,
                        });
                }
            }
            let mut rows: Vec<_> = merged.into_iter().collect();
            // Deterministic output order for equal windows.
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, entry) in rows {
                out.push(OutputRow {
                    start,
                    end,
                    key: entry.display,
                    value: match self.aggregation {
                        Aggregation::Count => RecordValue::UInt64(entry.count),
                        _ => entry.agg.into_record(),
                    },
                });
            }
            next_start += slide;
        }
        state.next_window_start = Some(next_start);
        // Slices entirely before the next window can never fire again.
        state.slices = state.slices.split_off(&next_start);
        out
    }

    fn emit_rows(
        &self,
        rows: Vec<OutputRow>,
        watermark: u64,
        ctx: &mut dyn PipelineContext,
        worker: &mut WorkerContext,
    ) -> Result<(), StageError> {
        let mut iter = rows.into_iter().peekable();
        while iter.peek().is_some() {
            let out_buffer = worker.buffer_provider().get_buffer_blocking();
            out_buffer.set_watermark_ms(watermark);
            let mut output = self.output.bind(out_buffer)?;
            while iter.peek().is_some() && output.tuple_count() < output.capacity() {
                let row = iter.next().expect("peeked");
                let mut record = Vec::with_capacity(self.output.schema().len());
                record.push(RecordValue::UInt64(row.start));
                record.push(RecordValue::UInt64(row.end));
                record.extend(row.key);
                record.push(row.value);
                output.push_record(&record)?;
            }
            ctx.emit_buffer(output.into_buffer());
        }
        Ok(())
    }
}

impl PipelineStage for KeyedWindowStage {
    fn name(&self) -> &'static str {
        "keyed-window"
    }

    fn execute(
        &self,
        buffer: TupleBuffer,
        ctx: &mut dyn PipelineContext,
        worker: &mut WorkerContext,
    ) -> ExecutionResult {
        let input = try_stage!(self.input.bind(buffer));
        let slice_width = self.window.slice_width();
        let slide = self.window.slide();

        let (rows, watermark) = {
            let mut state = self.state.lock();
            for row in 0..input.tuple_count() {
                let ts = try_stage!(input.read::<u64>(row, self.ts_field));
                if state.next_window_start.is_none() {
                    state.next_window_start = Some(ts - ts % slide);
                }
                let value = try_stage!(input.read_value(row, self.value_field));
                let Some(agg) = AggValue::from_record(value) else {
                    return ExecutionResult::Error(StageError::new(
                        3,
                        "aggregate value field is not a 64 bit scalar",
                    ));
                };
                let mut key_bits = Vec::with_capacity(self.key_fields.len());
                let mut display = Vec::with_capacity(self.key_fields.len());
                for &key_field in &self.key_fields {
                    let key_value = try_stage!(input.read_value(row, key_field));
                    key_bits.push(value_bits(key_value));
                    display.push(key_value);
                }
                let slice_start = ts - ts % slice_width;
                state
                    .slices
                    .entry(slice_start)
                    .or_default()
                    .entry(key_bits)
                    .and_modify(|entry| {
                        entry.agg = entry.agg.combine(agg, self.aggregation);
                        entry.count += 1;
                    })
                    .or_insert(SliceEntry {
                        display,
                        agg,
                        count: 1,
                    });
            }

            let watermark = input.buffer().watermark_ms();
            if watermark > state.watermark {
                state.watermark = watermark;
                trace!(watermark, "window watermark advanced");
            }
            (self.trigger(&mut state), state.watermark)
        };

        if !rows.is_empty() {
            try_stage!(self.emit_rows(rows, watermark, ctx, worker));
        }
        ExecutionResult::Ok
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rill_buffer::BufferManager;
    use rill_buffer::layout::BoundRowLayout;

    use crate::stage::test_support::Collector;
    use crate::worker::WorkerContext;

    use super::*;

    fn window_schema() -> Schema {
        Schema::builder()
            .field("key", DataType::Int64)
            .field("value", DataType::Int64)
            .field("ts", DataType::UInt64)
            .build()
    }

    fn result_schema() -> Schema {
        Schema::builder()
            .field("start", DataType::UInt64)
            .field("end", DataType::UInt64)
            .field("key", DataType::Int64)
            .field("value", DataType::Int64)
            .build()
    }

    /// Ten records per buffer, timestamps continuing across buffers, the
    /// watermark trailing the max event time.
    fn feed_buffer(
        stage: &KeyedWindowStage,
        manager: &BufferManager,
        ctx: &mut Collector,
        worker: &mut WorkerContext,
        first_ts: u64,
    ) {
        let layout = RowLayout::new(window_schema());
        let mut input = layout.bind(manager.get_buffer_blocking()).unwrap();
        for i in 0..10u64 {
            input
                .push_record(&[1i64.into(), 1i64.into(), (first_ts + i).into()])
                .unwrap();
        }
        let buffer = input.into_buffer();
        buffer.set_watermark_ms(first_ts + 9);
        let result = stage.execute(buffer, ctx, worker);
        assert!(matches!(result, ExecutionResult::Ok));
    }

    fn read_rows(layout: &RowLayout, buffer: rill_buffer::TupleBuffer) -> Vec<(u64, u64, i64, i64)> {
        let bound: BoundRowLayout = layout.bind(buffer).unwrap();
        (0..bound.tuple_count())
            .map(|i| {
                (
                    bound.read::<u64>(i, 0).unwrap(),
                    bound.read::<u64>(i, 1).unwrap(),
                    bound.read::<i64>(i, 2).unwrap(),
                    bound.read::<i64>(i, 3).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn tumbling_window_fires_on_watermark() {
        let manager = BufferManager::new(512, 8);
        let stage = KeyedWindowStage::new(
            window_schema(),
            result_schema(),
            vec![0],
            2,
            1,
            WindowType::Tumbling { size_ms: 10 },
            Aggregation::Sum,
        );
        let mut ctx = Collector::default();
        let mut worker = WorkerContext::new(0, Arc::new(manager.clone()));

        feed_buffer(&stage, &manager, &mut ctx, &mut worker, 0);
        assert!(ctx.is_empty(), "watermark 9 cannot fire a [0, 10) window");

        feed_buffer(&stage, &manager, &mut ctx, &mut worker, 10);
        let layout = RowLayout::new(result_schema());
        let rows = read_rows(&layout, ctx.take_one());
        assert_eq!(rows, vec![(0, 10, 1, 10)]);
    }

    #[test]
    fn sliding_window_shares_slices() {
        let manager = BufferManager::new(512, 8);
        let stage = KeyedWindowStage::new(
            window_schema(),
            result_schema(),
            vec![0],
            2,
            1,
            WindowType::Sliding {
                size_ms: 10,
                slide_ms: 5,
            },
            Aggregation::Sum,
        );
        let mut ctx = Collector::default();
        let mut worker = WorkerContext::new(0, Arc::new(manager.clone()));

        feed_buffer(&stage, &manager, &mut ctx, &mut worker, 0);
        feed_buffer(&stage, &manager, &mut ctx, &mut worker, 10);

        let layout = RowLayout::new(result_schema());
        let rows = read_rows(&layout, ctx.take_one());
        assert_eq!(rows, vec![(0, 10, 1, 10), (5, 15, 1, 10)]);
    }

    #[test]
    fn composite_keys_aggregate_separately() {
        let input_schema = Schema::builder()
            .field("key", DataType::Int64)
            .field("value", DataType::Int64)
            .field("ts", DataType::UInt64)
            .build();
        let output_schema = Schema::builder()
            .field("start", DataType::UInt64)
            .field("end", DataType::UInt64)
            .field("key", DataType::Int64)
            .field("ts", DataType::UInt64)
            .field("value", DataType::Int64)
            .build();
        let manager = BufferManager::new(512, 8);
        let stage = KeyedWindowStage::new(
            input_schema.clone(),
            output_schema.clone(),
            vec![0, 2],
            2,
            1,
            WindowType::Tumbling { size_ms: 10 },
            Aggregation::Sum,
        );
        let mut ctx = Collector::default();
        let mut worker = WorkerContext::new(0, Arc::new(manager.clone()));

        let layout = RowLayout::new(input_schema);
        let mut input = layout.bind(manager.get_buffer_blocking()).unwrap();
        for ts in 0..10u64 {
            input.push_record(&[1i64.into(), 1i64.into(), ts.into()]).unwrap();
        }
        let buffer = input.into_buffer();
        buffer.set_watermark_ms(20);
        stage.execute(buffer, &mut ctx, &mut worker);

        // Keying by (key, ts) gives one group per timestamp.
        let out = RowLayout::new(output_schema).bind(ctx.take_one()).unwrap();
        assert_eq!(out.tuple_count(), 10);
        for i in 0..10 {
            assert_eq!(out.read::<i64>(i, 4).unwrap(), 1);
        }
    }

    #[test]
    fn count_aggregation_uses_u64() {
        let output_schema = Schema::builder()
            .field("start", DataType::UInt64)
            .field("end", DataType::UInt64)
            .field("key", DataType::Int64)
            .field("count", DataType::UInt64)
            .build();
        let manager = BufferManager::new(512, 8);
        let stage = KeyedWindowStage::new(
            window_schema(),
            output_schema.clone(),
            vec![0],
            2,
            1,
            WindowType::Tumbling { size_ms: 10 },
            Aggregation::Count,
        );
        let mut ctx = Collector::default();
        let mut worker = WorkerContext::new(0, Arc::new(manager.clone()));
        feed_buffer(&stage, &manager, &mut ctx, &mut worker, 0);
        feed_buffer(&stage, &manager, &mut ctx, &mut worker, 10);

        let out = RowLayout::new(output_schema).bind(ctx.take_one()).unwrap();
        assert_eq!(out.read::<u64>(0, 3).unwrap(), 10);
    }

    #[test]
    fn epoch_timestamps_fire_without_scanning_from_zero() {
        let manager = BufferManager::new(512, 8);
        let stage = KeyedWindowStage::new(
            window_schema(),
            result_schema(),
            vec![0],
            2,
            1,
            WindowType::Sliding {
                size_ms: 10,
                slide_ms: 5,
            },
            Aggregation::Sum,
        );
        let mut ctx = Collector::default();
        let mut worker = WorkerContext::new(0, Arc::new(manager.clone()));

        // Wall clock event time: the first window must be anchored at the
        // data, not stepped up from epoch 0.
        let base = 1_700_000_000_000u64;
        feed_buffer(&stage, &manager, &mut ctx, &mut worker, base);
        feed_buffer(&stage, &manager, &mut ctx, &mut worker, base + 10);

        let layout = RowLayout::new(result_schema());
        let rows = read_rows(&layout, ctx.take_one());
        assert_eq!(
            rows,
            vec![(base, base + 10, 1, 10), (base + 5, base + 15, 1, 10)]
        );
    }

    #[test]
    fn regressing_watermarks_are_ignored() {
        let manager = BufferManager::new(512, 8);
        let stage = KeyedWindowStage::new(
            window_schema(),
            result_schema(),
            vec![0],
            2,
            1,
            WindowType::Tumbling { size_ms: 10 },
            Aggregation::Sum,
        );
        let mut ctx = Collector::default();
        let mut worker = WorkerContext::new(0, Arc::new(manager.clone()));

        feed_buffer(&stage, &manager, &mut ctx, &mut worker, 30);
        // Late buffer with a lower watermark; must not rewind the clock.
        let layout = RowLayout::new(window_schema());
        let mut input = layout.bind(manager.get_buffer_blocking()).unwrap();
        input.push_record(&[1i64.into(), 1i64.into(), 31u64.into()]).unwrap();
        let buffer = input.into_buffer();
        buffer.set_watermark_ms(5);
        stage.execute(buffer, &mut ctx, &mut worker);

        feed_buffer(&stage, &manager, &mut ctx, &mut worker, 40);
        let layout = RowLayout::new(result_schema());
        let rows = read_rows(&layout, ctx.take_one());
        assert_eq!(rows, vec![(30, 40, 1, 11)]);
    }
}
