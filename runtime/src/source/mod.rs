//! Data sources and their gathering strategies.
//!
//! Every thread driven source runs on its own runner thread, draws buffers
//! from its own bounded pool and hands filled buffers to the query manager
//! as tasks. Network sources are push driven and live on the receiver
//! side; see the query manager for their emitter.

use core::time::Duration;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rill_buffer::layout::{BoundLayout, BoundRowLayout, RowLayout};
use rill_buffer::{BufferError, BufferProvider, FixedSizeBufferPool, Schema, TupleBuffer};
use tracing::trace;

use crate::error::RuntimeError;
use crate::plan::ExecutableQueryPlan;

const STOP_POLL: Duration = Duration::from_millis(50);
const SLEEP_CHUNK: Duration = Duration::from_millis(5);

/// How a source paces its buffer production.
#[derive(Debug, Clone, Copy)]
pub enum GatheringMode {
    /// One buffer per tick.
    Interval(Duration),
    /// Average towards a target tuple rate.
    IngestionRate { tuples_per_second: u64 },
    /// Back off while the source pool drains, speed up while it idles.
    Adaptive,
}

/// Where the watermark of an emitted buffer comes from. Allowed lateness
/// is a property of the strategy alone; downstream windows only consult
/// the resulting watermark.
#[derive(Debug, Clone, Copy)]
pub enum WatermarkStrategy {
    /// Wall clock at buffer checkout.
    IngestionTime,
    /// Maximum of an event time field, held back by the allowed lateness.
    EventTime { field: usize, allowed_lateness_ms: u64 },
}

/// Cancellation probe handed into [`DataSource::receive`]. Sources poll it
/// between buffers; in-flight fills are never interrupted.
pub struct SourceControl {
    plan: Arc<ExecutableQueryPlan>,
}

impl SourceControl {
    pub(crate) fn new(plan: Arc<ExecutableQueryPlan>) -> Self {
        SourceControl { plan }
    }

    pub fn should_stop(&self) -> bool {
        self.plan.is_cancelled() || self.plan.soft_stop_requested()
    }
}

/// A pull driven stream input.
pub trait DataSource: Send {
    fn open(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Produce the next buffer. `Ok(None)` ends the stream; the runner then
    /// reports the source as finished.
    fn receive(&mut self, control: &SourceControl) -> Result<Option<TupleBuffer>, RuntimeError>;

    fn close(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// The source's bounded pool, sampled into the fixed-buffer statistic.
    fn fixed_pool(&self) -> Option<&FixedSizeBufferPool> {
        None
    }
}

/// Source generating buffers from a fill function, used by in-memory
/// scenarios and tests.
pub struct GeneratorSource<F> {
    layout: RowLayout,
    pool: FixedSizeBufferPool,
    mode: GatheringMode,
    watermark: WatermarkStrategy,
    origin_id: u64,
    buffers_to_produce: usize,
    produced: usize,
    produced_tuples: u64,
    next_sequence: u64,
    started: Option<Instant>,
    adaptive_pause: Duration,
    fill: F,
}

impl<F> GeneratorSource<F>
where
    F: FnMut(&mut BoundRowLayout, usize) -> Result<(), RuntimeError> + Send,
{
    /// `fill` receives the bound output buffer and the index of the buffer
    /// being produced; it pushes records and the source assigns metadata.
    pub fn new(
        schema: Schema,
        pool: FixedSizeBufferPool,
        buffers_to_produce: usize,
        mode: GatheringMode,
        watermark: WatermarkStrategy,
        origin_id: u64,
        fill: F,
    ) -> Self {
        GeneratorSource {
            layout: RowLayout::new(schema),
            pool,
            mode,
            watermark,
            origin_id,
            buffers_to_produce,
            produced: 0,
            produced_tuples: 0,
            next_sequence: 1,
            started: None,
            adaptive_pause: Duration::from_millis(1),
            fill,
        }
    }

    fn pace(&mut self, control: &SourceControl) {
        match self.mode {
            GatheringMode::Interval(tick) => {
                if self.produced > 0 {
                    sleep_chunked(tick, control);
                }
            }
            GatheringMode::IngestionRate { tuples_per_second } => {
                let started = *self.started.get_or_insert_with(Instant::now);
                if tuples_per_second == 0 {
                    return;
                }
                let target =
                    Duration::from_secs_f64(self.produced_tuples as f64 / tuples_per_second as f64);
                let elapsed = started.elapsed();
                if target > elapsed {
                    sleep_chunked(target - elapsed, control);
                }
            }
            GatheringMode::Adaptive => {
                // Track the pool: a draining pool means downstream is slow.
                if self.pool.available_buffers() * 2 < self.pool.capacity() {
                    self.adaptive_pause = (self.adaptive_pause * 2).min(Duration::from_millis(100));
                } else {
                    self.adaptive_pause = (self.adaptive_pause / 2).max(Duration::from_micros(250));
                }
                sleep_chunked(self.adaptive_pause, control);
            }
        }
    }

    fn assign_watermark(&self, bound: &BoundRowLayout) -> Result<(), RuntimeError> {
        if let WatermarkStrategy::EventTime {
            field,
            allowed_lateness_ms,
        } = self.watermark
        {
            let mut max_ts = 0u64;
            for row in 0..bound.tuple_count() {
                max_ts = max_ts.max(bound.read::<u64>(row, field)?);
            }
            bound
                .buffer()
                .set_watermark_ms(max_ts.saturating_sub(allowed_lateness_ms));
        }
        Ok(())
    }
}

fn sleep_chunked(total: Duration, control: &SourceControl) {
    let deadline = Instant::now() + total;
    loop {
        if control.should_stop() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_CHUNK));
    }
}

impl<F> DataSource for GeneratorSource<F>
where
    F: FnMut(&mut BoundRowLayout, usize) -> Result<(), RuntimeError> + Send,
{
    fn receive(&mut self, control: &SourceControl) -> Result<Option<TupleBuffer>, RuntimeError> {
        if self.produced >= self.buffers_to_produce {
            return Ok(None);
        }
        self.pace(control);

        let buffer = loop {
            if control.should_stop() {
                return Ok(None);
            }
            match self.pool.get_buffer_timeout(STOP_POLL) {
                Ok(buffer) => break buffer,
                Err(BufferError::PoolExhausted(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        };
        buffer.set_origin_id(self.origin_id);
        buffer.set_sequence_number(self.next_sequence);

        let mut bound = self.layout.bind(buffer)?;
        (self.fill)(&mut bound, self.produced)?;
        self.assign_watermark(&bound)?;

        self.next_sequence += 1;
        self.produced += 1;
        let buffer = bound.into_buffer();
        self.produced_tuples += buffer.number_of_tuples();
        trace!(
            produced = self.produced,
            tuples = buffer.number_of_tuples(),
            "generator buffer ready"
        );
        Ok(Some(buffer))
    }

    fn fixed_pool(&self) -> Option<&FixedSizeBufferPool> {
        Some(&self.pool)
    }
}
