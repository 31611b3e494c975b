//! Per query runtime counters.
//!
//! Every worker owns its own cell block; reads sum over all cells, so the
//! hot path never touches a shared counter. Source threads share one extra
//! cell block past the worker range.

use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

#[derive(Default)]
struct Cells {
    processed_tasks: AtomicU64,
    processed_buffers: AtomicU64,
    processed_tuples: AtomicU64,
    latency_sum_ms: AtomicU64,
    queue_size_sum: AtomicU64,
    available_global_sum: AtomicU64,
    available_fixed_sum: AtomicU64,
}

/// Counters of one query on one node.
pub struct QueryStatistics {
    cells: Box<[CachePadded<Cells>]>,
}

/// Point in time view, summed over all workers. All counters are monotone
/// while the query runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub processed_tasks: u64,
    pub processed_buffers: u64,
    pub processed_tuples: u64,
    /// Sum of `completion wall time - buffer watermark` in milliseconds.
    pub latency_sum_ms: u64,
    /// Queue length sampled on every buffer emission.
    pub queue_size_sum: u64,
    pub available_global_buffer_sum: u64,
    pub available_fixed_buffer_sum: u64,
}

impl QueryStatistics {
    /// `workers` cell blocks plus one shared block for source threads.
    pub(crate) fn new(workers: usize) -> Self {
        QueryStatistics {
            cells: (0..workers + 1).map(|_| CachePadded::default()).collect(),
        }
    }

    pub(crate) fn source_slot(&self) -> usize {
        self.cells.len() - 1
    }

    pub(crate) fn record_task(&self, slot: usize, buffers: u64, tuples: u64, latency_ms: u64) {
        let cells = &self.cells[slot];
        cells.processed_tasks.fetch_add(1, Ordering::Relaxed);
        cells.processed_buffers.fetch_add(buffers, Ordering::Relaxed);
        cells.processed_tuples.fetch_add(tuples, Ordering::Relaxed);
        cells.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub(crate) fn sample_emit(
        &self,
        slot: usize,
        queue_size: u64,
        available_global: u64,
        available_fixed: u64,
    ) {
        let cells = &self.cells[slot];
        cells.queue_size_sum.fetch_add(queue_size, Ordering::Relaxed);
        cells
            .available_global_sum
            .fetch_add(available_global, Ordering::Relaxed);
        cells
            .available_fixed_sum
            .fetch_add(available_fixed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let mut out = StatisticsSnapshot::default();
        for cells in self.cells.iter() {
            out.processed_tasks += cells.processed_tasks.load(Ordering::Relaxed);
            out.processed_buffers += cells.processed_buffers.load(Ordering::Relaxed);
            out.processed_tuples += cells.processed_tuples.load(Ordering::Relaxed);
            out.latency_sum_ms += cells.latency_sum_ms.load(Ordering::Relaxed);
            out.queue_size_sum += cells.queue_size_sum.load(Ordering::Relaxed);
            out.available_global_buffer_sum += cells.available_global_sum.load(Ordering::Relaxed);
            out.available_fixed_buffer_sum += cells.available_fixed_sum.load(Ordering::Relaxed);
        }
        out
    }
}
