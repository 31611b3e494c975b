//! Executable query plans: a DAG of pipelines, its sources and its
//! lifecycle state machine.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use rill_buffer::{BufferProvider, FixedSizeBufferPool};
use rill_network::{Partition, QueryId};
use tracing::{debug, warn};

use crate::error::{RuntimeError, StageError};
use crate::pipeline::Pipeline;
use crate::sink::{Sink, SinkStage};
use crate::source::DataSource;
use crate::stage::PipelineStage;
use crate::statistics::{QueryStatistics, StatisticsSnapshot};

/// Identifier of the per-node fragment of a distributed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubPlanId(u64);

impl SubPlanId {
    pub const fn new(id: u64) -> Self {
        SubPlanId(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubPlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle of a plan. `ErrorState` is reachable from any running state;
/// every other transition is driven by engine calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionStatus {
    Created = 0,
    Deployed = 1,
    Running = 2,
    Stopped = 3,
    ErrorState = 4,
    Destroyed = 5,
}

impl ExecutionStatus {
    fn from_u8(raw: u8) -> ExecutionStatus {
        match raw {
            0 => ExecutionStatus::Created,
            1 => ExecutionStatus::Deployed,
            2 => ExecutionStatus::Running,
            3 => ExecutionStatus::Stopped,
            4 => ExecutionStatus::ErrorState,
            _ => ExecutionStatus::Destroyed,
        }
    }
}

/// A source attachment of a plan.
pub(crate) enum SourceSlot {
    /// Pull driven source running on its own thread.
    Thread {
        source: Mutex<Option<Box<dyn DataSource>>>,
        target: usize,
        finished: AtomicBool,
    },
    /// Push driven source fed by the network receiver.
    Network {
        partition: Partition,
        target: usize,
        finished: AtomicBool,
    },
}

impl SourceSlot {
    pub(crate) fn target(&self) -> usize {
        match self {
            SourceSlot::Thread { target, .. } | SourceSlot::Network { target, .. } => *target,
        }
    }

    /// Flip the finished flag; true on the first call only.
    pub(crate) fn mark_finished(&self) -> bool {
        let flag = match self {
            SourceSlot::Thread { finished, .. } | SourceSlot::Network { finished, .. } => finished,
        };
        !flag.swap(true, Ordering::AcqRel)
    }
}

/// One compiled query fragment resident on one node.
pub struct ExecutableQueryPlan {
    query_id: QueryId,
    sub_plan_id: SubPlanId,
    pipelines: Vec<Pipeline>,
    /// Pipeline indices in topological order, predecessors first.
    flush_order: Vec<usize>,
    sources: Vec<SourceSlot>,
    sink_partitions: Vec<Partition>,
    fixed_pools: Vec<FixedSizeBufferPool>,

    status: AtomicU8,
    cancelled: AtomicBool,
    soft_stop: AtomicBool,
    active_sources: AtomicUsize,
    inflight: AtomicUsize,
    drain_requested: AtomicBool,
    drained: AtomicBool,
    first_error: Mutex<Option<StageError>>,
    statistics: OnceLock<Arc<QueryStatistics>>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl ExecutableQueryPlan {
    pub fn builder(query_id: QueryId, sub_plan_id: SubPlanId) -> QueryPlanBuilder {
        QueryPlanBuilder {
            query_id,
            sub_plan_id,
            pipelines: Vec::new(),
            sources: Vec::new(),
            sink_partitions: Vec::new(),
            fixed_pools: Vec::new(),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn sub_plan_id(&self) -> SubPlanId {
        self.sub_plan_id
    }

    pub fn status(&self) -> ExecutionStatus {
        ExecutionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: ExecutionStatus, to: ExecutionStatus) -> Result<(), RuntimeError> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| debug!(query = %self.query_id, sub_plan = %self.sub_plan_id, ?from, ?to, "plan transition"))
            .map_err(|actual| RuntimeError::InvalidTransition {
                from: ExecutionStatus::from_u8(actual),
                to,
            })
    }

    /// Deploy: run `setup` on every stage. Leaves no partial state behind
    /// on failure; the plan stays `Created` and can be dropped.
    pub(crate) fn setup(&self) -> Result<(), RuntimeError> {
        if self.status() != ExecutionStatus::Created {
            return Err(RuntimeError::InvalidTransition {
                from: self.status(),
                to: ExecutionStatus::Deployed,
            });
        }
        for pipeline in &self.pipelines {
            pipeline.stage().setup().map_err(|error| {
                RuntimeError::QueryFailed {
                    query_id: self.query_id,
                    error,
                }
            })?;
        }
        self.transition(ExecutionStatus::Created, ExecutionStatus::Deployed)
    }

    pub(crate) fn start(&self) -> Result<(), RuntimeError> {
        self.transition(ExecutionStatus::Deployed, ExecutionStatus::Running)
    }

    pub(crate) fn destroy(&self) -> Result<(), RuntimeError> {
        let from = self.status();
        if !matches!(
            from,
            ExecutionStatus::Deployed | ExecutionStatus::Stopped | ExecutionStatus::ErrorState
        ) {
            return Err(RuntimeError::InvalidTransition {
                from,
                to: ExecutionStatus::Destroyed,
            });
        }
        for pipeline in &self.pipelines {
            if let Err(error) = pipeline.stage().shutdown() {
                warn!(query = %self.query_id, %error, "stage shutdown failed");
            }
        }
        self.transition(from, ExecutionStatus::Destroyed)
    }

    /// A stage failed: record the first error, move to `ErrorState` and
    /// cancel outstanding work of this plan only.
    pub(crate) fn fail(&self, error: StageError) {
        {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(error.clone());
            }
        }
        if self.transition(ExecutionStatus::Running, ExecutionStatus::ErrorState).is_ok() {
            warn!(query = %self.query_id, sub_plan = %self.sub_plan_id, %error, "plan entered error state");
        }
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn first_error(&self) -> Option<StageError> {
        self.first_error.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status() == ExecutionStatus::Running
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Cancellation flag observed by stages and sources between task
    /// boundaries; mid-execute work is never interrupted.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn request_soft_stop(&self) {
        self.soft_stop.store(true, Ordering::Release);
    }

    pub fn soft_stop_requested(&self) -> bool {
        self.soft_stop.load(Ordering::Acquire)
    }

    pub(crate) fn inflight_inc(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn inflight_dec(&self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn source_done(&self) {
        self.active_sources.fetch_sub(1, Ordering::AcqRel);
    }

    /// All sources done, nothing inflight, drain not yet requested.
    pub(crate) fn ready_to_drain(&self) -> bool {
        matches!(
            self.status(),
            ExecutionStatus::Running | ExecutionStatus::ErrorState
        ) && self.active_sources.load(Ordering::Acquire) == 0
            && self.inflight.load(Ordering::Acquire) == 0
            && !self.drain_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_drain(&self) -> bool {
        !self.drain_requested.swap(true, Ordering::AcqRel)
    }

    /// The flush cascade must run exactly once.
    pub(crate) fn claim_drain(&self) -> bool {
        !self.drained.swap(true, Ordering::AcqRel)
    }

    /// Quiesced: move a running plan to `Stopped` and wake completion
    /// waiters. An errored plan keeps `ErrorState`.
    pub(crate) fn mark_finished(&self) {
        let _ = self.transition(ExecutionStatus::Running, ExecutionStatus::Stopped);
        let mut done = self.done.lock();
        *done = true;
        self.done_cv.notify_all();
    }

    /// Wait until the plan quiesced (drained and stopped, or errored and
    /// drained). Returns false on timeout.
    pub fn wait_completed(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_cv.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    pub(crate) fn attach_statistics(&self, statistics: Arc<QueryStatistics>) {
        let _ = self.statistics.set(statistics);
    }

    pub(crate) fn statistics(&self) -> Option<&Arc<QueryStatistics>> {
        self.statistics.get()
    }

    pub fn statistics_snapshot(&self) -> StatisticsSnapshot {
        self.statistics
            .get()
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    pub(crate) fn pipeline(&self, index: usize) -> &Pipeline {
        &self.pipelines[index]
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub(crate) fn flush_order(&self) -> &[usize] {
        &self.flush_order
    }

    pub(crate) fn sources(&self) -> &[SourceSlot] {
        &self.sources
    }

    pub(crate) fn sink_partitions(&self) -> &[Partition] {
        &self.sink_partitions
    }

    /// Available buffers summed over the plan's fixed source pools.
    pub(crate) fn fixed_pool_available(&self) -> u64 {
        self.fixed_pools
            .iter()
            .map(|p| p.available_buffers() as u64)
            .sum()
    }
}

impl fmt::Debug for ExecutableQueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableQueryPlan")
            .field("query_id", &self.query_id)
            .field("sub_plan_id", &self.sub_plan_id)
            .field("status", &self.status())
            .field("pipelines", &self.pipelines.len())
            .field("sources", &self.sources.len())
            .finish()
    }
}

/// Assembles a plan; pipelines are added in any order, edges must form a
/// DAG.
pub struct QueryPlanBuilder {
    query_id: QueryId,
    sub_plan_id: SubPlanId,
    pipelines: Vec<Pipeline>,
    sources: Vec<SourceSlot>,
    sink_partitions: Vec<Partition>,
    fixed_pools: Vec<FixedSizeBufferPool>,
}

impl QueryPlanBuilder {
    /// Add a pipeline and return its index in the plan's pipeline table.
    pub fn add_pipeline<S>(&mut self, stage: S) -> usize
    where
        S: PipelineStage + 'static,
    {
        let id = self.pipelines.len();
        self.pipelines.push(Pipeline::new(id, Box::new(stage)));
        id
    }

    /// Terminal pipeline wrapping a sink.
    pub fn add_sink(&mut self, sink: Arc<dyn Sink>) -> usize {
        self.add_pipeline(SinkStage::new(sink))
    }

    /// Terminal network sink; its partition is remembered so workers can
    /// close their channels at teardown.
    pub fn add_network_sink(&mut self, sink: crate::sink::NetworkSink) -> usize {
        self.sink_partitions.push(sink.partition());
        self.add_pipeline(SinkStage::new(Arc::new(sink)))
    }

    /// Edge from `from` to `to`; `to` receives every buffer `from` emits.
    ///
    /// # Panics
    /// On unknown indices.
    pub fn connect(&mut self, from: usize, to: usize) {
        assert!(from < self.pipelines.len() && to < self.pipelines.len());
        self.pipelines[from].add_successor(to);
    }

    /// Attach a thread driven source feeding `target`.
    pub fn add_source<S>(&mut self, source: S, target: usize)
    where
        S: DataSource + 'static,
    {
        assert!(target < self.pipelines.len(), "unknown target pipeline");
        if let Some(pool) = source.fixed_pool() {
            self.fixed_pools.push(pool.clone());
        }
        self.sources.push(SourceSlot::Thread {
            source: Mutex::new(Some(Box::new(source))),
            target,
            finished: AtomicBool::new(false),
        });
    }

    /// Attach a network source consuming `partition` and feeding `target`.
    pub fn add_network_source(&mut self, partition: Partition, target: usize) {
        assert!(target < self.pipelines.len(), "unknown target pipeline");
        self.sources.push(SourceSlot::Network {
            partition,
            target,
            finished: AtomicBool::new(false),
        });
    }

    /// # Panics
    /// When the plan has no source or the pipeline graph has a cycle.
    pub fn build(self) -> Arc<ExecutableQueryPlan> {
        assert!(!self.sources.is_empty(), "plan needs at least one source");
        let flush_order = topological_order(&self.pipelines);
        let active = self.sources.len();
        Arc::new(ExecutableQueryPlan {
            query_id: self.query_id,
            sub_plan_id: self.sub_plan_id,
            pipelines: self.pipelines,
            flush_order,
            sources: self.sources,
            sink_partitions: self.sink_partitions,
            fixed_pools: self.fixed_pools,
            status: AtomicU8::new(ExecutionStatus::Created as u8),
            cancelled: AtomicBool::new(false),
            soft_stop: AtomicBool::new(false),
            active_sources: AtomicUsize::new(active),
            inflight: AtomicUsize::new(0),
            drain_requested: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            first_error: Mutex::new(None),
            statistics: OnceLock::new(),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        })
    }
}

fn topological_order(pipelines: &[Pipeline]) -> Vec<usize> {
    let mut indegree = vec![0usize; pipelines.len()];
    for pipeline in pipelines {
        for &succ in pipeline.successors() {
            indegree[succ] += 1;
        }
    }
    let mut queue: Vec<usize> = indegree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(pipelines.len());
    while let Some(idx) = queue.pop() {
        order.push(idx);
        for &succ in pipelines[idx].successors() {
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                queue.push(succ);
            }
        }
    }
    assert_eq!(order.len(), pipelines.len(), "pipeline graph must be acyclic");
    order
}

#[cfg(test)]
mod test {
    use rill_buffer::TupleBuffer;

    use crate::stage::{ExecutionResult, PipelineContext, PipelineStage};
    use crate::worker::WorkerContext;

    use super::*;

    struct PassThrough;

    impl PipelineStage for PassThrough {
        fn execute(
            &self,
            buffer: TupleBuffer,
            ctx: &mut dyn PipelineContext,
            _worker: &mut WorkerContext,
        ) -> ExecutionResult {
            ctx.emit_buffer(buffer);
            ExecutionResult::Ok
        }
    }

    struct NeverCalled;

    impl crate::source::DataSource for NeverCalled {
        fn receive(
            &mut self,
            _control: &crate::source::SourceControl,
        ) -> Result<Option<TupleBuffer>, crate::error::RuntimeError> {
            Ok(None)
        }
    }

    fn diamond_plan() -> Arc<ExecutableQueryPlan> {
        let mut builder = ExecutableQueryPlan::builder(QueryId::new(1), SubPlanId::new(0));
        let a = builder.add_pipeline(PassThrough);
        let b = builder.add_pipeline(PassThrough);
        let c = builder.add_pipeline(PassThrough);
        let d = builder.add_pipeline(PassThrough);
        builder.connect(a, b);
        builder.connect(a, c);
        builder.connect(b, d);
        builder.connect(c, d);
        builder.add_source(NeverCalled, a);
        builder.build()
    }

    #[test]
    fn flush_order_is_topological() {
        let plan = diamond_plan();
        let order = plan.flush_order();
        let pos = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(0) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(3));
    }

    #[test]
    fn lifecycle_transitions() {
        let plan = diamond_plan();
        assert_eq!(plan.status(), ExecutionStatus::Created);
        plan.setup().unwrap();
        assert_eq!(plan.status(), ExecutionStatus::Deployed);
        assert!(plan.start().is_ok());
        assert!(matches!(
            plan.start(),
            Err(RuntimeError::InvalidTransition { .. })
        ));
        plan.fail(StageError::new(9, "boom"));
        assert_eq!(plan.status(), ExecutionStatus::ErrorState);
        assert!(plan.is_cancelled());
        plan.destroy().unwrap();
        assert_eq!(plan.status(), ExecutionStatus::Destroyed);
    }

    #[test]
    fn destroy_requires_stop() {
        let plan = diamond_plan();
        plan.setup().unwrap();
        plan.start().unwrap();
        assert!(matches!(
            plan.destroy(),
            Err(RuntimeError::InvalidTransition { .. })
        ));
    }
}
