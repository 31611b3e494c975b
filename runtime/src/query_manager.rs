//! Work stealing task scheduler.
//!
//! N worker threads, each with a local deque; sources inject into a global
//! queue, stages push follow-up tasks onto their worker's own deque, and
//! idle workers steal from peers in rotating order. Control messages ride
//! per-worker channels drained before data on every loop iteration.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, Sender, unbounded};
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use rill_buffer::{BufferManager, TupleBuffer};
use rill_network::DataEmitter;
use tracing::{debug, error, info, trace, warn};

use crate::error::StageError;
use crate::plan::{ExecutableQueryPlan, SourceSlot};
use crate::source::SourceControl;
use crate::stage::{ExecutionResult, PipelineContext};
use crate::task::{DataTask, Reconfiguration, WorkerCommand};
use crate::worker::WorkerContext;

const PARK_TIMEOUT: Duration = Duration::from_millis(20);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Owns the worker pool. One per node engine.
pub struct QueryManager {
    inner: Arc<QmInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct QmInner {
    injector: Injector<DataTask>,
    stealers: Box<[Stealer<DataTask>]>,
    controls: Box<[Sender<WorkerCommand>]>,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
    running: AtomicBool,
    buffers: BufferManager,
    worker_count: usize,
    buffers_per_worker: usize,
}

impl QueryManager {
    /// Spawn `worker_count` workers, each with a local pool of
    /// `buffers_per_worker` buffers drawn from the global manager.
    pub(crate) fn start(
        buffers: BufferManager,
        worker_count: usize,
        buffers_per_worker: usize,
    ) -> Self {
        assert!(worker_count > 0, "need at least one worker thread");
        let locals: Vec<Worker<DataTask>> = (0..worker_count).map(|_| Worker::new_fifo()).collect();
        let stealers: Box<[_]> = locals.iter().map(Worker::stealer).collect();
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..worker_count).map(|_| unbounded::<WorkerCommand>()).unzip();

        let inner = Arc::new(QmInner {
            injector: Injector::new(),
            stealers,
            controls: senders.into_boxed_slice(),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            running: AtomicBool::new(true),
            buffers,
            worker_count,
            buffers_per_worker,
        });

        let handles = locals
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(id, (local, control))| {
                let inner = inner.clone();
                thread::Builder::new()
                    .name(format!("rill-worker-{id}"))
                    .spawn(move || worker_loop(inner, id, local, control))
                    .expect("spawn worker thread")
            })
            .collect();
        info!(worker_count, "query manager started");
        QueryManager {
            inner,
            handles: Mutex::new(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    pub(crate) fn inner(&self) -> &Arc<QmInner> {
        &self.inner
    }

    /// Spawn the runner thread of one plan source slot.
    pub(crate) fn spawn_source(&self, plan: Arc<ExecutableQueryPlan>, slot: usize) {
        let inner = self.inner.clone();
        let name = format!("rill-source-{}-{slot}", plan.query_id());
        thread::Builder::new()
            .name(name)
            .spawn(move || source_runner(inner, plan, slot))
            .expect("spawn source thread");
    }

    /// Stop and join every worker. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            self.inner.broadcast_command(WorkerCommand::Stop);
            self.inner.notify_all();
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for QueryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl QmInner {
    /// Entry point for sources and network emitters.
    pub(crate) fn submit_data(
        &self,
        plan: &Arc<ExecutableQueryPlan>,
        pipeline: usize,
        buffer: TupleBuffer,
    ) {
        plan.inflight_inc();
        if let Some(stats) = plan.statistics() {
            stats.sample_emit(
                stats.source_slot(),
                self.injector.len() as u64,
                self.buffers.available_buffers() as u64,
                plan.fixed_pool_available(),
            );
        }
        self.injector.push(DataTask {
            plan: plan.clone(),
            pipeline,
            buffer,
        });
        self.notify_one();
    }

    /// A source slot stopped producing. The last one arms the drain check.
    pub(crate) fn source_finished(&self, plan: &Arc<ExecutableQueryPlan>, slot: usize) {
        if plan.sources()[slot].mark_finished() {
            plan.source_done();
            debug!(query = %plan.query_id(), slot, "source finished");
            self.maybe_request_drain(plan);
        }
    }

    /// When a plan has quiesced, queue the end-of-stream reconfiguration
    /// exactly once.
    pub(crate) fn maybe_request_drain(&self, plan: &Arc<ExecutableQueryPlan>) {
        if plan.ready_to_drain() && plan.request_drain() {
            debug!(query = %plan.query_id(), "plan quiesced, requesting drain");
            self.broadcast_reconfiguration(plan, Reconfiguration::HardEndOfStream);
        }
    }

    pub(crate) fn broadcast_reconfiguration(
        &self,
        plan: &Arc<ExecutableQueryPlan>,
        kind: Reconfiguration,
    ) {
        self.broadcast_command(WorkerCommand::Reconfigure {
            plan: plan.clone(),
            kind,
        });
        self.notify_all();
    }

    fn broadcast_command(&self, command: WorkerCommand) {
        for control in self.controls.iter() {
            let _ = control.send(command.clone());
        }
    }

    fn notify_one(&self) {
        drop(self.idle_lock.lock());
        self.idle_cv.notify_one();
    }

    fn notify_all(&self) {
        drop(self.idle_lock.lock());
        self.idle_cv.notify_all();
    }
}

/// What a pipeline invocation consumes.
enum Input {
    Buffer(TupleBuffer),
    Flush,
}

/// Collects stage emissions; the scheduler routes them after the stage
/// returns.
#[derive(Default)]
struct EmitCollector {
    emitted: Vec<TupleBuffer>,
}

impl PipelineContext for EmitCollector {
    fn emit_buffer(&mut self, buffer: TupleBuffer) {
        self.emitted.push(buffer);
    }
}

fn worker_loop(inner: Arc<QmInner>, id: usize, local: Worker<DataTask>, control: Receiver<WorkerCommand>) {
    let provider = Arc::new(
        inner
            .buffers
            .create_local_buffer_pool(inner.buffers_per_worker, true),
    );
    let mut ctx = WorkerContext::new(id, provider);
    debug!(worker = id, "worker online");

    loop {
        while let Ok(command) = control.try_recv() {
            match command {
                WorkerCommand::Stop => {
                    debug!(worker = id, "worker stopping");
                    return;
                }
                WorkerCommand::Reconfigure { plan, kind } => {
                    handle_reconfiguration(&inner, &plan, kind, &mut ctx, id);
                }
            }
        }
        if !inner.running.load(Ordering::Acquire) {
            return;
        }

        match find_task(&local, &inner, id) {
            Some(task) => run_data_task(&inner, task, &mut ctx, &local, id),
            None => park(&inner, &control, id),
        }
    }
}

fn park(inner: &QmInner, control: &Receiver<WorkerCommand>, _id: usize) {
    let mut guard = inner.idle_lock.lock();
    if !inner.injector.is_empty() || !control.is_empty() || !inner.running.load(Ordering::Acquire) {
        return;
    }
    // Timed wait: stealable work on peer deques sends no signal.
    inner.idle_cv.wait_for(&mut guard, PARK_TIMEOUT);
}

fn find_task(local: &Worker<DataTask>, inner: &QmInner, id: usize) -> Option<DataTask> {
    if let Some(task) = local.pop() {
        return Some(task);
    }
    loop {
        match inner.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }
    let n = inner.stealers.len();
    for k in 1..n {
        let peer = (id + k) % n;
        loop {
            match inner.stealers[peer].steal() {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }
    None
}

fn run_data_task(
    inner: &QmInner,
    task: DataTask,
    ctx: &mut WorkerContext,
    local: &Worker<DataTask>,
    id: usize,
) {
    let DataTask {
        plan,
        pipeline,
        buffer,
    } = task;
    if plan.is_cancelled() || !plan.is_running() {
        trace!(query = %plan.query_id(), "dropping task of inactive plan");
        drop(buffer);
    } else {
        let tuples = buffer.number_of_tuples();
        let watermark = buffer.watermark_ms();
        run_pipeline(inner, &plan, pipeline, Input::Buffer(buffer), ctx, Some(local), id);
        if let Some(stats) = plan.statistics() {
            stats.record_task(id, 1, tuples, now_millis().saturating_sub(watermark));
        }
    }
    plan.inflight_dec();
    inner.maybe_request_drain(&plan);
}

fn handle_reconfiguration(
    inner: &QmInner,
    plan: &Arc<ExecutableQueryPlan>,
    kind: Reconfiguration,
    ctx: &mut WorkerContext,
    id: usize,
) {
    trace!(worker = id, query = %plan.query_id(), ?kind, "reconfiguration");
    match kind {
        Reconfiguration::Initialize | Reconfiguration::SoftEndOfStream => {}
        Reconfiguration::HardEndOfStream => {
            if plan.claim_drain() {
                if !plan.is_cancelled() {
                    flush_cascade(inner, plan, ctx, id);
                }
                inner.broadcast_reconfiguration(plan, Reconfiguration::Destroy);
                plan.mark_finished();
            }
        }
        Reconfiguration::Destroy => {
            ctx.close_channels_for(plan.sink_partitions());
        }
    }
}

/// Flush every pipeline in DAG order. Residual buffers run through their
/// successors inline, so a downstream pipeline sees all data before its
/// own flush.
fn flush_cascade(inner: &QmInner, plan: &Arc<ExecutableQueryPlan>, ctx: &mut WorkerContext, id: usize) {
    debug!(query = %plan.query_id(), "flushing pipelines");
    for &idx in plan.flush_order() {
        run_pipeline(inner, plan, idx, Input::Flush, ctx, None, id);
    }
}

fn run_pipeline(
    inner: &QmInner,
    plan: &Arc<ExecutableQueryPlan>,
    index: usize,
    input: Input,
    ctx: &mut WorkerContext,
    local: Option<&Worker<DataTask>>,
    id: usize,
) {
    let pipeline = plan.pipeline(index);
    let stage = pipeline.stage();
    let mut collector = EmitCollector::default();

    let result = match input {
        Input::Buffer(buffer) => {
            if buffer.number_of_tuples() == 0 && !stage.accepts_empty_buffers() {
                return;
            }
            stage.execute(buffer, &mut collector, ctx)
        }
        Input::Flush => stage.flush(&mut collector, ctx),
    };
    match result {
        ExecutionResult::Ok | ExecutionResult::Finished => {}
        ExecutionResult::Error(error) => {
            warn!(query = %plan.query_id(), pipeline = index, stage = stage.name(), %error, "stage failed");
            plan.fail(error);
            return;
        }
    }

    let successors = pipeline.successors();
    for buffer in collector.emitted {
        if let Some(stats) = plan.statistics() {
            stats.sample_emit(
                id,
                inner.injector.len() as u64,
                inner.buffers.available_buffers() as u64,
                plan.fixed_pool_available(),
            );
        }
        let Some((&last, rest)) = successors.split_last() else {
            // A terminal stage emitted; nothing is downstream to take it.
            drop(buffer);
            continue;
        };
        for &succ in rest {
            dispatch(inner, plan, succ, buffer.clone(), ctx, local, id);
        }
        dispatch(inner, plan, last, buffer, ctx, local, id);
    }
}

fn dispatch(
    inner: &QmInner,
    plan: &Arc<ExecutableQueryPlan>,
    pipeline: usize,
    buffer: TupleBuffer,
    ctx: &mut WorkerContext,
    local: Option<&Worker<DataTask>>,
    id: usize,
) {
    match local {
        Some(local) => {
            if plan.is_cancelled() {
                drop(buffer);
                return;
            }
            plan.inflight_inc();
            local.push(DataTask {
                plan: plan.clone(),
                pipeline,
                buffer,
            });
            inner.notify_one();
        }
        // Inline execution: used by the flush cascade, where scheduling
        // would race the per-pipeline flush order.
        None => run_pipeline(inner, plan, pipeline, Input::Buffer(buffer), ctx, None, id),
    }
}

fn source_runner(inner: Arc<QmInner>, plan: Arc<ExecutableQueryPlan>, slot: usize) {
    let SourceSlot::Thread { source, target, .. } = &plan.sources()[slot] else {
        error!(query = %plan.query_id(), slot, "runner spawned for a push source");
        return;
    };
    let target = *target;
    let Some(mut source) = source.lock().take() else {
        warn!(query = %plan.query_id(), slot, "source already taken");
        return;
    };
    let control = SourceControl::new(plan.clone());

    if let Err(err) = source.open() {
        plan.fail(StageError::new(2, err.to_string()));
        inner.source_finished(&plan, slot);
        return;
    }
    debug!(query = %plan.query_id(), slot, "source running");
    loop {
        if control.should_stop() {
            break;
        }
        match source.receive(&control) {
            Ok(Some(buffer)) => inner.submit_data(&plan, target, buffer),
            Ok(None) => break,
            Err(err) => {
                plan.fail(StageError::new(2, err.to_string()));
                break;
            }
        }
    }
    if let Err(err) = source.close() {
        warn!(query = %plan.query_id(), slot, %err, "source close failed");
    }
    inner.source_finished(&plan, slot);
}

/// Consumer side of a network source: registered with the partition
/// manager, re-emits received buffers as tasks of the target pipeline.
pub(crate) struct NetworkSourceEmitter {
    inner: Arc<QmInner>,
    plan: Arc<ExecutableQueryPlan>,
    slot: usize,
    target: usize,
}

impl NetworkSourceEmitter {
    pub(crate) fn new(
        inner: Arc<QmInner>,
        plan: Arc<ExecutableQueryPlan>,
        slot: usize,
        target: usize,
    ) -> Self {
        NetworkSourceEmitter {
            inner,
            plan,
            slot,
            target,
        }
    }
}

impl DataEmitter for NetworkSourceEmitter {
    fn emit_buffer(&self, buffer: TupleBuffer) {
        if self.plan.is_running() && !self.plan.is_cancelled() {
            self.inner.submit_data(&self.plan, self.target, buffer);
        } else {
            trace!(query = %self.plan.query_id(), "dropping network buffer for inactive plan");
        }
    }

    fn on_end_of_stream(&self) {
        self.inner.source_finished(&self.plan, self.slot);
    }
}
