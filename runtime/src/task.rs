//! Scheduling units.

use std::sync::Arc;

use rill_buffer::TupleBuffer;

use crate::plan::ExecutableQueryPlan;

/// One buffer bound for one pipeline of one plan. FIFO per worker queue,
/// work stealing across workers, no priorities.
pub(crate) struct DataTask {
    pub plan: Arc<ExecutableQueryPlan>,
    pub pipeline: usize,
    pub buffer: TupleBuffer,
}

/// Control messages, dequeued preferentially over data tasks on every
/// worker loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfiguration {
    /// Plan started; workers may warm per-plan state.
    Initialize,
    /// Sources asked to wind down; inflight data keeps draining.
    SoftEndOfStream,
    /// All sources done and no task inflight: flush the DAG in order.
    HardEndOfStream,
    /// Plan finished; workers drop their per-plan state such as network
    /// channels.
    Destroy,
}

#[derive(Clone)]
pub(crate) enum WorkerCommand {
    Reconfigure {
        plan: Arc<ExecutableQueryPlan>,
        kind: Reconfiguration,
    },
    Stop,
}
