//! Composition root of one node.
//!
//! Owns the buffer manager, partition registry, network manager and query
//! manager, constructed in exactly that order, and drives query lifecycles
//! against them. None of the managers is process global.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use rill_buffer::BufferManager;
use rill_network::{
    ExchangeListener, NetworkError, NetworkManager, NodeLocation, Partition, PartitionManager,
    QueryId,
};
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::plan::{ExecutableQueryPlan, ExecutionStatus, SourceSlot};
use crate::query_manager::{NetworkSourceEmitter, QueryManager};
use crate::statistics::{QueryStatistics, StatisticsSnapshot};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const FORCED_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine configuration with workable defaults for a single node
/// deployment.
pub struct NodeEngineBuilder {
    node_id: u64,
    host: String,
    data_port: u16,
    worker_threads: usize,
    buffers_in_global_pool: usize,
    buffers_per_worker: usize,
    buffers_per_source: usize,
    buffer_size_bytes: usize,
}

impl Default for NodeEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeEngineBuilder {
    pub fn new() -> Self {
        NodeEngineBuilder {
            node_id: 0,
            host: "127.0.0.1".into(),
            data_port: 0,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            buffers_in_global_pool: 1024,
            buffers_per_worker: 128,
            buffers_per_source: 64,
            buffer_size_bytes: 32 * 1024,
        }
    }

    pub fn node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port 0 binds an ephemeral port, reported by
    /// [`NodeEngine::location`].
    pub fn data_port(mut self, port: u16) -> Self {
        self.data_port = port;
        self
    }

    /// # Panics
    /// When given 0 worker threads.
    pub fn worker_threads(mut self, count: usize) -> Self {
        assert_ne!(count, 0, "there must be at least one worker thread");
        self.worker_threads = count;
        self
    }

    pub fn buffers_in_global_pool(mut self, count: usize) -> Self {
        self.buffers_in_global_pool = count;
        self
    }

    pub fn buffers_per_worker(mut self, count: usize) -> Self {
        self.buffers_per_worker = count;
        self
    }

    pub fn buffers_per_source(mut self, count: usize) -> Self {
        self.buffers_per_source = count;
        self
    }

    pub fn buffer_size_bytes(mut self, size: usize) -> Self {
        self.buffer_size_bytes = size;
        self
    }

    /// Construction order is fixed: buffer manager, partition manager,
    /// network manager, query manager.
    pub fn build(self) -> Result<NodeEngine, RuntimeError> {
        let buffers = BufferManager::new(self.buffer_size_bytes, self.buffers_in_global_pool);
        let partitions = Arc::new(PartitionManager::new());
        let listener = Arc::new(EngineExchangeListener::default());
        let network = NetworkManager::start(
            NodeLocation::new(self.node_id, self.host, self.data_port),
            partitions.clone(),
            listener.clone(),
            Arc::new(buffers.clone()),
        )?;
        let query_manager = QueryManager::start(
            buffers.clone(),
            self.worker_threads,
            self.buffers_per_worker,
        );

        let location = network.location().clone();
        let inner = Arc::new(EngineInner {
            buffers,
            partitions,
            location,
            network: Mutex::new(Some(network)),
            query_manager,
            plans: DashMap::new(),
            buffers_per_source: self.buffers_per_source,
            listener: listener.clone(),
            stopped: AtomicBool::new(false),
        });
        listener.bind(Arc::downgrade(&inner));
        info!(location = %inner.location, "node engine up");
        Ok(NodeEngine { inner })
    }
}

pub(crate) struct EngineInner {
    buffers: BufferManager,
    partitions: Arc<PartitionManager>,
    location: NodeLocation,
    network: Mutex<Option<NetworkManager>>,
    query_manager: QueryManager,
    plans: DashMap<QueryId, Vec<Arc<ExecutableQueryPlan>>>,
    buffers_per_source: usize,
    listener: Arc<EngineExchangeListener>,
    stopped: AtomicBool,
}

impl EngineInner {
    fn unregister_network_sources(&self, plan: &ExecutableQueryPlan) {
        let network = self.network.lock();
        let Some(network) = network.as_ref() else {
            return;
        };
        for slot in plan.sources() {
            if let SourceSlot::Network { partition, .. } = slot {
                if network.unregister_subpartition_consumer(*partition) {
                    debug!(%partition, "network source unregistered");
                }
            }
        }
    }
}

/// Wire level callbacks into the engine. Holds only a weak reference; the
/// network manager must never keep the engine alive.
#[derive(Default)]
struct EngineExchangeListener {
    inner: OnceLock<Weak<EngineInner>>,
    server_errors: AtomicU64,
}

impl EngineExchangeListener {
    fn bind(&self, inner: Weak<EngineInner>) {
        let _ = self.inner.set(inner);
    }

    fn engine(&self) -> Option<Arc<EngineInner>> {
        self.inner.get().and_then(Weak::upgrade)
    }
}

impl ExchangeListener for EngineExchangeListener {
    fn on_end_of_stream(&self, partition: Partition) {
        debug!(%partition, "wire end of stream");
    }

    fn on_server_error(&self, error: &NetworkError) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
        match error {
            NetworkError::PartitionNotRegistered(partition) => {
                // Expected while a producer races its consumer's
                // registration; the producer retries.
                debug!(%partition, "frame for unregistered partition");
            }
            _ => match self.engine() {
                Some(engine) => {
                    warn!(node = %engine.location, %error, "server side network error");
                }
                None => warn!(%error, "server side network error after engine teardown"),
            },
        }
    }

    fn on_channel_error(&self, error: &NetworkError) {
        warn!(%error, "channel error");
    }
}

/// One node of the engine: registration, lifecycle and teardown of query
/// plans.
pub struct NodeEngine {
    inner: Arc<EngineInner>,
}

impl NodeEngine {
    pub fn builder() -> NodeEngineBuilder {
        NodeEngineBuilder::new()
    }

    /// The data endpoint of this node, with the actually bound port.
    pub fn location(&self) -> &NodeLocation {
        &self.inner.location
    }

    pub fn buffer_manager(&self) -> &BufferManager {
        &self.inner.buffers
    }

    pub fn partition_manager(&self) -> &Arc<PartitionManager> {
        &self.inner.partitions
    }

    /// Wire level errors observed by the receiver since startup.
    pub fn server_error_count(&self) -> u64 {
        self.inner.listener.server_errors.load(Ordering::Relaxed)
    }

    /// Pool of `buffers_per_source` buffers for one bounded source.
    pub fn create_source_pool(&self) -> rill_buffer::FixedSizeBufferPool {
        self.inner
            .buffers
            .create_fixed_size_buffer_pool(self.inner.buffers_per_source)
    }

    /// Validate and deploy a plan: every stage's `setup` runs, the plan
    /// moves `Created -> Deployed`. Failure leaves no partial state.
    pub fn register_query(&self, plan: Arc<ExecutableQueryPlan>) -> Result<(), RuntimeError> {
        plan.setup()?;
        plan.attach_statistics(Arc::new(QueryStatistics::new(
            self.inner.query_manager.worker_count(),
        )));
        self.inner
            .plans
            .entry(plan.query_id())
            .or_default()
            .push(plan.clone());
        info!(query = %plan.query_id(), sub_plan = %plan.sub_plan_id(), "query registered");
        Ok(())
    }

    fn plans_of(&self, query_id: QueryId) -> Result<Vec<Arc<ExecutableQueryPlan>>, RuntimeError> {
        self.inner
            .plans
            .get(&query_id)
            .map(|p| p.clone())
            .ok_or(RuntimeError::UnknownQuery(query_id))
    }

    /// `Deployed -> Running`: start source threads and register network
    /// source consumers.
    pub fn start_query(&self, query_id: QueryId) -> Result<(), RuntimeError> {
        for plan in self.plans_of(query_id)? {
            plan.start()?;
            self.inner
                .query_manager
                .inner()
                .broadcast_reconfiguration(&plan, crate::task::Reconfiguration::Initialize);
            for (slot, source) in plan.sources().iter().enumerate() {
                match source {
                    SourceSlot::Thread { .. } => {
                        self.inner.query_manager.spawn_source(plan.clone(), slot);
                    }
                    SourceSlot::Network { partition, target, .. } => {
                        let emitter = Arc::new(NetworkSourceEmitter::new(
                            self.inner.query_manager.inner().clone(),
                            plan.clone(),
                            slot,
                            *target,
                        ));
                        let registered = {
                            let network = self.inner.network.lock();
                            network
                                .as_ref()
                                .map(|n| n.register_subpartition_consumer(*partition, emitter))
                                .unwrap_or(false)
                        };
                        if !registered {
                            plan.fail(crate::error::StageError::new(
                                5,
                                format!("network source partition {partition} rejected"),
                            ));
                        }
                    }
                }
            }
            info!(query = %query_id, "query started");
        }
        Ok(())
    }

    /// `Running -> Stopped`. `hard` cancels inflight work; otherwise the
    /// plan drains inflight tasks, flushes and stops, escalating to a
    /// cancel when the drain exceeds its timeout.
    pub fn stop_query(&self, query_id: QueryId, hard: bool) -> Result<(), RuntimeError> {
        for plan in self.plans_of(query_id)? {
            // Only a running (or errored) plan has work to drain.
            if !matches!(
                plan.status(),
                ExecutionStatus::Running | ExecutionStatus::ErrorState
            ) {
                continue;
            }
            if hard {
                plan.cancel();
            } else {
                plan.request_soft_stop();
                self.inner
                    .query_manager
                    .inner()
                    .broadcast_reconfiguration(&plan, crate::task::Reconfiguration::SoftEndOfStream);
            }
            // Push sources cannot observe the stop flag; cut them off and
            // drain what already arrived.
            for (slot, source) in plan.sources().iter().enumerate() {
                if matches!(source, SourceSlot::Network { .. }) {
                    self.inner
                        .query_manager
                        .inner()
                        .source_finished(&plan, slot);
                }
            }
            self.inner.unregister_network_sources(&plan);

            if !plan.wait_completed(DEFAULT_STOP_TIMEOUT) {
                warn!(query = %query_id, "drain timed out, forcing cancellation");
                plan.cancel();
                self.inner.query_manager.inner().maybe_request_drain(&plan);
                if !plan.wait_completed(FORCED_STOP_TIMEOUT) {
                    warn!(query = %query_id, "plan did not quiesce within the forced timeout");
                }
            }
            info!(query = %query_id, status = ?plan.status(), "query stopped");
        }
        Ok(())
    }

    /// `Stopped -> Destroyed`: shut stages down and release the plan.
    pub fn undeploy_query(&self, query_id: QueryId) -> Result<(), RuntimeError> {
        let (_, plans) = self
            .inner
            .plans
            .remove(&query_id)
            .ok_or(RuntimeError::UnknownQuery(query_id))?;
        for plan in plans {
            self.inner.unregister_network_sources(&plan);
            plan.destroy()?;
            info!(query = %query_id, "query undeployed");
        }
        Ok(())
    }

    pub fn query_status(&self, query_id: QueryId) -> Result<Vec<ExecutionStatus>, RuntimeError> {
        Ok(self.plans_of(query_id)?.iter().map(|p| p.status()).collect())
    }

    /// Per subplan counters of one query.
    pub fn query_statistics(&self, query_id: QueryId) -> Result<Vec<StatisticsSnapshot>, RuntimeError> {
        Ok(self
            .plans_of(query_id)?
            .iter()
            .map(|p| p.statistics_snapshot())
            .collect())
    }

    pub fn first_error(&self, query_id: QueryId) -> Result<Option<crate::error::StageError>, RuntimeError> {
        Ok(self
            .plans_of(query_id)?
            .iter()
            .find_map(|p| p.first_error()))
    }

    /// Tear everything down in reverse dependency order: queries, query
    /// manager, network. Idempotent; completes in bounded time even for
    /// stuck queries through the forced drain.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let query_ids: Vec<QueryId> = self.inner.plans.iter().map(|e| *e.key()).collect();
        for query_id in query_ids {
            if let Err(err) = self.stop_query(query_id, false) {
                warn!(query = %query_id, %err, "stop during engine shutdown failed");
            }
            if let Err(err) = self.undeploy_query(query_id) {
                warn!(query = %query_id, %err, "undeploy during engine shutdown failed");
            }
        }
        self.inner.query_manager.shutdown();
        if let Some(mut network) = self.inner.network.lock().take() {
            network.shutdown();
        }
        info!("node engine stopped");
    }
}

impl Drop for NodeEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
