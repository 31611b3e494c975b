//! Network manager: owns the receiver thread and the partition registry
//! wiring of one node.

use std::sync::Arc;
use std::thread::JoinHandle;

use rill_buffer::BufferProvider;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::channel::{ChannelRetryPolicy, EventChannel, NetworkChannel};
use crate::error::NetworkError;
use crate::exchange::{ExchangeListener, ExchangeProtocol};
use crate::partition::{NodeLocation, Partition};
use crate::registry::{DataEmitter, EventListener, PartitionManager};
use crate::server;

/// Per node network endpoint. Started once by the engine; channels to
/// remote nodes are opened on demand by sinks.
pub struct NetworkManager {
    location: NodeLocation,
    partitions: Arc<PartitionManager>,
    shutdown: watch::Sender<bool>,
    io_thread: Option<JoinHandle<()>>,
}

impl NetworkManager {
    /// Bind the data port and spawn the receiver thread. Binding to port 0
    /// picks an ephemeral port, reflected in [`Self::location`].
    pub fn start(
        location: NodeLocation,
        partitions: Arc<PartitionManager>,
        listener: Arc<dyn ExchangeListener>,
        provider: Arc<dyn BufferProvider>,
    ) -> Result<Self, NetworkError> {
        let socket = server::bind(location.host(), location.data_port())?;
        let bound_port = socket.local_addr()?.port();
        let location = NodeLocation::new(location.node_id(), location.host(), bound_port);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let protocol = ExchangeProtocol::new(partitions.clone(), listener);
        let io_thread = server::spawn(socket, protocol, provider, shutdown_rx)?;
        info!(%location, "network manager started");
        Ok(NetworkManager {
            location,
            partitions,
            shutdown,
            io_thread: Some(io_thread),
        })
    }

    /// The local endpoint with the actually bound port.
    pub fn location(&self) -> &NodeLocation {
        &self.location
    }

    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    /// Install the consumer emitter of a partition hosted on this node.
    pub fn register_subpartition_consumer(
        &self,
        partition: Partition,
        emitter: Arc<dyn DataEmitter>,
    ) -> bool {
        self.partitions.register_consumer(partition, emitter)
    }

    pub fn unregister_subpartition_consumer(&self, partition: Partition) -> bool {
        self.partitions.unregister_consumer(partition)
    }

    /// Install the upstream event listener of a producer on this node.
    pub fn register_event_listener(&self, partition: Partition, listener: Arc<dyn EventListener>) {
        self.partitions.register_event_listener(partition, listener);
    }

    pub fn unregister_event_listener(&self, partition: Partition) {
        self.partitions.unregister_event_listener(partition);
    }

    /// Open a data channel to a partition consumer on a remote node.
    pub fn create_network_channel(
        &self,
        remote: &NodeLocation,
        partition: Partition,
        policy: ChannelRetryPolicy,
    ) -> Result<NetworkChannel, NetworkError> {
        NetworkChannel::connect(remote, partition, policy)
    }

    /// Open an event channel back to the node hosting a partition's
    /// producer.
    pub fn create_event_channel(
        &self,
        remote: &NodeLocation,
        partition: Partition,
        policy: ChannelRetryPolicy,
    ) -> Result<EventChannel, NetworkError> {
        EventChannel::connect(remote, partition, policy)
    }

    /// Stop accepting connections and join the receiver thread.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(io_thread) = self.io_thread.take() {
            let _ = self.shutdown.send(true);
            if io_thread.join().is_err() {
                warn!("network io thread panicked during shutdown");
            }
        }
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
