//! Per worker execution state handed to every stage invocation.

use std::collections::HashMap;
use std::sync::Arc;

use rill_buffer::BufferProvider;
use rill_network::{ChannelRetryPolicy, NetworkChannel, NetworkError, NodeLocation, Partition};
use tracing::{debug, warn};

/// Thread local context of one worker (or one source thread). Holds the
/// worker's buffer pool and its lazily opened network channels, keyed by
/// partition.
pub struct WorkerContext {
    worker_id: usize,
    provider: Arc<dyn BufferProvider>,
    channels: HashMap<Partition, NetworkChannel>,
}

impl WorkerContext {
    pub(crate) fn new(worker_id: usize, provider: Arc<dyn BufferProvider>) -> Self {
        WorkerContext {
            worker_id,
            provider,
            channels: HashMap::new(),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// The pool stages draw output buffers from.
    pub fn buffer_provider(&self) -> &Arc<dyn BufferProvider> {
        &self.provider
    }

    /// The data channel of this worker towards `partition`, opened and
    /// registered on first use.
    pub fn network_channel(
        &mut self,
        remote: &NodeLocation,
        partition: Partition,
        policy: ChannelRetryPolicy,
    ) -> Result<&mut NetworkChannel, NetworkError> {
        if !self.channels.contains_key(&partition) {
            debug!(worker = self.worker_id, %partition, "opening worker channel");
            let channel = NetworkChannel::connect(remote, partition, policy)?;
            self.channels.insert(partition, channel);
        }
        Ok(self
            .channels
            .get_mut(&partition)
            .expect("channel inserted above"))
    }

    /// Close this worker's channel for `partition`, sending end of stream.
    pub fn close_network_channel(&mut self, partition: Partition) -> Result<(), NetworkError> {
        match self.channels.remove(&partition) {
            Some(channel) => channel.close(),
            None => Ok(()),
        }
    }

    /// Close every channel this worker opened for the given partitions.
    pub(crate) fn close_channels_for(&mut self, partitions: &[Partition]) {
        for partition in partitions {
            if let Err(err) = self.close_network_channel(*partition) {
                warn!(worker = self.worker_id, %partition, %err, "channel close failed");
            }
        }
    }
}
