//! Sink shipping buffers over a network channel to a remote partition.

use rill_buffer::{Schema, TupleBuffer};
use rill_network::{ChannelRetryPolicy, NodeLocation, Partition};
use tracing::debug;

use crate::error::RuntimeError;
use crate::worker::WorkerContext;

use super::Sink;

/// Ships the used region of every buffer to the consumer of `partition` on
/// `remote`. Channels are thread local: each worker opens its own on first
/// write and closes it with an end of stream frame during teardown.
pub struct NetworkSink {
    remote: NodeLocation,
    partition: Partition,
    tuple_size: usize,
    policy: ChannelRetryPolicy,
}

impl NetworkSink {
    pub fn new(
        remote: NodeLocation,
        partition: Partition,
        schema: &Schema,
        policy: ChannelRetryPolicy,
    ) -> Self {
        NetworkSink {
            remote,
            partition,
            tuple_size: schema.size_in_bytes(),
            policy,
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }
}

impl Sink for NetworkSink {
    fn write_data(
        &self,
        buffer: &TupleBuffer,
        worker: &mut WorkerContext,
    ) -> Result<(), RuntimeError> {
        let channel = worker.network_channel(&self.remote, self.partition, self.policy)?;
        channel.send_buffer(buffer, self.tuple_size)?;
        Ok(())
    }

    fn on_end_of_stream(&self, worker: &mut WorkerContext) -> Result<(), RuntimeError> {
        debug!(partition = %self.partition, "network sink end of stream");
        worker.close_network_channel(self.partition)?;
        Ok(())
    }
}
